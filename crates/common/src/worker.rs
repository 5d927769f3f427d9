//! The single task that owns the [`Engine`].

use futures::StreamExt;

use crate::engine::{Engine, IngestOutcome};
use crate::jobs::{Job, JobReceiver, Snapshot};
use crate::store::ContentStore;

/// Process jobs until every dispatcher is dropped, then hand the engine back.
///
/// Jobs run strictly one after another. A failing job is logged and never
/// stops the worker.
///
/// ```ignore
/// let (dispatcher, receiver) = JobDispatcher::new();
/// let worker = tokio::spawn(run_worker(engine, receiver));
/// dispatcher.dispatch_startup_scan()?;
/// ```
pub async fn run_worker<S: ContentStore>(
    mut engine: Engine<S>,
    receiver: JobReceiver,
) -> Engine<S> {
    tracing::info!("Starting engine worker");
    let mut stream = receiver.into_async();

    while let Some(job) = stream.next().await {
        tracing::debug!(job = job.kind(), "Processing job");
        handle(&mut engine, job).await;
    }

    tracing::info!("Engine worker stopped, all dispatchers dropped");
    engine
}

async fn handle<S: ContentStore>(engine: &mut Engine<S>, job: Job) {
    match job {
        Job::Ingest { path } => match engine.ingest(&path).await {
            Ok(IngestOutcome::Ingested(report)) => tracing::info!(
                path = %path.display(),
                entries = report.entries.len(),
                fetched = report.sync.fetched,
                consumed = report.consumed,
                "Ingest job completed"
            ),
            Ok(IngestOutcome::Dropped(reason)) => {
                tracing::debug!(path = %path.display(), ?reason, "Ingest job dropped")
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Ingest job failed")
            }
        },
        Job::Tombstone { path } => match engine.tombstone(&path) {
            Ok(Some(key)) => tracing::info!(path = %key, "Recorded deletion from mirror"),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to record deletion")
            }
        },
        Job::Sync => {
            engine.sync().await;
        }
        Job::Audit => {
            if let Err(e) = engine.audit().await {
                tracing::error!(error = %e, "Pin audit failed");
            }
        }
        Job::Periodic { claim } => {
            // ticks arriving during this pass may queue the next one
            drop(claim);
            if let Err(e) = engine.audit().await {
                tracing::error!(error = %e, "Pin audit failed");
            }
            engine.sync().await;
        }
        Job::StartupScan => {
            engine.startup_scan().await;
        }
        Job::Snapshot { reply } => {
            let snapshot = Snapshot {
                mapping: engine.mapping().clone(),
                ledger: engine.ledger().clone(),
            };
            // the requester may have given up; nothing to do then
            let _ = reply.send(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testkit::*;
    use crate::jobs::JobDispatcher;

    #[tokio::test]
    async fn test_worker_serializes_jobs_and_returns_engine() {
        let fx = Fixture::new();
        let a = fx.write_source("a.txt", b"alpha");
        let (dispatcher, receiver) = JobDispatcher::new();
        let worker = tokio::spawn(run_worker(fx.engine(), receiver));

        dispatcher.dispatch_ingest(&a).unwrap();
        dispatcher
            .dispatch_tombstone(fx.mirror().join("a.txt"))
            .unwrap();
        let snapshot = dispatcher.snapshot().await.unwrap();

        assert!(snapshot.mapping.contains(&key("a.txt")));
        assert!(snapshot.ledger.contains(&key("a.txt")));

        drop(dispatcher);
        let engine = worker.await.unwrap();
        assert_eq!(engine.mapping().len(), 1);
    }

    #[tokio::test]
    async fn test_periodic_job_syncs_and_releases_claim() {
        let fx = Fixture::new();
        let (dispatcher, receiver) = JobDispatcher::new();
        let worker = tokio::spawn(run_worker(fx.engine(), receiver));

        assert!(dispatcher.dispatch_periodic().unwrap());
        dispatcher.snapshot().await.unwrap();
        assert!(dispatcher.dispatch_periodic().unwrap());

        drop(dispatcher);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_job_does_not_stop_worker() {
        let fx = Fixture::new();
        let bad = fx.write_source("bad.txt", b"bad");
        let good = fx.write_source("good.txt", b"good");
        fx.store.fail_add(&bad);
        let (dispatcher, receiver) = JobDispatcher::new();
        let worker = tokio::spawn(run_worker(fx.engine(), receiver));

        dispatcher.dispatch_ingest(&bad).unwrap();
        dispatcher.dispatch_ingest(&good).unwrap();
        dispatcher.dispatch_audit().unwrap();
        let snapshot = dispatcher.snapshot().await.unwrap();

        assert!(snapshot.mapping.contains(&key("good.txt")));
        assert!(!snapshot.mapping.contains(&key("bad.txt")));
        drop(dispatcher);
        worker.await.unwrap();
    }
}
