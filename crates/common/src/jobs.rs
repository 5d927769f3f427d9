//! Job queue feeding the engine worker
//!
//! Every request that reads or mutates the mapping or the deletion ledger is
//! sent through this queue, so the filesystem watcher, the startup scan and
//! the periodic loop never race each other.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::oneshot;

use crate::state::{DeletionLedger, Mapping};

/// Point-in-time copy of the engine's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub mapping: Mapping,
    pub ledger: DeletionLedger,
}

/// Jobs processed by the engine worker
#[derive(Debug)]
pub enum Job {
    /// A file appeared under the source root
    Ingest { path: PathBuf },
    /// A file disappeared from the mirror root
    Tombstone { path: PathBuf },
    /// Run one reconciliation pass
    Sync,
    /// Log the pin status of every mapped path
    Audit,
    /// Ingest the source backlog, then sync
    StartupScan,
    /// Audit, then sync. At most one is queued at a time
    Periodic { claim: PeriodicClaim },
    /// Reply with a copy of the current mapping and ledger
    Snapshot { reply: oneshot::Sender<Snapshot> },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::Ingest { .. } => "ingest",
            Job::Tombstone { .. } => "tombstone",
            Job::Sync => "sync",
            Job::Audit => "audit",
            Job::StartupScan => "startup-scan",
            Job::Periodic { .. } => "periodic",
            Job::Snapshot { .. } => "snapshot",
        }
    }
}

/// Held by a queued [`Job::Periodic`]. Dropping it, which the worker does as
/// soon as it picks the job up, lets the next periodic pass be queued.
#[derive(Debug)]
pub struct PeriodicClaim(Arc<AtomicBool>);

impl Drop for PeriodicClaim {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Job dispatcher that can be cloned and shared across tasks and threads
#[derive(Debug, Clone)]
pub struct JobDispatcher {
    tx: flume::Sender<Job>,
    periodic_queued: Arc<AtomicBool>,
}

impl JobDispatcher {
    /// Create a new job dispatcher and receiver pair
    ///
    /// The dispatcher can be cloned and shared, while the receiver should be
    /// given to the worker task.
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = flume::unbounded();
        let dispatcher = Self {
            tx,
            periodic_queued: Arc::new(AtomicBool::new(false)),
        };
        (dispatcher, JobReceiver { rx })
    }

    /// Queue a job. Fails only once the worker is gone.
    pub fn dispatch(&self, job: Job) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|_| anyhow::anyhow!("job receiver has been dropped"))
    }

    pub fn dispatch_ingest(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.dispatch(Job::Ingest { path: path.into() })
    }

    pub fn dispatch_tombstone(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.dispatch(Job::Tombstone { path: path.into() })
    }

    pub fn dispatch_sync(&self) -> Result<()> {
        self.dispatch(Job::Sync)
    }

    pub fn dispatch_audit(&self) -> Result<()> {
        self.dispatch(Job::Audit)
    }

    pub fn dispatch_startup_scan(&self) -> Result<()> {
        self.dispatch(Job::StartupScan)
    }

    /// Queue a periodic audit and sync unless the previous one has not been
    /// picked up yet. Returns whether a job was queued.
    pub fn dispatch_periodic(&self) -> Result<bool> {
        if self.periodic_queued.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        // a failed send drops the claim with the job, clearing the flag
        self.dispatch(Job::Periodic {
            claim: PeriodicClaim(self.periodic_queued.clone()),
        })?;
        Ok(true)
    }

    /// Wait for the worker to process everything queued before this call,
    /// then return its state.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Job::Snapshot { reply })?;
        rx.await
            .map_err(|_| anyhow::anyhow!("worker stopped before answering snapshot"))
    }
}

/// Job receiver for the engine worker
#[derive(Debug)]
pub struct JobReceiver {
    rx: flume::Receiver<Job>,
}

impl JobReceiver {
    /// Receive the next job (blocking)
    ///
    /// Returns None when all senders have been dropped.
    pub fn recv(&self) -> Option<Job> {
        self.rx.recv().ok()
    }

    /// Returns None if no jobs are available or all senders have been dropped.
    pub fn try_recv(&self) -> Option<Job> {
        self.rx.try_recv().ok()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Get an async stream of jobs; it ends once every dispatcher is dropped.
    pub fn into_async(self) -> flume::r#async::RecvStream<'static, Job> {
        self.rx.into_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_arrive_in_order() {
        let (dispatcher, receiver) = JobDispatcher::new();
        dispatcher.dispatch_ingest("/src/a.txt").unwrap();
        dispatcher.dispatch_tombstone("/dst/b.txt").unwrap();
        dispatcher.dispatch_sync().unwrap();
        assert_eq!(receiver.pending(), 3);

        let kinds: Vec<_> = std::iter::from_fn(|| receiver.try_recv())
            .map(|job| job.kind())
            .collect();
        assert_eq!(kinds, vec!["ingest", "tombstone", "sync"]);
    }

    #[test]
    fn test_dispatch_fails_after_receiver_dropped() {
        let (dispatcher, receiver) = JobDispatcher::new();
        drop(receiver);
        assert!(dispatcher.dispatch_audit().is_err());
        assert!(dispatcher.dispatch_periodic().is_err());
        assert!(dispatcher.dispatch_periodic().is_err());
    }

    #[test]
    fn test_periodic_jobs_collapse_until_picked_up() {
        let (dispatcher, receiver) = JobDispatcher::new();
        let other = dispatcher.clone();

        assert!(dispatcher.dispatch_periodic().unwrap());
        assert!(!dispatcher.dispatch_periodic().unwrap());
        assert!(!other.dispatch_periodic().unwrap());
        assert_eq!(receiver.pending(), 1);

        let job = receiver.try_recv().unwrap();
        assert_eq!(job.kind(), "periodic");
        drop(job);

        assert!(other.dispatch_periodic().unwrap());
        assert_eq!(receiver.pending(), 1);
    }

    #[test]
    fn test_recv_returns_none_once_dispatchers_dropped() {
        let (dispatcher, receiver) = JobDispatcher::new();
        dispatcher.dispatch_startup_scan().unwrap();
        drop(dispatcher);
        assert!(matches!(receiver.recv(), Some(Job::StartupScan)));
        assert!(receiver.recv().is_none());
    }
}
