//! [`ContentStore`] backed by a Kubo node, driven through its CLI.
//!
//! Every call spawns the configured binary, waits for it under a timeout
//! (the child is killed if the timeout fires), and retries transient
//! failures according to the configured [`RetryPolicy`].

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::{AddedEntry, ConfigValue, ContentStore, RetryPolicy, StoreError};
use crate::content_id::ContentId;

/// Environment variable Kubo reads its repository location from.
pub const REPO_ENV: &str = "IPFS_PATH";

#[derive(Debug, Clone)]
pub struct KuboConfig {
    /// Path to (or name of) the `ipfs` executable
    pub binary: PathBuf,
    /// Repository directory; `~/.ipfs` when unset
    pub repo_path: Option<PathBuf>,
    /// Upper bound on any single invocation
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for KuboConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ipfs"),
            repo_path: None,
            command_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KuboStore {
    config: KuboConfig,
}

impl KuboStore {
    pub fn new(config: KuboConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KuboConfig {
        &self.config
    }

    /// Where the node keeps its repository.
    pub fn repo_dir(&self) -> PathBuf {
        match &self.config.repo_path {
            Some(path) => path.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ipfs"),
        }
    }

    /// Single `id` call under `timeout`, without retries. Used to decide
    /// whether the node's daemon is up.
    pub async fn probe(&self, timeout: Duration) -> Result<String, StoreError> {
        let stdout = self.run_once("id", &args(["id", "--format=<id>"]), timeout).await?;
        parse_id(&stdout)
    }

    /// Run `init` if the repository does not exist yet. Returns whether a
    /// repository was created.
    pub async fn init_repo(&self) -> Result<bool, StoreError> {
        let repo = self.repo_dir();
        if repo.exists() {
            tracing::info!(repo = %repo.display(), "Backend repository already exists");
            return Ok(false);
        }

        tracing::info!(repo = %repo.display(), "Backend repository not found, initializing");
        let stdout = self.run("init", args(["init"])).await?;
        tracing::info!(output = %stdout.trim(), "Backend repository initialized");
        Ok(true)
    }

    /// Start `ipfs daemon` in the background. The returned child is not
    /// killed when dropped.
    pub fn spawn_daemon(&self) -> Result<Child, StoreError> {
        let mut cmd = self.command(&args(["daemon"]));
        cmd.kill_on_drop(false)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.spawn()
            .map_err(|source| StoreError::Spawn { op: "daemon", source })
    }

    fn command(&self, args: &[OsString]) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(repo) = &self.config.repo_path {
            cmd.env(REPO_ENV, repo);
        }
        cmd
    }

    async fn run_once(
        &self,
        op: &'static str,
        args: &[OsString],
        timeout: Duration,
    ) -> Result<String, StoreError> {
        tracing::debug!(op, ?args, "Invoking backend");
        let output = tokio::time::timeout(timeout, self.command(args).output())
            .await
            .map_err(|_| StoreError::Timeout { op, after: timeout })?
            .map_err(|source| StoreError::Spawn { op, source })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(StoreError::CommandFailed {
                op,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn run(&self, op: &'static str, args: Vec<OsString>) -> Result<String, StoreError> {
        let timeout = self.config.command_timeout;
        let args = &args;
        self.config
            .retry
            .run(op, move || self.run_once(op, args, timeout))
            .await
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<OsString> {
    parts.iter().map(OsString::from).collect()
}

#[async_trait]
impl ContentStore for KuboStore {
    async fn add(&self, path: &Path) -> Result<Vec<AddedEntry>, StoreError> {
        let mut cmd = args(["add", "-r"]);
        cmd.push(path.as_os_str().to_owned());
        let stdout = self.run("add", cmd).await?;
        tracing::debug!(output = %stdout.trim(), "Backend add output");

        let fallback = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(parse_add_output(&stdout, &fallback))
    }

    async fn pin(&self, cid: &ContentId) -> Result<(), StoreError> {
        self.run("pin add", args(["pin", "add", cid.as_str()]))
            .await
            .map(|_| ())
    }

    async fn get(&self, cid: &ContentId, dest: &Path) -> Result<(), StoreError> {
        let mut cmd = args(["get", cid.as_str(), "-o"]);
        cmd.push(dest.as_os_str().to_owned());
        self.run("get", cmd).await.map(|_| ())
    }

    async fn id(&self) -> Result<String, StoreError> {
        let stdout = self.run("id", args(["id", "--format=<id>"])).await?;
        parse_id(&stdout)
    }

    async fn peers(&self) -> Result<Vec<String>, StoreError> {
        let stdout = self.run("swarm peers", args(["swarm", "peers"])).await?;
        Ok(parse_lines(&stdout))
    }

    async fn find_peers(&self, peer: &str) -> Result<Vec<String>, StoreError> {
        let stdout = self
            .run("routing findpeer", args(["routing", "findpeer", peer]))
            .await?;
        Ok(parse_lines(&stdout))
    }

    async fn config_set(&self, key: &str, value: &ConfigValue) -> Result<(), StoreError> {
        let value_str = value.to_string();
        let cmd = match value {
            ConfigValue::String(_) => args(["config", key, &value_str]),
            ConfigValue::Bool(_) => args(["config", "--bool", key, &value_str]),
            ConfigValue::Json(_) => args(["config", "--json", key, &value_str]),
        };
        self.run("config", cmd).await.map(|_| ())
    }

    async fn pinned(&self) -> Result<HashMap<ContentId, String>, StoreError> {
        let stdout = self
            .run("pin ls", args(["pin", "ls", "--type=all"]))
            .await?;
        Ok(parse_pin_ls(&stdout))
    }
}

/// Parse `added <cid> <name>` lines. Lines without a valid cid are dropped;
/// a line without a name is attributed to `fallback_name`.
fn parse_add_output(stdout: &str, fallback_name: &str) -> Vec<AddedEntry> {
    let mut entries = Vec::new();
    for line in stdout.lines() {
        let Some(rest) = line.strip_prefix("added ") else {
            continue;
        };
        let rest = rest.trim();
        let (cid, name) = match rest.split_once(char::is_whitespace) {
            Some((cid, name)) => (cid, name.trim()),
            None => (rest, fallback_name),
        };

        match ContentId::new(cid) {
            Ok(cid) if !name.is_empty() => entries.push(AddedEntry {
                name: name.to_string(),
                cid,
            }),
            Ok(_) => tracing::warn!(line, "Dropping add result without a name"),
            Err(e) => tracing::warn!(line, error = %e, "Dropping malformed add result"),
        }
    }
    entries
}

/// Parse `<cid> <type>` lines from `pin ls`.
fn parse_pin_ls(stdout: &str) -> HashMap<ContentId, String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let cid = ContentId::new(parts.next()?).ok()?;
            let pin_type = parts.next()?;
            Some((cid, pin_type.to_string()))
        })
        .collect()
}

fn parse_id(stdout: &str) -> Result<String, StoreError> {
    let id = stdout.trim();
    if id.is_empty() {
        return Err(StoreError::MalformedOutput {
            op: "id",
            detail: "empty peer id".to_string(),
        });
    }
    Ok(id.to_string())
}

fn parse_lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
