use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use testgrid_worker_protocol::error::{WorkerError, WorkerResult};

pub const AUTOINST_LOG_FILE: &str = "autoinst-log.txt";
pub const WORKER_LOG_FILE: &str = "worker-log.txt";
pub const VIRTIO_CONSOLE_LOG_FILE: &str = "virtio_console.log";
pub const TEST_RESULTS_DIR: &str = "testresults";
pub const TEST_ORDER_FILE: &str = "test_order.json";
const LOCK_MARKER_FILE: &str = ".locked";

/// Per-instance scratch directory holding the runner logs and
/// `testresults/`. Only the currently active job mutates it.
#[derive(Debug, Clone)]
pub struct PoolDirectory {
    root: PathBuf,
}

impl PoolDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Clear prior-run artifacts and open a fresh worker log. Leaves
    /// `testresults/` alone for the runner to populate. The `.locked`
    /// marker stays behind if the worker dies mid-job.
    pub async fn prepare_for_job(&self) -> WorkerResult<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|error| self.setup_error("create", &self.root, error))?;
        for stale in [AUTOINST_LOG_FILE, VIRTIO_CONSOLE_LOG_FILE] {
            self.remove_if_present(&self.root.join(stale)).await?;
        }
        let worker_log = self.root.join(WORKER_LOG_FILE);
        tokio::fs::write(&worker_log, b"")
            .await
            .map_err(|error| self.setup_error("truncate", &worker_log, error))?;
        let marker = self.root.join(LOCK_MARKER_FILE);
        tokio::fs::write(&marker, b"")
            .await
            .map_err(|error| self.setup_error("write", &marker, error))?;
        Ok(())
    }

    /// Drop the `.locked` marker after a clean stop.
    pub async fn release(&self) -> WorkerResult<()> {
        self.remove_if_present(&self.root.join(LOCK_MARKER_FILE))
            .await
    }

    pub fn is_locked(&self) -> bool {
        self.root.join(LOCK_MARKER_FILE).exists()
    }

    /// Append one line to the job's redirected log sink.
    pub async fn append_worker_log(&self, line: &str) -> WorkerResult<()> {
        let path = self.root.join(WORKER_LOG_FILE);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|error| self.setup_error("open", &path, error))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|error| self.setup_error("append to", &path, error))?;
        file.flush()
            .await
            .map_err(|error| self.setup_error("flush", &path, error))
    }

    /// `testresults/test_order.json`, absent or unreadable means `[]`.
    pub async fn read_test_order(&self) -> Vec<Value> {
        let path = self.root.join(TEST_RESULTS_DIR).join(TEST_ORDER_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|error| {
                debug!("ignoring unparsable {}: {error}", path.display());
                Vec::new()
            }),
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    debug!("ignoring unreadable {}: {error}", path.display());
                }
                Vec::new()
            }
        }
    }

    async fn remove_if_present(&self, path: &Path) -> WorkerResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(self.setup_error("remove", path, error)),
        }
    }

    fn setup_error(&self, action: &str, path: &Path, error: std::io::Error) -> WorkerError {
        WorkerError::Setup(format!("failed to {action} {}: {error}", path.display()))
    }
}
