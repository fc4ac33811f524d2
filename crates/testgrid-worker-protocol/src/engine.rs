use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::WorkerResult;

/// Key under which the runner's status snapshot names the module it is
/// currently executing.
pub const RUNNER_CURRENT_TEST_KEY: &str = "current_test";

/// Everything an engine needs to start the runner for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSpawnRequest {
    pub job_id: u64,
    pub settings: Map<String, Value>,
    pub pool_directory: PathBuf,
}

/// Handle to a started runner subprocess. Plain data; every operation on
/// the process goes through the [`TestEngine`] that produced the handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineHandle {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_srv_url: Option<String>,
}

/// Seam between the job lifecycle and the runner subprocess.
///
/// `spawn` either starts the subprocess or fails without having started
/// anything; there is no half-started outcome. `wait` resolves when the
/// process exits, with the exit code when one exists (`None` after a
/// signal kill).
#[async_trait]
pub trait TestEngine: Send + Sync {
    async fn spawn(&self, request: EngineSpawnRequest) -> WorkerResult<EngineHandle>;
    async fn is_running(&self, handle: &EngineHandle) -> bool;
    async fn stop(&self, handle: &EngineHandle);
    async fn wait(&self, handle: &EngineHandle) -> Option<i32>;

    /// Current execution snapshot from the runner's own status API; an
    /// empty map when the runner has nothing to report.
    async fn runner_status(&self, handle: &EngineHandle) -> WorkerResult<Value>;
}
