//! Engine adapter for the isotovideo test runner.
//!
//! [`IsotovideoEngine`] starts the runner subprocess inside the pool
//! directory and implements the [`TestEngine`] seam; [`RunnerClient`] is
//! the thin REST client for the runner's own command server.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use testgrid_worker_protocol::engine::{EngineHandle, EngineSpawnRequest, TestEngine};
use testgrid_worker_protocol::error::{WorkerError, WorkerResult};

pub const DEFAULT_ISOTOVIDEO_BINARY: &str = "isotovideo";
const DEFAULT_CMD_SRV_PORT: u16 = 20013;
const VARS_FILE_NAME: &str = "vars.json";
const AUTOINST_LOG_FILE_NAME: &str = "autoinst-log.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsotovideoEngineConfig {
    pub binary: PathBuf,
    pub base_args: Vec<String>,
    /// Command-server port the runner is told to listen on; `None` leaves
    /// the handle without a command-server URL.
    pub cmd_srv_port: Option<u16>,
}

impl Default for IsotovideoEngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_ISOTOVIDEO_BINARY),
            base_args: Vec::new(),
            cmd_srv_port: Some(DEFAULT_CMD_SRV_PORT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildState {
    Running,
    Exited(Option<i32>),
}

#[derive(Clone)]
struct EngineChild {
    kill: Arc<Notify>,
    state_rx: watch::Receiver<ChildState>,
}

/// Spawns isotovideo into the pool directory with its stdout/stderr
/// appended to `autoinst-log.txt`, and keeps a registry of children keyed
/// by pid. Each child gets a wait-loop task that publishes the exit state
/// through a watch channel, so `is_running`/`stop`/`wait` never contend
/// for the `Child` itself.
pub struct IsotovideoEngine {
    config: IsotovideoEngineConfig,
    http: reqwest::Client,
    children: Mutex<HashMap<u32, EngineChild>>,
}

impl IsotovideoEngine {
    pub fn new(config: IsotovideoEngineConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn child(&self, pid: u32) -> Option<EngineChild> {
        let children = self.children.lock().expect("engine child registry poisoned");
        children.get(&pid).cloned()
    }

    fn forget_child(&self, pid: u32) {
        let mut children = self.children.lock().expect("engine child registry poisoned");
        children.remove(&pid);
    }

    fn write_vars_file(
        pool_directory: &std::path::Path,
        settings: &serde_json::Map<String, Value>,
    ) -> WorkerResult<()> {
        let rendered = serde_json::to_vec_pretty(settings).map_err(|error| {
            WorkerError::Setup(format!("failed to render {VARS_FILE_NAME}: {error}"))
        })?;
        std::fs::write(pool_directory.join(VARS_FILE_NAME), rendered).map_err(|error| {
            WorkerError::Setup(format!(
                "failed to write {VARS_FILE_NAME} in {}: {error}",
                pool_directory.display()
            ))
        })
    }
}

#[async_trait]
impl TestEngine for IsotovideoEngine {
    async fn spawn(&self, request: EngineSpawnRequest) -> WorkerResult<EngineHandle> {
        if self.config.binary.as_os_str().is_empty() {
            return Err(WorkerError::Configuration(
                "isotovideo binary must not be empty".to_owned(),
            ));
        }

        Self::write_vars_file(&request.pool_directory, &request.settings)?;

        let log_path = request.pool_directory.join(AUTOINST_LOG_FILE_NAME);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|error| {
                WorkerError::Setup(format!(
                    "failed to open {}: {error}",
                    log_path.display()
                ))
            })?;
        let log_for_stderr = log.try_clone().map_err(|error| {
            WorkerError::Setup(format!("failed to clone runner log handle: {error}"))
        })?;

        let mut command = Command::new(&self.config.binary);
        command
            .args(&self.config.base_args)
            .current_dir(&request.pool_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_for_stderr))
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|error| {
            WorkerError::Setup(format!(
                "failed to start isotovideo '{}' for job {}: {error}",
                self.config.binary.display(),
                request.job_id
            ))
        })?;
        let pid = child.id().ok_or_else(|| {
            WorkerError::Setup("isotovideo exited before a pid could be observed".to_owned())
        })?;

        let (state_tx, state_rx) = watch::channel(ChildState::Running);
        let kill = Arc::new(Notify::new());
        let kill_signal = Arc::clone(&kill);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|status| status.code());
            debug!("isotovideo pid {pid} exited with {code:?}");
            let _ = state_tx.send(ChildState::Exited(code));
        });

        let mut children = self.children.lock().expect("engine child registry poisoned");
        children.insert(pid, EngineChild { kill, state_rx });

        Ok(EngineHandle {
            pid,
            cmd_srv_url: self
                .config
                .cmd_srv_port
                .map(|port| format!("http://127.0.0.1:{port}")),
        })
    }

    async fn is_running(&self, handle: &EngineHandle) -> bool {
        self.child(handle.pid)
            .is_some_and(|child| *child.state_rx.borrow() == ChildState::Running)
    }

    async fn stop(&self, handle: &EngineHandle) {
        if let Some(url) = handle.cmd_srv_url.as_deref() {
            let runner = RunnerClient::with_client(self.http.clone(), url);
            if let Err(error) = runner.stop().await {
                debug!("graceful runner stop failed, killing pid {}: {error}", handle.pid);
            }
        }

        let Some(child) = self.child(handle.pid) else {
            return;
        };
        child.kill.notify_one();
        let mut state_rx = child.state_rx.clone();
        if state_rx
            .wait_for(|state| matches!(state, ChildState::Exited(_)))
            .await
            .is_err()
        {
            warn!("isotovideo wait loop for pid {} went away", handle.pid);
        }
        self.forget_child(handle.pid);
    }

    async fn wait(&self, handle: &EngineHandle) -> Option<i32> {
        let child = self.child(handle.pid)?;
        let mut state_rx = child.state_rx.clone();
        let state = state_rx
            .wait_for(|state| matches!(state, ChildState::Exited(_)))
            .await
            .ok()?;
        match *state {
            ChildState::Exited(code) => code,
            ChildState::Running => None,
        }
    }

    async fn runner_status(&self, handle: &EngineHandle) -> WorkerResult<Value> {
        let Some(url) = handle.cmd_srv_url.as_deref() else {
            return Ok(Value::Object(Default::default()));
        };
        RunnerClient::with_client(self.http.clone(), url).status().await
    }
}

/// Thin REST client for the runner's command server.
pub struct RunnerClient {
    http: reqwest::Client,
    base_url: String,
}

impl RunnerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Current execution snapshot; an empty map when the runner has
    /// nothing to report yet.
    pub async fn status(&self) -> WorkerResult<Value> {
        let url = format!("{}/status", self.base_url);
        let response = self.http.get(&url).send().await.map_err(|error| {
            WorkerError::Transport(format!("runner status request failed: {error}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(WorkerError::Transport(format!(
                "runner status request failed with status {status}"
            )));
        }
        let text = response.text().await.map_err(|error| {
            WorkerError::Transport(format!("runner status response read failed: {error}"))
        })?;
        if text.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&text).map_err(|error| {
            WorkerError::Transport(format!("runner status response parse failed: {error}"))
        })
    }

    /// Ask the runner to wind down test execution.
    pub async fn stop(&self) -> WorkerResult<()> {
        let url = format!("{}/broadcast", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({"stopping_test_execution": 1}))
            .send()
            .await
            .map_err(|error| {
                WorkerError::Transport(format!("runner stop request failed: {error}"))
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(WorkerError::Transport(format!(
                "runner stop request failed with status {status}"
            )));
        }
        Ok(())
    }
}
