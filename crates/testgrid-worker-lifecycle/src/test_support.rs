//! Shared fakes for exercising the job lifecycle without real transports.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::time::sleep;

use testgrid_worker_protocol::client::{ApiMethod, UiClient};
use testgrid_worker_protocol::engine::{EngineHandle, EngineSpawnRequest, TestEngine};
use testgrid_worker_protocol::error::{WorkerError, WorkerResult};
use testgrid_worker_protocol::job::JobInfo;
use testgrid_worker_protocol::status::JobStatus;

use crate::job::{Job, JobConfig};
use crate::pool::PoolDirectory;
use crate::worker::WorkerInfo;

/// Upper bound the suite waits for an externally observable transition;
/// after this a job counts as "not stopped".
pub const STOP_WATCHDOG: Duration = Duration::from_secs(15);

const MOCK_ENGINE_PID: u32 = 4242;

static TEST_POOL_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_pool_root() -> PathBuf {
    let counter = TEST_POOL_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "testgrid-worker-pool-{}-{counter}",
        std::process::id()
    ))
}

/// Poll until the job reaches `expected` or the watchdog fires.
pub async fn wait_for_status(job: &Job, expected: JobStatus) {
    let deadline = tokio::time::Instant::now() + STOP_WATCHDOG;
    loop {
        let status = job.status();
        if status == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for status {expected}; job is {status}"
        );
        sleep(Duration::from_millis(10)).await;
    }
}

/// Poll an arbitrary condition under the same watchdog.
pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + STOP_WATCHDOG;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting until {description}"
        );
        sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: ApiMethod,
    pub path: String,
    pub body: Value,
}

/// Records every outbound message instead of sending it, so tests can
/// assert the exact REST and WebSocket sequences. `gate_next_status`
/// keeps the next acceptance ack in flight until the returned sender is
/// used or dropped.
pub struct MockUiClient {
    rest: Mutex<Vec<RecordedRequest>>,
    status_frames: Mutex<Vec<Value>>,
    status_gate: Mutex<Option<oneshot::Receiver<()>>>,
    status_send_failure: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl MockUiClient {
    pub fn new() -> Self {
        let (closed_tx, _closed_rx) = watch::channel(false);
        Self {
            rest: Mutex::new(Vec::new()),
            status_frames: Mutex::new(Vec::new()),
            status_gate: Mutex::new(None),
            status_send_failure: AtomicBool::new(false),
            closed_tx,
        }
    }

    pub fn rest_requests(&self) -> Vec<RecordedRequest> {
        self.rest.lock().expect("rest request lock poisoned").clone()
    }

    pub fn status_messages(&self) -> Vec<Value> {
        self.status_frames
            .lock()
            .expect("status frame lock poisoned")
            .clone()
    }

    /// The next `send_status` records its frame, then stalls until the
    /// returned sender fires or drops.
    pub fn gate_next_status(&self) -> oneshot::Sender<()> {
        let (release_tx, release_rx) = oneshot::channel();
        *self.status_gate.lock().expect("status gate lock poisoned") = Some(release_rx);
        release_tx
    }

    pub fn fail_status_sends(&self) {
        self.status_send_failure.store(true, Ordering::Relaxed);
    }

    pub fn emit_finish(&self) {
        self.closed_tx.send_replace(true);
    }
}

impl Default for MockUiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UiClient for MockUiClient {
    async fn send(&self, method: ApiMethod, path: &str, body: Value) -> WorkerResult<Value> {
        self.rest
            .lock()
            .expect("rest request lock poisoned")
            .push(RecordedRequest {
                method,
                path: path.to_owned(),
                body,
            });
        Ok(Value::Object(Default::default()))
    }

    async fn send_status(&self, payload: Value) -> WorkerResult<()> {
        if self.status_send_failure.load(Ordering::Relaxed) {
            return Err(WorkerError::Transport(
                "status websocket is gone".to_owned(),
            ));
        }
        self.status_frames
            .lock()
            .expect("status frame lock poisoned")
            .push(payload);
        let gate = self
            .status_gate
            .lock()
            .expect("status gate lock poisoned")
            .take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(())
    }

    async fn register(&self) -> WorkerResult<()> {
        Ok(())
    }

    fn websocket_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

/// Engine fake: either refuses to start with a fixed setup error or hands
/// out a running handle whose exit is test-controlled.
pub struct MockEngine {
    failure: Option<String>,
    running: AtomicBool,
    exit_tx: watch::Sender<Option<Option<i32>>>,
    spawn_requests: Mutex<Vec<EngineSpawnRequest>>,
    runner_snapshot: Mutex<Value>,
}

impl MockEngine {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::with_failure(None))
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self::with_failure(Some(message.to_owned())))
    }

    fn with_failure(failure: Option<String>) -> Self {
        let (exit_tx, _exit_rx) = watch::channel(None);
        Self {
            failure,
            running: AtomicBool::new(false),
            exit_tx,
            spawn_requests: Mutex::new(Vec::new()),
            runner_snapshot: Mutex::new(Value::Object(Default::default())),
        }
    }

    /// Let the fake subprocess exit with the given code.
    pub fn exit_with(&self, code: Option<i32>) {
        self.running.store(false, Ordering::Relaxed);
        self.exit_tx.send_replace(Some(code));
    }

    pub fn spawn_requests(&self) -> Vec<EngineSpawnRequest> {
        self.spawn_requests
            .lock()
            .expect("spawn request lock poisoned")
            .clone()
    }

    /// What the fake runner's status API reports from now on.
    pub fn set_runner_snapshot(&self, snapshot: Value) {
        *self
            .runner_snapshot
            .lock()
            .expect("runner snapshot lock poisoned") = snapshot;
    }
}

#[async_trait]
impl TestEngine for MockEngine {
    async fn spawn(&self, request: EngineSpawnRequest) -> WorkerResult<EngineHandle> {
        if let Some(message) = &self.failure {
            return Err(WorkerError::Setup(message.clone()));
        }
        self.spawn_requests
            .lock()
            .expect("spawn request lock poisoned")
            .push(request);
        self.running.store(true, Ordering::Relaxed);
        Ok(EngineHandle {
            pid: MOCK_ENGINE_PID,
            cmd_srv_url: None,
        })
    }

    async fn is_running(&self, _handle: &EngineHandle) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    async fn stop(&self, _handle: &EngineHandle) {
        self.exit_with(None);
    }

    async fn wait(&self, _handle: &EngineHandle) -> Option<i32> {
        let mut exit_rx = self.exit_tx.subscribe();
        let result = match exit_rx.wait_for(|state| state.is_some()).await {
            Ok(state) => (*state).flatten(),
            Err(_) => None,
        };
        result
    }

    async fn runner_status(&self, _handle: &EngineHandle) -> WorkerResult<Value> {
        Ok(self
            .runner_snapshot
            .lock()
            .expect("runner snapshot lock poisoned")
            .clone())
    }
}

/// A job wired to mocks over a throwaway pool directory. The livelog
/// interval is stretched far beyond the watchdog so periodic frames never
/// interleave with the sequences under test.
pub struct JobFixture {
    pub job: Job,
    pub client: Arc<MockUiClient>,
    pub engine: Arc<MockEngine>,
    pub pool_root: PathBuf,
}

impl JobFixture {
    pub fn new(id: Option<u64>, engine: Arc<MockEngine>) -> Self {
        Self::with_config(
            id,
            engine,
            JobConfig {
                livelog_status_interval: Duration::from_secs(3600),
            },
        )
    }

    pub fn with_config(id: Option<u64>, engine: Arc<MockEngine>, config: JobConfig) -> Self {
        let client = Arc::new(MockUiClient::new());
        let pool_root = unique_pool_root();
        std::fs::create_dir_all(&pool_root).expect("create fixture pool root");

        let mut info = JobInfo {
            id,
            ..JobInfo::default()
        };
        info.url = Some("http://127.0.0.1:20013".to_owned());
        info.settings
            .insert("BACKEND".to_owned(), Value::String("qemu".to_owned()));

        let job = Job::with_config(
            info,
            Arc::clone(&client) as Arc<dyn UiClient>,
            Arc::clone(&engine) as Arc<dyn TestEngine>,
            PoolDirectory::new(&pool_root),
            WorkerInfo {
                id: 42,
                hostname: "grid-7".to_owned(),
                instance: 1,
            },
            config,
        );

        Self {
            job,
            client,
            engine,
            pool_root,
        }
    }
}

impl Drop for JobFixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.pool_root);
    }
}
