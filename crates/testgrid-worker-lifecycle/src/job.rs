use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use testgrid_worker_eventbus::{JobEventBus, STATUS_CHANGED, UPLOADING_RESULTS_CONCLUDED};
use testgrid_worker_protocol::client::{ApiMethod, UiClient};
use testgrid_worker_protocol::engine::{
    EngineHandle, EngineSpawnRequest, TestEngine, RUNNER_CURRENT_TEST_KEY,
};
use testgrid_worker_protocol::error::{WorkerError, WorkerResult};
use testgrid_worker_protocol::frames::{AcceptedMessage, StatusBody, StatusFrame, UploadProgress};
use testgrid_worker_protocol::job::{JobInfo, StopReason};
use testgrid_worker_protocol::status::JobStatus;

use crate::pool::PoolDirectory;
use crate::worker::WorkerInfo;

const DEFAULT_LIVELOG_STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// Cadence of the enriched status frames while a livelog viewer is
    /// attached.
    pub livelog_status_interval: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            livelog_status_interval: DEFAULT_LIVELOG_STATUS_INTERVAL,
        }
    }
}

/// One job on this worker instance, from `new` to `stopped`.
///
/// The handle is cheap to clone; all mutations go through the shared state
/// behind it. Status updates are validated against the transition table
/// before they land, and `status_changed` fires only after the field holds
/// the new value, so a stale transition can never be observed.
#[derive(Clone)]
pub struct Job {
    shared: Arc<JobShared>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").finish_non_exhaustive()
    }
}

struct JobShared {
    client: Arc<dyn UiClient>,
    engine: Arc<dyn TestEngine>,
    pool: PoolDirectory,
    worker: WorkerInfo,
    config: JobConfig,
    events: JobEventBus,
    state: Mutex<JobState>,
}

#[derive(Default)]
struct JobState {
    info: JobInfo,
    status: JobStatus,
    setup_error: Option<String>,
    engine_handle: Option<EngineHandle>,
    engine_exit_status: Option<i32>,
    livelog_viewers: u32,
    developer_session_running: bool,
    is_uploading_results: bool,
    upload_progress: UploadProgress,
    stop_requested: bool,
    stop_reason: Option<StopReason>,
    livelog_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
}

impl Job {
    pub fn new(
        info: JobInfo,
        client: Arc<dyn UiClient>,
        engine: Arc<dyn TestEngine>,
        pool: PoolDirectory,
        worker: WorkerInfo,
    ) -> Self {
        Self::with_config(info, client, engine, pool, worker, JobConfig::default())
    }

    pub fn with_config(
        info: JobInfo,
        client: Arc<dyn UiClient>,
        engine: Arc<dyn TestEngine>,
        pool: PoolDirectory,
        worker: WorkerInfo,
        config: JobConfig,
    ) -> Self {
        let job = Self {
            shared: Arc::new(JobShared {
                client,
                engine,
                pool,
                worker,
                config,
                events: JobEventBus::new(),
                state: Mutex::new(JobState {
                    info,
                    ..JobState::default()
                }),
            }),
        };

        // Success path: once the uploads have drained the job stops itself.
        let weak = Arc::downgrade(&job.shared);
        job.shared
            .events
            .once(UPLOADING_RESULTS_CONCLUDED, move |_| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let job = Job { shared };
                tokio::spawn(async move {
                    job.stop(StopReason::Done).await;
                });
            });

        job
    }

    pub fn id(&self) -> Option<u64> {
        self.lock_state().info.id
    }

    pub fn info(&self) -> JobInfo {
        self.lock_state().info.clone()
    }

    pub fn status(&self) -> JobStatus {
        self.lock_state().status
    }

    pub fn setup_error(&self) -> Option<String> {
        self.lock_state().setup_error.clone()
    }

    pub fn livelog_viewers(&self) -> u32 {
        self.lock_state().livelog_viewers
    }

    pub fn developer_session_running(&self) -> bool {
        self.lock_state().developer_session_running
    }

    pub fn is_uploading_results(&self) -> bool {
        self.lock_state().is_uploading_results
    }

    pub fn upload_progress(&self) -> UploadProgress {
        self.lock_state().upload_progress.clone()
    }

    /// Why the job left its running life, once it has.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.lock_state().stop_reason
    }

    pub fn events(&self) -> &JobEventBus {
        &self.shared.events
    }

    /// Take ownership of the job: announce it on the status socket and
    /// wait for the ack. Only valid on a fresh job.
    pub async fn accept(&self) -> WorkerResult<()> {
        let jobid = {
            let state = self.lock_state();
            if state.status != JobStatus::New {
                return Err(WorkerError::InvalidState(format!(
                    "attempt to accept job in state {}",
                    state.status
                )));
            }
            let Some(id) = state.info.id else {
                return Err(WorkerError::MissingJobId);
            };
            id
        };
        self.set_status(JobStatus::Accepting);

        match self
            .shared
            .client
            .send_status(json!(AcceptedMessage::new(jobid)))
            .await
        {
            Ok(()) => {
                // No-op if the socket finished first and the job is
                // already abandoned.
                self.set_status(JobStatus::Accepted);
                Ok(())
            }
            Err(error) => {
                warn!("failed to push the acceptance for job {jobid}: {error}");
                self.lock_state().stop_reason.get_or_insert(StopReason::Abandoned);
                self.set_status(JobStatus::Stopped);
                Err(error)
            }
        }
    }

    /// The control socket closed. Fatal only before the acceptance ack:
    /// afterwards the web UI already knows this worker owns the job.
    pub fn handle_websocket_finish(&self) {
        let status = self.status();
        if status == JobStatus::Accepting {
            info!(
                "websocket connection finished before the acceptance was acknowledged, job is {}",
                StopReason::Abandoned
            );
            self.lock_state().stop_reason.get_or_insert(StopReason::Abandoned);
            self.set_status(JobStatus::Stopped);
        } else {
            debug!("websocket connection finished, job keeps status {status}");
        }
    }

    /// Prepare the pool directory and start the runner subprocess.
    ///
    /// Engine startup failures are not caller errors: the job records the
    /// message and reports completion through the regular stop path.
    pub async fn start(&self) -> WorkerResult<()> {
        let (id, settings) = {
            let state = self.lock_state();
            let Some(id) = state.info.id else {
                return Err(WorkerError::MissingJobId);
            };
            if state.status != JobStatus::Accepted {
                return Err(WorkerError::InvalidState(
                    "attempt to start job which is not accepted".to_owned(),
                ));
            }
            (id, state.info.settings.clone())
        };
        self.set_status(JobStatus::Setup);

        if let Err(error) = self.shared.pool.prepare_for_job().await {
            self.fail_setup(id, error.to_string()).await;
            return Ok(());
        }
        let _ = self.shared.pool.append_worker_log("+++ setup notes +++").await;
        let _ = self
            .shared
            .pool
            .append_worker_log(&format!(
                "Running on {} (instance {})",
                self.shared.worker.hostname, self.shared.worker.instance
            ))
            .await;

        let request = EngineSpawnRequest {
            job_id: id,
            settings,
            pool_directory: self.shared.pool.root().to_path_buf(),
        };
        let handle = match self.shared.engine.spawn(request).await {
            Ok(handle) => handle,
            Err(error) => {
                let message = match error {
                    WorkerError::Setup(message) => message,
                    other => other.to_string(),
                };
                self.fail_setup(id, message).await;
                return Ok(());
            }
        };

        {
            let mut state = self.lock_state();
            if state.info.url.is_none() {
                state.info.url = handle.cmd_srv_url.clone();
            }
            state.engine_handle = Some(handle.clone());
        }
        self.set_status(JobStatus::Running);
        info!("isotovideo has been started");
        let _ = self
            .shared
            .pool
            .append_worker_log(&format!("isotovideo has been started (pid {})", handle.pid))
            .await;

        if let Err(error) = self.send_running_status().await {
            warn!("failed to report the running status for job {id}: {error}");
        }
        self.spawn_engine_monitor(handle);
        Ok(())
    }

    /// Wind the job down. Idempotent: a second call while `stopping` or
    /// `stopped` is a no-op.
    pub async fn stop(&self, reason: StopReason) {
        {
            let mut state = self.lock_state();
            if state.stop_requested || matches!(state.status, JobStatus::Stopping | JobStatus::Stopped)
            {
                debug!("ignoring stop({reason}) in status {}", state.status);
                return;
            }
            state.stop_requested = true;
            state.stop_reason = Some(reason);
        }
        self.set_status(JobStatus::Stopping);
        self.run_stop_sequence(reason).await;
    }

    /// The runner subprocess went away on its own; treated as an implicit
    /// `stop("died")` with the exit status preserved for the final frame.
    pub async fn handle_engine_exit(&self, exit_status: Option<i32>) {
        {
            let mut state = self.lock_state();
            if state.stop_requested || state.status.is_terminal() {
                return;
            }
            state.engine_exit_status = exit_status;
        }
        warn!("isotovideo exited unexpectedly ({exit_status:?})");
        self.stop(StopReason::Died).await;
    }

    pub fn start_livelog(&self) -> WorkerResult<()> {
        let mut state = self.lock_state();
        if !matches!(state.status, JobStatus::Setup | JobStatus::Running) {
            return Err(WorkerError::InvalidState(format!(
                "attempt to start livelog for job in state {}",
                state.status
            )));
        }
        state.livelog_viewers += 1;
        if state.livelog_viewers == 1 {
            info!("Starting livelog");
            state.livelog_task = Some(self.spawn_livelog_updates());
        }
        Ok(())
    }

    pub fn stop_livelog(&self) -> WorkerResult<()> {
        let mut state = self.lock_state();
        if state.livelog_viewers == 0 {
            return Err(WorkerError::InvalidState(
                "attempt to stop livelog without active viewers".to_owned(),
            ));
        }
        state.livelog_viewers -= 1;
        if state.livelog_viewers == 0 {
            info!("Stopping livelog");
            if let Some(task) = state.livelog_task.take() {
                task.abort();
            }
        }
        Ok(())
    }

    pub fn set_developer_session(&self, active: bool) {
        let changed = {
            let mut state = self.lock_state();
            let changed = state.developer_session_running != active;
            state.developer_session_running = active;
            changed
        };
        if changed {
            info!(
                "developer session {}",
                if active { "opened" } else { "closed" }
            );
        }
    }

    pub fn begin_uploading_results(&self) {
        self.lock_state().is_uploading_results = true;
    }

    pub fn set_upload_progress(&self, progress: UploadProgress) {
        self.lock_state().upload_progress = progress;
    }

    /// The last outstanding upload drained; lets subscribers know and,
    /// through the job's own subscription, triggers `stop("done")`.
    pub fn conclude_uploading_results(&self) {
        {
            let mut state = self.lock_state();
            if !state.is_uploading_results {
                return;
            }
            state.is_uploading_results = false;
        }
        self.shared.events.emit(UPLOADING_RESULTS_CONCLUDED, &Value::Null);
    }

    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        self.shared.state.lock().expect("job state lock poisoned")
    }

    /// Validated status update. Returns whether the edge was taken; the
    /// `status_changed` emission happens after the field is updated.
    fn set_status(&self, next: JobStatus) -> bool {
        {
            let mut state = self.lock_state();
            if !state.status.can_transition(next) {
                debug!("rejecting status change {} -> {next}", state.status);
                return false;
            }
            state.status = next;
        }
        self.shared.events.emit(STATUS_CHANGED, &json!({ "status": next }));
        true
    }

    async fn fail_setup(&self, id: u64, message: String) {
        error!("Unable to setup job {id}: {message}");
        let _ = self
            .shared
            .pool
            .append_worker_log(&format!("Unable to setup job {id}: {message}"))
            .await;
        self.lock_state().setup_error = Some(message);
        self.stop(StopReason::SetupFailure).await;
    }

    async fn send_running_status(&self) -> WorkerResult<()> {
        let (id, livelog, cmd_srv_url) = {
            let state = self.lock_state();
            let Some(id) = state.info.id else {
                return Err(WorkerError::MissingJobId);
            };
            if state.status != JobStatus::Running {
                return Ok(());
            }
            (id, state.livelog_viewers > 0, state.info.url.clone())
        };
        let frame = StatusBody::new(StatusFrame::running(
            cmd_srv_url,
            self.shared.worker.hostname.clone(),
            self.shared.worker.id,
            livelog,
        ));
        self.shared
            .client
            .send(ApiMethod::Post, &format!("jobs/{id}/status"), json!(frame))
            .await
            .map(|_| ())
    }

    fn spawn_livelog_updates(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let interval = self.shared.config.livelog_status_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let job = Job { shared };
                job.refresh_runner_module().await;
                if let Err(error) = job.send_running_status().await {
                    debug!("livelog status update failed: {error}");
                }
            }
        })
    }

    /// Ask the runner which module it is on, so the upload progress
    /// counters stay current while viewers watch.
    async fn refresh_runner_module(&self) {
        let handle = self.lock_state().engine_handle.clone();
        let Some(handle) = handle else {
            return;
        };
        match self.shared.engine.runner_status(&handle).await {
            Ok(snapshot) => {
                if let Some(module) = snapshot
                    .get(RUNNER_CURRENT_TEST_KEY)
                    .and_then(Value::as_str)
                {
                    self.lock_state().upload_progress.upload_up_to_current_module =
                        Some(module.to_owned());
                }
            }
            Err(error) => debug!("runner status poll failed: {error}"),
        }
    }

    fn spawn_engine_monitor(&self, handle: EngineHandle) {
        let weak = Arc::downgrade(&self.shared);
        let engine = Arc::clone(&self.shared.engine);
        let task = tokio::spawn(async move {
            let exit_status = engine.wait(&handle).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            Job { shared }.handle_engine_exit(exit_status).await;
        });
        self.lock_state().monitor_task = Some(task);
    }

    /// The ordered teardown: livelog progress (when active), the
    /// `uploading` marker, the terminal snapshot, `set_done`, `stopped`.
    /// Transport failures are logged and skipped; the relative order of
    /// whatever still goes out is never violated.
    async fn run_stop_sequence(&self, reason: StopReason) {
        let (livelog_task, engine_handle) = {
            let mut state = self.lock_state();
            // The monitor task ends on its own once the engine is gone;
            // this sequence may be running on it, so it is never aborted.
            state.monitor_task.take();
            (state.livelog_task.take(), state.engine_handle.take())
        };
        if let Some(task) = livelog_task {
            task.abort();
        }
        if let Some(handle) = engine_handle {
            if self.shared.engine.is_running(&handle).await {
                self.shared.engine.stop(&handle).await;
            }
        }

        let Some(id) = self.id() else {
            // Nothing was ever announced for this job, so there is no
            // remote bookkeeping to close out.
            self.set_status(JobStatus::Stopped);
            return;
        };
        let (livelog_active, progress, setup_error, exit_status, backend, cmd_srv_url) = {
            let state = self.lock_state();
            (
                state.livelog_viewers > 0,
                state.upload_progress.clone(),
                state.setup_error.clone(),
                state.engine_exit_status,
                state.info.setting("BACKEND").unwrap_or_default().to_owned(),
                state.info.url.clone(),
            )
        };

        if livelog_active {
            // Observed web UI behavior: the progress snapshot precedes the
            // upload marker.
            let path = format!("/liveviewhandler/api/v1/jobs/{id}/upload_progress");
            if let Err(error) = self
                .shared
                .client
                .send(ApiMethod::Post, &path, json!(progress))
                .await
            {
                warn!("failed to post the final upload progress for job {id}: {error}");
            }
        }

        let status_path = format!("jobs/{id}/status");
        let marker = StatusBody::new(StatusFrame::uploading_marker(self.shared.worker.id));
        if let Err(error) = self
            .shared
            .client
            .send(ApiMethod::Post, &status_path, json!(marker))
            .await
        {
            warn!("failed to post the upload marker for job {id}: {error}");
        }

        let test_order = self.shared.pool.read_test_order().await;
        let terminal = StatusBody::new(StatusFrame::terminal(
            backend,
            cmd_srv_url,
            test_order,
            self.shared.worker.hostname.clone(),
            self.shared.worker.id,
            setup_error,
            exit_status,
        ));
        if let Err(error) = self
            .shared
            .client
            .send(ApiMethod::Post, &status_path, json!(terminal))
            .await
        {
            warn!("failed to post the final status for job {id}: {error}");
        }

        if let Err(error) = self
            .shared
            .client
            .send(ApiMethod::Post, &format!("jobs/{id}/set_done"), Value::Null)
            .await
        {
            warn!("failed to post set_done for job {id}: {error}");
        }

        self.set_status(JobStatus::Stopped);
        if let Err(error) = self.shared.pool.release().await {
            debug!("failed to release the pool directory: {error}");
        }
        info!("job {id} stopped (reason: {reason})");
    }
}
