use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use testgrid_worker_protocol::client::UiClient;
use testgrid_worker_protocol::engine::TestEngine;
use testgrid_worker_protocol::error::{WorkerError, WorkerResult};
use testgrid_worker_protocol::job::JobInfo;

use crate::job::Job;
use crate::pool::PoolDirectory;

pub const ENV_API_URL: &str = "TESTGRID_API_URL";
pub const ENV_WEBSOCKET_URL: &str = "TESTGRID_WEBSOCKET_URL";
pub const ENV_API_KEY: &str = "TESTGRID_API_KEY";
pub const ENV_API_SECRET: &str = "TESTGRID_API_SECRET";
pub const ENV_POOL_ROOT: &str = "TESTGRID_POOL_ROOT";
pub const ENV_INSTANCE: &str = "TESTGRID_INSTANCE";
pub const ENV_WORKER_ID: &str = "TESTGRID_WORKER_ID";
pub const ENV_HOSTNAME: &str = "TESTGRID_HOSTNAME";

const DEFAULT_INSTANCE: u32 = 1;
const DEFAULT_HOSTNAME: &str = "localhost";

/// The slice of worker identity a job needs for its status frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: u64,
    pub hostname: String,
    pub instance: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub api_url: String,
    pub websocket_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub pool_root: PathBuf,
    #[serde(default = "default_instance")]
    pub instance: u32,
    pub worker_id: u64,
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

fn default_instance() -> u32 {
    DEFAULT_INSTANCE
}

fn default_hostname() -> String {
    std::env::var(ENV_HOSTNAME)
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| DEFAULT_HOSTNAME.to_owned())
}

impl WorkerSettings {
    pub fn from_env() -> WorkerResult<Self> {
        Ok(Self {
            api_url: required_env(ENV_API_URL)?,
            websocket_url: required_env(ENV_WEBSOCKET_URL)?,
            api_key: required_env(ENV_API_KEY)?,
            api_secret: required_env(ENV_API_SECRET)?,
            pool_root: PathBuf::from(required_env(ENV_POOL_ROOT)?),
            instance: parsed_env(ENV_INSTANCE)?.unwrap_or(DEFAULT_INSTANCE),
            worker_id: parsed_env(ENV_WORKER_ID)?.ok_or_else(|| {
                WorkerError::Configuration(format!("{ENV_WORKER_ID} must be set"))
            })?,
            hostname: default_hostname(),
        })
    }
}

fn required_env(key: &str) -> WorkerResult<String> {
    std::env::var(key)
        .map_err(|_| WorkerError::Configuration(format!("{key} must be set")))
}

fn parsed_env<T: std::str::FromStr>(key: &str) -> WorkerResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map(Some).map_err(|_| {
            WorkerError::Configuration(format!("{key} holds an unparsable value: {raw}"))
        }),
        Err(_) => Ok(None),
    }
}

/// Parent container for one worker instance: its settings, its pool
/// directory and the at-most-one job currently bound to it.
pub struct WorkerContext {
    settings: WorkerSettings,
    pool: PoolDirectory,
    client: Arc<dyn UiClient>,
    engine: Arc<dyn TestEngine>,
    current_job: Mutex<Option<Job>>,
}

impl WorkerContext {
    pub fn new(
        settings: WorkerSettings,
        client: Arc<dyn UiClient>,
        engine: Arc<dyn TestEngine>,
    ) -> Self {
        let pool = PoolDirectory::new(settings.pool_root.join(settings.instance.to_string()));
        Self {
            settings,
            pool,
            client,
            engine,
            current_job: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn instance(&self) -> u32 {
        self.settings.instance
    }

    pub fn pool(&self) -> &PoolDirectory {
        &self.pool
    }

    pub fn worker_info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.settings.worker_id,
            hostname: self.settings.hostname.clone(),
            instance: self.settings.instance,
        }
    }

    /// Bind a job to this instance. Refused while a previous job is still
    /// on its way to `stopped`.
    pub fn assign_job(&self, info: JobInfo) -> WorkerResult<Job> {
        let mut current = self
            .current_job
            .lock()
            .expect("current job lock poisoned");
        if let Some(job) = current.as_ref() {
            if !job.status().is_terminal() {
                return Err(WorkerError::InvalidState(
                    "a job is already assigned to this worker instance".to_owned(),
                ));
            }
        }
        let job = Job::new(
            info,
            Arc::clone(&self.client),
            Arc::clone(&self.engine),
            self.pool.clone(),
            self.worker_info(),
        );
        *current = Some(job.clone());
        Ok(job)
    }

    pub fn current_job(&self) -> Option<Job> {
        self.current_job
            .lock()
            .expect("current job lock poisoned")
            .clone()
    }

    /// Forward WebSocket close signals to whichever job is current.
    pub fn spawn_websocket_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let context = Arc::downgrade(self);
        let mut closed = self.client.websocket_closed();
        tokio::spawn(async move {
            loop {
                if closed.changed().await.is_err() {
                    break;
                }
                if !*closed.borrow() {
                    continue;
                }
                let Some(context) = context.upgrade() else {
                    break;
                };
                debug!("websocket connection finished");
                if let Some(job) = context.current_job() {
                    job.handle_websocket_finish();
                }
            }
        })
    }
}
