use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Job description as handed out by the web UI.
///
/// `settings` is treated as opaque apart from the few keys the worker
/// forwards to the engine; `url` is the command-server URL of the runner
/// subprocess once the web UI knows it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: Option<u64>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(rename = "URL", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl JobInfo {
    pub fn new(id: u64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// String-typed settings lookup; non-string values read as absent.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }
}

/// Why a job left the running part of its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Regular completion: all results were uploaded.
    Done,
    /// The control socket closed before the job was ever owned.
    Abandoned,
    /// The engine subprocess exited unexpectedly.
    Died,
    /// The engine could not be started.
    SetupFailure,
    /// The worker process itself is shutting down.
    Quit,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Abandoned => "abandoned",
            Self::Died => "died",
            Self::SetupFailure => "setup failure",
            Self::Quit => "quit",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
