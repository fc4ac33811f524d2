//! Per-job named event bus.

pub mod bus;

pub use bus::{EventToken, JobEventBus};

/// Emitted after the job's status field has been updated; payload
/// `{"status": "<new status>"}`.
pub const STATUS_CHANGED: &str = "status_changed";

/// Emitted when the last outstanding result upload has drained.
pub const UPLOADING_RESULTS_CONCLUDED: &str = "uploading_results_concluded";
