//! Shared worker protocol vocabulary.
//!
//! Types exchanged between the worker lifecycle engine, the web UI client,
//! and the test-engine adapters live here so the lifecycle crate only
//! depends on seams, never on concrete transports.

pub mod client;
pub mod engine;
pub mod error;
pub mod frames;
pub mod job;
pub mod status;

pub use client::{ApiMethod, UiClient};
pub use engine::{EngineHandle, EngineSpawnRequest, TestEngine};
pub use error::{WorkerError, WorkerResult};
pub use frames::{AcceptedMessage, StatusBody, StatusFrame, UploadProgress};
pub use job::{JobInfo, StopReason};
pub use status::JobStatus;
