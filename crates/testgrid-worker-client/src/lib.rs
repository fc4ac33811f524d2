//! Outbound channel to the testgrid web UI.
//!
//! [`WebUiClient`] implements the [`UiClient`] seam with a signed REST
//! channel and the status WebSocket. The lifecycle crate only ever sees
//! the trait.

pub mod auth;
pub mod web;

pub use testgrid_worker_protocol::client::UiClient;
pub use web::{WebUiClient, WebUiClientConfig};
