use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::WorkerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Post,
}

impl ApiMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// Outbound channel to the web UI.
///
/// `send` is fire-and-forget from the job's point of view: completion is
/// observed through future resolution, two calls issued in sequence reach
/// the wire in that sequence, and retries are the client's business. A
/// `Value::Null` body is a bodyless request on the wire.
#[async_trait]
pub trait UiClient: Send + Sync {
    async fn send(&self, method: ApiMethod, path: &str, body: Value) -> WorkerResult<Value>;

    /// Push a frame over the status WebSocket.
    async fn send_status(&self, payload: Value) -> WorkerResult<()>;

    /// Re-handshake with the web UI after a fatal disconnect.
    async fn register(&self) -> WorkerResult<()>;

    /// Observers see `true` once the control socket has closed.
    fn websocket_closed(&self) -> watch::Receiver<bool>;
}
