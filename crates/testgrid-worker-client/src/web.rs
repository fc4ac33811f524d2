use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use reqwest::Url;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use async_trait::async_trait;
use testgrid_worker_protocol::client::{ApiMethod, UiClient};
use testgrid_worker_protocol::error::{WorkerError, WorkerResult};

use crate::auth::{microtime_now, signature, API_HASH_HEADER, API_KEY_HEADER, API_MICROTIME_HEADER};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebUiClientConfig {
    /// REST base, e.g. `http://webui.example/api/v1`.
    pub api_url: String,
    /// Status socket, e.g. `ws://webui.example/ws/worker/7`.
    pub websocket_url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Hostname announced on registration.
    pub host: String,
    pub instance: u32,
}

/// REST + status-WebSocket channel to the web UI.
///
/// REST calls are signed with the key/secret digest headers. The status
/// socket is connected explicitly; a reader task watches for the close
/// frame and flips the [`UiClient::websocket_closed`] signal.
pub struct WebUiClient {
    http: reqwest::Client,
    config: WebUiClientConfig,
    websocket: AsyncMutex<Option<WsSink>>,
    reader_task: AsyncMutex<Option<JoinHandle<()>>>,
    closed_tx: watch::Sender<bool>,
}

impl WebUiClient {
    pub fn new(config: WebUiClientConfig) -> Self {
        let (closed_tx, _closed_rx) = watch::channel(false);
        Self {
            http: reqwest::Client::new(),
            config,
            websocket: AsyncMutex::new(None),
            reader_task: AsyncMutex::new(None),
            closed_tx,
        }
    }

    /// Establish the status WebSocket and start watching for its close.
    pub async fn connect_websocket(&self) -> WorkerResult<()> {
        let (stream, _response) = connect_async(self.config.websocket_url.as_str())
            .await
            .map_err(|error| {
                WorkerError::Transport(format!(
                    "status websocket connect to {} failed: {error}",
                    self.config.websocket_url
                ))
            })?;
        let (sink, mut source) = stream.split();

        *self.websocket.lock().await = Some(sink);
        self.closed_tx.send_replace(false);

        let closed_tx = self.closed_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Close(_)) => break,
                    Ok(other) => debug!("ignoring inbound status socket message: {other:?}"),
                    Err(error) => {
                        warn!("status socket read failed: {error}");
                        break;
                    }
                }
            }
            closed_tx.send_replace(true);
        });

        let mut reader_task = self.reader_task.lock().await;
        if let Some(previous) = reader_task.replace(reader) {
            previous.abort();
        }
        Ok(())
    }

    /// Resolve `path` against the API base; a leading slash addresses the
    /// web UI origin directly (used by the liveview handler routes).
    fn endpoint(&self, path: &str) -> WorkerResult<Url> {
        let base = Url::parse(&self.config.api_url).map_err(|error| {
            WorkerError::Configuration(format!(
                "invalid api url {}: {error}",
                self.config.api_url
            ))
        })?;
        let joined = if path.starts_with('/') {
            base.join(path)
        } else {
            let mut api = base;
            if !api.path().ends_with('/') {
                let with_slash = format!("{}/", api.path());
                api.set_path(&with_slash);
            }
            api.join(path)
        };
        joined.map_err(|error| {
            WorkerError::Configuration(format!("invalid request path {path}: {error}"))
        })
    }
}

#[async_trait]
impl UiClient for WebUiClient {
    async fn send(&self, method: ApiMethod, path: &str, body: Value) -> WorkerResult<Value> {
        let url = self.endpoint(path)?;
        let microtime = microtime_now();
        let hash = signature(&self.config.api_secret, url.path(), &microtime);

        let mut request = match method {
            ApiMethod::Get => self.http.get(url),
            ApiMethod::Post => self.http.post(url),
        }
        .header(API_KEY_HEADER, &self.config.api_key)
        .header(API_MICROTIME_HEADER, microtime)
        .header(API_HASH_HEADER, hash);
        if !body.is_null() {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|error| {
            WorkerError::Transport(format!("{} {path} failed: {error}", method.as_str()))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::Transport(format!(
                "{} {path} failed with status {status}: {body}",
                method.as_str()
            )));
        }

        let text = response.text().await.map_err(|error| {
            WorkerError::Transport(format!("{} {path} response read failed: {error}", method.as_str()))
        })?;
        if text.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&text).map_err(|error| {
            WorkerError::Transport(format!("{} {path} response parse failed: {error}", method.as_str()))
        })
    }

    async fn send_status(&self, payload: Value) -> WorkerResult<()> {
        let mut websocket = self.websocket.lock().await;
        let Some(sink) = websocket.as_mut() else {
            return Err(WorkerError::Transport(
                "status websocket is not connected".to_owned(),
            ));
        };
        if let Err(error) = sink.send(Message::Text(payload.to_string().into())).await {
            websocket.take();
            self.closed_tx.send_replace(true);
            return Err(WorkerError::Transport(format!(
                "status websocket send failed: {error}"
            )));
        }
        Ok(())
    }

    async fn register(&self) -> WorkerResult<()> {
        let body = serde_json::json!({
            "host": self.config.host,
            "instance": self.config.instance,
        });
        let response = self.send(ApiMethod::Post, "workers", body).await?;
        match response.get("id").and_then(Value::as_u64) {
            Some(id) => info!("registered with the web UI as worker {id}"),
            None => info!("registered with the web UI"),
        }
        Ok(())
    }

    fn websocket_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Message;

    use testgrid_worker_protocol::client::{ApiMethod, UiClient};
    use testgrid_worker_protocol::error::WorkerError;

    use super::{WebUiClient, WebUiClientConfig};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn client_for(addr: SocketAddr) -> WebUiClient {
        WebUiClient::new(WebUiClientConfig {
            api_url: format!("http://{addr}/api/v1"),
            websocket_url: format!("ws://{addr}/ws/1"),
            api_key: "KEY".to_owned(),
            api_secret: "SECRET".to_owned(),
            host: "grid-7".to_owned(),
            instance: 1,
        })
    }

    #[test]
    fn endpoint_joins_relative_paths_under_the_api_base() {
        let client = client_for(([127, 0, 0, 1], 80).into());
        let url = client.endpoint("jobs/3/status").expect("join endpoint");
        assert_eq!(url.path(), "/api/v1/jobs/3/status");
    }

    #[test]
    fn endpoint_sends_absolute_paths_to_the_origin() {
        let client = client_for(([127, 0, 0, 1], 80).into());
        let url = client
            .endpoint("/liveviewhandler/api/v1/jobs/3/upload_progress")
            .expect("join endpoint");
        assert_eq!(url.path(), "/liveviewhandler/api/v1/jobs/3/upload_progress");
    }

    #[tokio::test]
    async fn send_signs_requests_and_parses_the_json_response() {
        #[derive(Clone, Default)]
        struct Captured {
            headers: Arc<Mutex<Vec<(String, String)>>>,
        }

        async fn handler(
            State(captured): State<Captured>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> Json<Value> {
            let mut seen = captured.headers.lock().expect("captured lock");
            for name in ["x-api-key", "x-api-microtime", "x-api-hash"] {
                if let Some(value) = headers.get(name) {
                    seen.push((
                        name.to_owned(),
                        value.to_str().unwrap_or_default().to_owned(),
                    ));
                }
            }
            Json(json!({"echo": body}))
        }

        let captured = Captured::default();
        let app = Router::new()
            .route("/api/v1/jobs/3/status", post(handler))
            .with_state(captured.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve stub");
        });

        let client = client_for(addr);
        let response = timeout(
            TEST_TIMEOUT,
            client.send(ApiMethod::Post, "jobs/3/status", json!({"status": {"uploading": 1}})),
        )
        .await
        .expect("request timed out")
        .expect("request should succeed");

        assert_eq!(response["echo"]["status"]["uploading"], json!(1));
        let seen = captured.headers.lock().expect("captured lock");
        assert_eq!(seen.len(), 3, "expected all three auth headers");
        assert_eq!(seen[0].1, "KEY");
        assert_eq!(seen[2].1.len(), 64);
    }

    #[tokio::test]
    async fn send_status_without_a_connection_is_a_transport_error() {
        let client = client_for(([127, 0, 0, 1], 80).into());
        let error = client
            .send_status(json!({"type": "accepted"}))
            .await
            .expect_err("must fail without a websocket");
        assert!(matches!(error, WorkerError::Transport(_)));
    }

    #[tokio::test]
    async fn websocket_close_flips_the_closed_signal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ws stub");
        let addr = listener.local_addr().expect("ws stub addr");
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept ws");
            let mut websocket = tokio_tungstenite::accept_async(stream)
                .await
                .expect("ws handshake");
            let first = websocket
                .next()
                .await
                .expect("first frame")
                .expect("frame ok");
            websocket.close(None).await.expect("close ws");
            first
        });

        let client = client_for(addr);
        client.connect_websocket().await.expect("connect ws");
        let mut closed = client.websocket_closed();
        assert!(!*closed.borrow());

        client
            .send_status(json!({"jobid": 1, "type": "accepted"}))
            .await
            .expect("send status frame");

        let first = timeout(TEST_TIMEOUT, server)
            .await
            .expect("server timed out")
            .expect("server task");
        match first {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(text.as_str()).expect("frame json");
                assert_eq!(value, json!({"jobid": 1, "type": "accepted"}));
            }
            other => panic!("expected text frame, got {other:?}"),
        }

        timeout(TEST_TIMEOUT, closed.wait_for(|closed| *closed))
            .await
            .expect("close signal timed out")
            .expect("close signal");
    }
}
