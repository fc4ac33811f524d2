use std::sync::Arc;

use anyhow::Result;
use backend_isotovideo::{IsotovideoEngine, IsotovideoEngineConfig};
use testgrid_worker_client::{UiClient, WebUiClient, WebUiClientConfig};
use testgrid_worker_lifecycle::{WorkerContext, WorkerSettings};
use testgrid_worker_protocol::engine::TestEngine;
use testgrid_worker_protocol::job::StopReason;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let settings = WorkerSettings::from_env()?;
    let client = Arc::new(WebUiClient::new(WebUiClientConfig {
        api_url: settings.api_url.clone(),
        websocket_url: settings.websocket_url.clone(),
        api_key: settings.api_key.clone(),
        api_secret: settings.api_secret.clone(),
        host: settings.hostname.clone(),
        instance: settings.instance,
    }));
    client.register().await?;
    client.connect_websocket().await?;

    let engine = Arc::new(IsotovideoEngine::new(IsotovideoEngineConfig::default()));
    let context = Arc::new(WorkerContext::new(
        settings,
        Arc::clone(&client) as Arc<dyn UiClient>,
        engine as Arc<dyn TestEngine>,
    ));
    let _websocket_watch = context.spawn_websocket_watch();
    info!("worker instance {} ready", context.instance());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    if let Some(job) = context.current_job() {
        job.stop(StopReason::Quit).await;
    }
    Ok(())
}
