mod collector;
mod config;
mod connection;
mod fields;
mod hass;
mod http;
mod pipeline;
mod queue;
mod scheduler;
mod status;
mod submit;

use crate::config::Config;
use crate::connection::Connections;
use crate::pipeline::{IssueBoard, IssueRegistry, Pipeline, PipelineDeps};
use crate::queue::{DurableQueue, JsonFileStore};
use crate::scheduler::{Clock, SystemClock};
use crate::status::TracingStatusSink;
use crate::submit::HttpSubmitter;
use anyhow::{Context, Result};
use std::fs;
use std::sync::Arc;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,emf_forwarder=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let config = Config::from_env()?;

    fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("failed to create {}", config.state_dir.display()))?;

    let issues: Arc<dyn IssueRegistry> = Arc::new(IssueBoard::default());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let deps = PipelineDeps {
        provider: Arc::new(hass::HomeAssistantClient::new(&config.ha_url, &config.ha_token)?),
        sink: Arc::new(TracingStatusSink),
        issues: issues.clone(),
        clock: clock.clone(),
    };

    let mut handles = Vec::with_capacity(config.connections.len());
    for connection_config in &config.connections {
        let submitter = HttpSubmitter::new(connection_config.base_url.clone(), config.submit_timeout)?;
        let queue = DurableQueue::restore(Box::new(JsonFileStore::for_connection(
            &config.state_dir,
            &connection_config.id,
        )));
        let pipeline = Pipeline::new(connection_config.clone(), queue, Arc::new(submitter), deps.clone());
        handles.push(connection::spawn_connection(pipeline));
    }
    let connections = Arc::new(Connections::new(handles));

    let scheduler_handle = tokio::spawn(scheduler::run_scheduler(
        connections.clone(),
        clock,
        config.send_every,
    ));

    let app = http::router(http::HttpState {
        connections,
        issues,
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    tracing::info!(
        bind=%config.http_bind,
        connections = config.connections.len(),
        send_every_secs = config.send_every.as_secs(),
        "emf-forwarder HTTP listening"
    );
    let http_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error=%err, "admin HTTP server exited");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = scheduler_handle => {}
        _ = http_handle => {}
    }

    Ok(())
}
