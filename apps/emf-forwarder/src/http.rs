use crate::connection::{ConnectionHandle, Connections};
use crate::pipeline::{Diagnostics, IssueRegistry, OutageIssue};
use crate::status::DeliveryStatus;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct HttpState {
    pub connections: Arc<Connections>,
    pub issues: Arc<dyn IssueRegistry>,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectionQuery {
    #[serde(default)]
    connection_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConnectionStatus {
    connection_id: String,
    status: DeliveryStatus,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Status,
    SendNow,
    ClearQueue,
}

fn select<'a>(state: &'a HttpState, query: &ConnectionQuery) -> Result<Vec<&'a ConnectionHandle>, (StatusCode, String)> {
    state
        .connections
        .select(query.connection_id.as_deref())
        .map_err(|err| (StatusCode::NOT_FOUND, err.to_string()))
}

fn unavailable(err: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
}

/// Applies `action` to each selected connection, in configuration order.
async fn run_action(state: &HttpState, query: &ConnectionQuery, action: Action) -> ApiResult<Vec<ConnectionStatus>> {
    let handles = select(state, query)?;
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        let status = match action {
            Action::Status => handle.status().await,
            Action::SendNow => handle.send_now().await,
            Action::ClearQueue => handle.clear_queue().await,
        }
        .map_err(unavailable)?;
        out.push(ConnectionStatus {
            connection_id: handle.id().to_string(),
            status,
        });
    }
    Ok(Json(out))
}

async fn get_status(State(state): State<HttpState>, Query(query): Query<ConnectionQuery>) -> ApiResult<Vec<ConnectionStatus>> {
    run_action(&state, &query, Action::Status).await
}

async fn post_send_now(State(state): State<HttpState>, Query(query): Query<ConnectionQuery>) -> ApiResult<Vec<ConnectionStatus>> {
    run_action(&state, &query, Action::SendNow).await
}

async fn post_clear_queue(State(state): State<HttpState>, Query(query): Query<ConnectionQuery>) -> ApiResult<Vec<ConnectionStatus>> {
    run_action(&state, &query, Action::ClearQueue).await
}

async fn get_diagnostics(State(state): State<HttpState>, Query(query): Query<ConnectionQuery>) -> ApiResult<Vec<Diagnostics>> {
    let handles = select(&state, &query)?;
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.diagnostics().await.map_err(unavailable)?);
    }
    Ok(Json(out))
}

async fn get_issues(State(state): State<HttpState>) -> Json<Vec<OutageIssue>> {
    Json(state.issues.list())
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/send_now", post(post_send_now))
        .route("/v1/clear_queue", post(post_clear_queue))
        .route("/v1/diagnostics", get(get_diagnostics))
        .route("/v1/issues", get(get_issues))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
