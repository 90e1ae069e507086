use crate::agent_link::AgentLink;
use crate::dispatch::Dispatcher;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dock_core::{DockError, ProjectId};
use dock_supervisor::ProcessControl;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub link: Arc<AgentLink>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/apps/:id/start", post(start))
        .route("/apps/:id/stop", post(stop))
        .route("/apps/:id/restart", post(restart))
        .route("/apps/:id/install", post(install))
        .route("/apps/:id/build", post(build))
        .route("/probe", post(probe))
        .route("/agent/ws", get(agent_ws))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

pub struct ApiError(pub DockError);

impl From<DockError> for ApiError {
    fn from(err: DockError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &DockError) -> StatusCode {
    match err {
        DockError::NotFound(_) => StatusCode::NOT_FOUND,
        DockError::AlreadyRunning | DockError::PortInUse(_) => StatusCode::CONFLICT,
        DockError::AgentTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        DockError::AgentDisconnected | DockError::RemoteRejected(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (status_for(&self.0), Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn ok() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn start(State(state): State<AppState>, Path(id): Path<ProjectId>) -> ApiResult {
    state.dispatcher.start(id).await?;
    Ok(ok())
}

async fn stop(State(state): State<AppState>, Path(id): Path<ProjectId>) -> ApiResult {
    state.dispatcher.stop(id).await?;
    Ok(ok())
}

async fn restart(State(state): State<AppState>, Path(id): Path<ProjectId>) -> ApiResult {
    state.dispatcher.restart(id).await?;
    Ok(ok())
}

async fn install(State(state): State<AppState>, Path(id): Path<ProjectId>) -> ApiResult {
    state.dispatcher.install(id).await?;
    Ok(ok())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildRequest {
    #[serde(default)]
    then_start: bool,
}

async fn build(
    State(state): State<AppState>,
    Path(id): Path<ProjectId>,
    body: Option<Json<BuildRequest>>,
) -> ApiResult {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    state.dispatcher.build(id, request.then_start).await?;
    Ok(ok())
}

async fn probe(State(state): State<AppState>) -> ApiResult {
    let report = state.dispatcher.probe_ports().await?;
    Ok(Json(json!({ "probed": report.probed, "updated": report.updated })))
}

#[derive(Debug, Deserialize)]
struct AgentQuery {
    #[serde(default)]
    token: String,
}

async fn agent_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<AgentQuery>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    if !state.link.authorize(&query.token) {
        warn!(event = "agent_unauthorized", remote = %remote);
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    let link = state.link.clone();
    ws.on_upgrade(move |socket| async move {
        link.handle_socket(socket, remote).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_http_statuses() {
        assert_eq!(status_for(&DockError::NotFound(4)), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&DockError::AlreadyRunning), StatusCode::CONFLICT);
        assert_eq!(status_for(&DockError::PortInUse(3000)), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&DockError::AgentTimeout("start".to_string())),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&DockError::RemoteRejected("nope".to_string())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_for(&DockError::AgentDisconnected), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&DockError::ProcessExitedNonZero { code: 2 }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
