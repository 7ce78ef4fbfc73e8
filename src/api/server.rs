use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;

use crate::frame::{Resolution, Status};
use crate::sink::SnapshotStore;

#[derive(Clone)]
pub struct AppState {
    pub preview: SnapshotStore,
    pub alarms: SnapshotStore,
}

impl AppState {
    pub fn new(preview: SnapshotStore, alarms: SnapshotStore) -> Self {
        Self { preview, alarms }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    status: Status,
    resolution: Resolution,
    taken_at: String,
    last_alarm_at: Option<String>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/snapshot.jpg", get(snapshot_handler))
        .route("/api/alarm.jpg", get(alarm_handler))
        .with_state(state)
}

pub async fn start_server(state: AppState, port: u16) -> Result<(), std::io::Error> {
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("starting HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn status_handler(State(state): State<AppState>) -> Response {
    let Some(latest) = state.preview.latest() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no frame yet").into_response();
    };

    let response = StatusResponse {
        status: latest.status,
        resolution: latest.resolution,
        taken_at: latest.taken_at.to_rfc3339(),
        last_alarm_at: state.alarms.latest().map(|alarm| alarm.taken_at.to_rfc3339()),
    };
    axum::Json(response).into_response()
}

async fn snapshot_handler(State(state): State<AppState>) -> Response {
    match state.preview.latest() {
        Some(snapshot) => ([(header::CONTENT_TYPE, "image/jpeg")], snapshot.jpeg).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no frame yet").into_response(),
    }
}

async fn alarm_handler(State(state): State<AppState>) -> Response {
    match state.alarms.latest() {
        Some(snapshot) => ([(header::CONTENT_TYPE, "image/jpeg")], snapshot.jpeg).into_response(),
        None => (StatusCode::NOT_FOUND, "no alarm recorded").into_response(),
    }
}
