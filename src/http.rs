//! The admission surface: health, metrics, and the three control endpoints.
//! Grounded on the teacher's `local_backend/src/router.rs` /
//! `app_metrics.rs` shape (small `axum::Router<AppState>`, `tower_http`
//! trace layer) and
//! `examples/original_source/internal/pkg/api/command.go` for the exact
//! endpoint set and 200/429 semantics.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{
        get,
        post,
    },
    Json,
    Router,
};
use mongodb::Client;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::{
    metrics::Metrics,
    supervisor::{
        Command,
        CommandSender,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub source: Client,
    pub target: Client,
    pub metrics: Metrics,
    pub commands: CommandSender,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/command/incr/pause", post(pause_incremental))
        .route("/command/incr/resume", post(resume_incremental))
        .route("/command/snapshot", post(request_snapshot))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let source_ok = state.source.database("admin").run_command(bson::doc! { "ping": 1 }).await.is_ok();
    let target_ok = state.target.database("admin").run_command(bson::doc! { "ping": 1 }).await.is_ok();

    let body = serde_json::json!({
        "source": if source_ok { "ok" } else { "error" },
        "target": if target_ok { "ok" } else { "error" },
    });

    let status = if source_ok && target_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn pause_incremental(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.commands.try_send(Command::PauseIncremental) {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    }
}

async fn resume_incremental(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.commands.try_send(Command::ResumeIncremental) {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotTarget {
    database: String,
    collection: String,
}

async fn request_snapshot(State(state): State<Arc<AppState>>, Json(targets): Json<Vec<SnapshotTarget>>) -> StatusCode {
    let mut all_enqueued = true;
    for target in targets {
        let enqueued = state.commands.try_send(Command::Snapshot { database: target.database, collection: target.collection });
        all_enqueued &= enqueued;
    }
    if all_enqueued {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_target_deserializes() {
        let json = r#"[{"database": "db1", "collection": "coll1"}]"#;
        let targets: Vec<SnapshotTarget> = serde_json::from_str(json).unwrap();
        assert_eq!(targets[0].database, "db1");
        assert_eq!(targets[0].collection, "coll1");
    }
}
