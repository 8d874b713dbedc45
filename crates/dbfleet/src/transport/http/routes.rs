//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;

use crate::service::{Admission, FleetService, StartError};

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(default = "default_root_password")]
    pub mysql_root_password: String,
}

fn default_root_password() -> String {
    "root".to_string()
}

impl Default for StartRequest {
    fn default() -> Self {
        Self {
            mysql_root_password: default_root_password(),
        }
    }
}

async fn start_instance(
    State(service): State<Arc<FleetService>>,
    body: Option<Json<StartRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    match service.start(request.mysql_root_password) {
        Ok(Admission::Started(record)) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "accepted",
                "message": "MySQL instance is starting",
                "data": record
            })),
        ),
        Ok(Admission::Queued { position }) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "queued",
                "message": "Maximum number of MySQL instances reached. Request queued.",
                "queue_position": position
            })),
        ),
        Err(e @ (StartError::Registry(_) | StartError::Dispatch(_))) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "error",
                "message": e.to_string()
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "status": "error",
                "message": e.to_string()
            })),
        ),
    }
}

async fn stop_instance(
    State(service): State<Arc<FleetService>>,
    Path(port): Path<u16>,
) -> impl IntoResponse {
    match service.stop(port) {
        Ok(_record) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "success",
                "message": format!("MySQL instance on port {port} stopped successfully")
            })),
        ),
        Err(not_found) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "status": "error",
                "message": not_found.to_string()
            })),
        ),
    }
}

async fn list_instances(State(service): State<Arc<FleetService>>) -> impl IntoResponse {
    let snapshot = service.list();
    Json(serde_json::json!({
        "status": "success",
        "data": {
            "running_instances": snapshot.instances,
            "waiting_queue_size": snapshot.queue_size
        }
    }))
}

async fn instance_status(
    State(service): State<Arc<FleetService>>,
    Path(port): Path<u16>,
) -> impl IntoResponse {
    match service.status(port) {
        Some(record) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "success",
                "data": {
                    "port": record.port,
                    "status": record.status,
                    "error": record.error
                }
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "status": "error",
                "message": format!("No MySQL instance found on port {port}")
            })),
        ),
    }
}

async fn health_check(State(service): State<Arc<FleetService>>) -> impl IntoResponse {
    let snapshot = service.list();
    Json(serde_json::json!({
        "status": "ok",
        "running": snapshot.instances.len(),
        "capacity": snapshot.capacity,
        "waiting_queue_size": snapshot.queue_size
    }))
}

async fn shutdown(State(service): State<Arc<FleetService>>) -> impl IntoResponse {
    tracing::info!("shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<FleetService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .route("/instances", post(start_instance))
        .route("/instances", get(list_instances))
        .route("/instances/{port}", get(instance_status))
        .route("/instances/{port}/stop", post(stop_instance))
        .with_state(service)
}
