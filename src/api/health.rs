//! Health check endpoints.

use actix_web::{get, web, HttpResponse, Responder};

use crate::AppState;

/// Liveness probe — always OK if the process is running.
#[utoipa::path(
    get,
    path = "/health/live",
    responses(
        (status = 200, description = "Service is alive", body = serde_json::Value)
    ),
    tag = "health"
)]
#[get("/health/live")]
pub async fn health_live() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

/// Readiness probe — OK once the default model (if configured) is resident, or always OK when
/// no default model is configured (model loads are then driven entirely by request traffic).
#[utoipa::path(
    get,
    path = "/health/ready",
    responses(
        (status = 200, description = "Service is ready", body = serde_json::Value),
        (status = 503, description = "Service is not ready", body = serde_json::Value)
    ),
    tag = "health"
)]
#[get("/health/ready")]
pub async fn health_ready(state: web::Data<AppState>) -> impl Responder {
    let default_model = state.config.cache.default_model.clone();

    let ready = match &default_model {
        Some(id) => state.cache.is_alive(id).await,
        None => true,
    };

    if ready {
        HttpResponse::Ok().json(serde_json::json!({ "status": "ok", "default_model_loaded": ready }))
    } else {
        HttpResponse::ServiceUnavailable()
            .json(serde_json::json!({ "status": "not_ready", "default_model_loaded": ready }))
    }
}
