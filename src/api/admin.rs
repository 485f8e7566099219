//! Admin/control surface: not part of the OpenAI-compatible schema, namespaced under `/admin`.
//!
//! Exposes the Model Cache's and Load Balancer's public operations (spec §4.4.2, §4.6) to an
//! operator UI or CLI. Grounded on the same handler/instrumentation idiom as `chat.rs`, since
//! the teacher carries no admin surface of its own for this crate.

use actix_web::{delete, get, post, web, HttpResponse, Responder, ResponseError};
use async_stream::stream;
use serde::Deserialize;
use tracing::instrument;
use utoipa::ToSchema;

use crate::balancer::Backend;
use crate::errors::OrchestratorError;
use crate::models;
use crate::worker_args::WorkerArgsOverrides;
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoadRequest {
    pub path: String,
    #[serde(default)]
    pub projector_path: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct HotSwapRequest {
    pub target_id: String,
    pub path: String,
    #[serde(default)]
    pub projector_path: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PrewarmRequest {
    pub path: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterBackendRequest {
    pub id: String,
    pub base_url: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_served_models")]
    pub served_models: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

fn default_health_path() -> String {
    "/health".to_string()
}
fn default_served_models() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_weight() -> u32 {
    1
}
fn default_max_concurrent() -> u32 {
    4
}

/// `GET /v1/models` — orchestrator-level model discovery: union of configured model ids,
/// independent of current residency (spec §2.1).
#[utoipa::path(get, path = "/v1/models", responses((status = 200, body = models::ListModelsResponse)), tag = "models")]
#[get("/v1/models")]
#[instrument(skip(state))]
pub async fn list_models(state: web::Data<AppState>) -> impl Responder {
    match models::discover_catalog(&state.model_dir).await {
        Ok(catalog) => HttpResponse::Ok().json(models::to_openai_listing(&catalog)),
        Err(e) => OrchestratorError::InternalInvariantViolation(e.to_string()).error_response(),
    }
}

#[utoipa::path(
    post,
    path = "/admin/models/{id}/load",
    request_body = LoadRequest,
    responses((status = 200, description = "Model resident and ready"), (status = 503, description = "Capacity or readiness failure")),
    tag = "admin"
)]
#[post("/admin/models/{id}/load")]
#[instrument(skip(state, body))]
pub async fn load_model(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<LoadRequest>,
) -> impl Responder {
    let model_id = path.into_inner();
    let body = body.into_inner();
    match state.cache.get_or_load(&model_id, &body.path, body.projector_path).await {
        Ok(snapshot) => HttpResponse::Ok().json(snapshot),
        Err(e) => e.error_response(),
    }
}

#[utoipa::path(post, path = "/admin/models/{id}/unload", responses((status = 200)), tag = "admin")]
#[post("/admin/models/{id}/unload")]
#[instrument(skip(state))]
pub async fn unload_model(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let removed = state.cache.unload(&path.into_inner()).await;
    HttpResponse::Ok().json(serde_json::json!({ "removed": removed }))
}

#[utoipa::path(post, path = "/admin/unload-all", responses((status = 200)), tag = "admin")]
#[post("/admin/unload-all")]
#[instrument(skip(state))]
pub async fn unload_all(state: web::Data<AppState>) -> impl Responder {
    state.cache.unload_all().await;
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[utoipa::path(
    post,
    path = "/admin/hot-swap",
    request_body = HotSwapRequest,
    responses((status = 200, description = "Swap completed")),
    tag = "admin"
)]
#[post("/admin/hot-swap")]
#[instrument(skip(state, body))]
pub async fn hot_swap(state: web::Data<AppState>, body: web::Json<HotSwapRequest>) -> impl Responder {
    let body = body.into_inner();
    match state.cache.hot_swap(&body.target_id, &body.path, body.projector_path).await {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => e.error_response(),
    }
}

#[utoipa::path(get, path = "/admin/stats", responses((status = 200)), tag = "admin")]
#[get("/admin/stats")]
#[instrument(skip(state))]
pub async fn stats(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.cache.stats().await)
}

#[utoipa::path(get, path = "/admin/progress", responses((status = 200)), tag = "admin")]
#[get("/admin/progress")]
#[instrument(skip(state))]
pub async fn progress(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.cache.loading_progress())
}

/// SSE subscription to loading-progress snapshots (spec §4.3/§6). A lagging client resyncs to
/// the latest snapshot rather than replaying the gap — see `tracker::LoadingTracker::subscribe`.
#[utoipa::path(get, path = "/admin/progress/stream", responses((status = 200, content_type = "text/event-stream")), tag = "admin")]
#[get("/admin/progress/stream")]
#[instrument(skip(state))]
pub async fn progress_stream(state: web::Data<AppState>) -> impl Responder {
    let mut rx = state.cache.subscribe_progress();

    let body_stream = stream! {
        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    let frame = serde_json::to_string(&snapshot).unwrap_or_default();
                    yield Ok::<_, actix_web::Error>(web::Bytes::from(format!("data: {frame}\n\n")));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(body_stream)
}

#[utoipa::path(post, path = "/admin/default/{id}", responses((status = 200)), tag = "admin")]
#[post("/admin/default/{id}")]
#[instrument(skip(state))]
pub async fn set_default(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    state.cache.set_default(Some(path.into_inner())).await;
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[utoipa::path(delete, path = "/admin/default", responses((status = 200)), tag = "admin")]
#[delete("/admin/default")]
#[instrument(skip(state))]
pub async fn clear_default(state: web::Data<AppState>) -> impl Responder {
    state.cache.set_default(None).await;
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[utoipa::path(post, path = "/admin/capacity/{n}", responses((status = 200)), tag = "admin")]
#[post("/admin/capacity/{n}")]
#[instrument(skip(state))]
pub async fn set_capacity(state: web::Data<AppState>, n: web::Path<usize>) -> impl Responder {
    state.cache.set_capacity(n.into_inner());
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[utoipa::path(post, path = "/admin/system-ram/{mb}", responses((status = 200)), tag = "admin")]
#[post("/admin/system-ram/{mb}")]
#[instrument(skip(state))]
pub async fn set_system_ram(state: web::Data<AppState>, mb: web::Path<u64>) -> impl Responder {
    state.cache.set_system_ram_mb(mb.into_inner());
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

/// Tuning setters for context size, batch size, parallel slots, thread count, flash attention,
/// and speculative-decoding draft model (spec §4.4.2). KV-cache quantisation and continuous
/// batching remain policy-derived (§4.4.4) and are not overridable through this endpoint.
#[utoipa::path(post, path = "/admin/tuning", request_body = WorkerArgsOverrides, responses((status = 200)), tag = "admin")]
#[post("/admin/tuning")]
#[instrument(skip(state, body))]
pub async fn set_tuning(state: web::Data<AppState>, body: web::Json<WorkerArgsOverrides>) -> impl Responder {
    state.cache.set_overrides(body.into_inner()).await;
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[utoipa::path(post, path = "/admin/prewarm", request_body = PrewarmRequest, responses((status = 200)), tag = "admin")]
#[post("/admin/prewarm")]
#[instrument(skip(state, body))]
pub async fn prewarm(state: web::Data<AppState>, body: web::Json<PrewarmRequest>) -> impl Responder {
    match state.cache.prewarm(&body.path).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "status": "ok" })),
        Err(e) => OrchestratorError::InternalInvariantViolation(e.to_string()).error_response(),
    }
}

#[utoipa::path(post, path = "/admin/prewarm-all", responses((status = 200)), tag = "admin")]
#[post("/admin/prewarm-all")]
#[instrument(skip(state))]
pub async fn prewarm_all(state: web::Data<AppState>) -> impl Responder {
    state.cache.prewarm_all(&state.model_dir).await;
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[utoipa::path(post, path = "/admin/fast-prewarm", request_body = PrewarmRequest, responses((status = 200)), tag = "admin")]
#[post("/admin/fast-prewarm")]
#[instrument(skip(state, body))]
pub async fn fast_prewarm(state: web::Data<AppState>, body: web::Json<PrewarmRequest>) -> impl Responder {
    match state.cache.fast_prewarm(&body.path).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "status": "ok" })),
        Err(e) => OrchestratorError::InternalInvariantViolation(e.to_string()).error_response(),
    }
}

#[utoipa::path(get, path = "/admin/backends", responses((status = 200)), tag = "admin")]
#[get("/admin/backends")]
#[instrument(skip(state))]
pub async fn list_backends(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.balancer.list().await)
}

#[utoipa::path(post, path = "/admin/backends", request_body = RegisterBackendRequest, responses((status = 200)), tag = "admin")]
#[post("/admin/backends")]
#[instrument(skip(state, body))]
pub async fn register_backend(state: web::Data<AppState>, body: web::Json<RegisterBackendRequest>) -> impl Responder {
    let body = body.into_inner();
    let backend = Backend::new(
        body.id,
        body.base_url,
        body.health_path,
        body.served_models,
        body.weight,
        body.max_concurrent,
    );
    state.balancer.register(backend).await;
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[utoipa::path(delete, path = "/admin/backends/{id}", responses((status = 200)), tag = "admin")]
#[delete("/admin/backends/{id}")]
#[instrument(skip(state))]
pub async fn deregister_backend(state: web::Data<AppState>, id: web::Path<String>) -> impl Responder {
    let removed = state.balancer.deregister(&id.into_inner()).await;
    HttpResponse::Ok().json(serde_json::json!({ "removed": removed }))
}
