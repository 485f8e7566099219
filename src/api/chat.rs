//! OpenAI-compatible chat completion endpoints.

use std::sync::Arc;
use std::time::Instant;

use actix_web::{post, web, HttpResponse, Responder, ResponseError};
use async_stream::stream;
use tracing::{info, instrument};

use crate::balancer::Backend;
use crate::errors::OrchestratorError;
use crate::proxy::{self, ChatRequest, ChatResponse};
use crate::AppState;

/// Where a request ultimately gets proxied: an externally registered backend tracked by the
/// load balancer, or a worker the Model Cache ensures is resident on this host.
pub(crate) enum Target {
    Balanced(Arc<Backend>),
    Local(String),
}

impl Target {
    pub(crate) fn base_url(&self) -> &str {
        match self {
            Target::Balanced(b) => &b.base_url,
            Target::Local(url) => url,
        }
    }

    pub(crate) fn record_outcome(&self, state: &AppState, latency: std::time::Duration, success: bool) {
        if let Target::Balanced(backend) = self {
            state.balancer.on_end(backend, latency, success);
        }
    }
}

/// Resolve a model id to a proxy target: the cross-backend load balancer when a backend is
/// registered for this model, otherwise the locally managed worker (spec §2: "client → C6
/// selects or C4 ensures worker").
pub(crate) async fn resolve_target(state: &AppState, model_id: &str) -> Result<Target, OrchestratorError> {
    if let Ok(backend) = state.balancer.pick(model_id).await {
        state.balancer.on_start(&backend);
        return Ok(Target::Balanced(backend));
    }

    let catalog = crate::models::discover_catalog(&state.model_dir)
        .await
        .map_err(|e| OrchestratorError::InternalInvariantViolation(e.to_string()))?;
    let entry = catalog
        .into_iter()
        .find(|m| m.id == model_id)
        .ok_or_else(|| OrchestratorError::ModelNotFound(model_id.to_string()))?;

    let snapshot = state.cache.get_or_load(&entry.id, &entry.path, entry.projector_path).await?;
    Ok(Target::Local(proxy::local_worker_url(snapshot.port)))
}

/// Fill in generation defaults / clamp caller-supplied sampling parameters against the
/// configured bounds (ambient `GenerationConfig`, shared by chat and completion requests).
pub(crate) fn apply_generation_defaults(
    state: &AppState,
    temperature: &mut Option<f32>,
    top_p: &mut Option<f32>,
    max_tokens: &mut Option<usize>,
) {
    let gen = &state.config.generation;
    *temperature = Some(match temperature {
        Some(t) => gen.validate_temperature(*t),
        None => gen.default_temperature,
    });
    *top_p = Some(match top_p {
        Some(p) => gen.validate_top_p(*p),
        None => gen.default_top_p,
    });
    *max_tokens = Some(match max_tokens {
        Some(m) => gen.validate_max_tokens(*m),
        None => gen.default_max_tokens,
    });
}

#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Chat completion generated successfully", body = ChatResponse),
        (status = 400, description = "Invalid request or unsupported model"),
        (status = 503, description = "Worker busy or unavailable")
    ),
    tag = "chat"
)]
#[post("/v1/chat/completions")]
#[instrument(skip(state, body), fields(model))]
pub async fn chat_completion(state: web::Data<AppState>, body: web::Json<ChatRequest>) -> impl Responder {
    let mut body = body.into_inner();
    let Some(model_id) = body.model.clone() else {
        return OrchestratorError::BadRequest("model is required".to_string()).error_response();
    };
    if body.messages.is_empty() {
        return OrchestratorError::BadRequest("messages array cannot be empty".to_string()).error_response();
    }

    apply_generation_defaults(&state, &mut body.temperature, &mut body.top_p, &mut body.max_tokens);

    tracing::Span::current().record("model", &model_id);

    if body.stream {
        return chat_completion_stream(state, model_id, body).await;
    }

    let target = match resolve_target(&state, &model_id).await {
        Ok(t) => t,
        Err(e) => return e.error_response(),
    };

    let start = Instant::now();
    let result = state.proxy.chat(target.base_url(), &model_id, body).await;
    target.record_outcome(&state, start.elapsed(), result.is_ok());

    match result {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(e) => e.error_response(),
    }
}

async fn chat_completion_stream(
    state: web::Data<AppState>,
    model_id: String,
    body: ChatRequest,
) -> HttpResponse {
    let target = match resolve_target(&state, &model_id).await {
        Ok(t) => t,
        Err(e) => return e.error_response(),
    };

    info!(model = %model_id, "starting chat completion stream");

    let base_url = target.base_url().to_string();
    let proxy = state.proxy.clone();
    let state_for_accounting = state.clone();
    let body_stream = stream! {
        let start = Instant::now();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let forward = tokio::spawn(async move {
            proxy.chat_stream(&base_url, &model_id, body, move |token| {
                let _ = tx.send(token);
            }).await
        });

        while let Some(token) = rx.recv().await {
            let frame = serde_json::json!({ "choices": [{"delta": {"content": token}}] });
            yield Ok::<_, actix_web::Error>(web::Bytes::from(format!("data: {frame}\n\n")));
        }

        let outcome = forward.await;
        let success = matches!(outcome, Ok(Ok(())));
        target.record_outcome(&state_for_accounting, start.elapsed(), success);

        if let Ok(Err(e)) = outcome {
            let frame = serde_json::json!({ "error": e.to_string() });
            yield Ok(web::Bytes::from(format!("data: {frame}\n\n")));
        }

        yield Ok(web::Bytes::from_static(b"data: [DONE]\n\n"));
    };

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(body_stream)
}
