//! OpenAI-compatible text completion endpoints (supports fill-in-middle via `suffix`).

use std::time::Instant;

use actix_web::{post, web, HttpResponse, Responder, ResponseError};
use async_stream::stream;
use tracing::instrument;

use crate::api::chat::{apply_generation_defaults, resolve_target};
use crate::errors::OrchestratorError;
use crate::proxy::{CompletionRequest, CompletionResponse};
use crate::AppState;

#[utoipa::path(
    post,
    path = "/v1/completions",
    request_body = CompletionRequest,
    responses(
        (status = 200, description = "Completion generated successfully", body = CompletionResponse),
        (status = 400, description = "Invalid request or unsupported model"),
        (status = 503, description = "Worker busy or unavailable")
    ),
    tag = "completions"
)]
#[post("/v1/completions")]
#[instrument(skip(state, body), fields(model))]
pub async fn completion(state: web::Data<AppState>, body: web::Json<CompletionRequest>) -> impl Responder {
    let mut body = body.into_inner();
    let Some(model_id) = body.model.clone() else {
        return OrchestratorError::BadRequest("model is required".to_string()).error_response();
    };
    if body.prompt.is_empty() {
        return OrchestratorError::BadRequest("prompt cannot be empty".to_string()).error_response();
    }

    apply_generation_defaults(&state, &mut body.temperature, &mut body.top_p, &mut body.max_tokens);

    tracing::Span::current().record("model", &model_id);

    if body.stream {
        return completion_stream(state, model_id, body).await;
    }

    let target = match resolve_target(&state, &model_id).await {
        Ok(t) => t,
        Err(e) => return e.error_response(),
    };

    let start = Instant::now();
    let result = state.proxy.completion(target.base_url(), &model_id, body).await;
    target.record_outcome(&state, start.elapsed(), result.is_ok());

    match result {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(e) => e.error_response(),
    }
}

async fn completion_stream(
    state: web::Data<AppState>,
    model_id: String,
    body: CompletionRequest,
) -> HttpResponse {
    let target = match resolve_target(&state, &model_id).await {
        Ok(t) => t,
        Err(e) => return e.error_response(),
    };

    let base_url = target.base_url().to_string();
    let proxy = state.proxy.clone();
    let state_for_accounting = state.clone();
    let body_stream = stream! {
        let start = Instant::now();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let forward = tokio::spawn(async move {
            proxy.completion_stream(&base_url, &model_id, body, move |token| {
                let _ = tx.send(token);
            }).await
        });

        while let Some(token) = rx.recv().await {
            let frame = serde_json::json!({ "choices": [{"text": token}] });
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
