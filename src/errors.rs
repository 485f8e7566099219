//! Error types for the LLM orchestrator.

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::Serialize;
use std::fmt;

/// Orchestrator errors, covering both the Model Cache's internal state machine and the
/// request proxy's view of worker failures.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Loading the model would exceed the configured RAM budget.
    CapacityExceeded { model_id: String, required_mb: u64, available_mb: u64 },
    /// The model file does not exist on disk.
    ModelNotFound(String),
    /// The Binary Provider could not locate or fetch a worker binary.
    BinaryUnavailable { message: String, transient: bool },
    /// The worker subprocess failed to launch.
    SpawnFailed(String),
    /// The readiness handshake did not complete within its budget.
    ReadinessTimeout { model_id: String, phase: &'static str },
    /// The worker process exited during the readiness handshake.
    WorkerExited { model_id: String, message: String },
    /// The worker kept returning 503 beyond the retry budget.
    Busy { attempts: u32 },
    /// A multimodal projector is required but was not supplied.
    MissingProjector(String),
    /// The caller's context ended before the operation completed.
    Cancelled,
    /// An internal bookkeeping invariant was violated (port leak, map desync, ...).
    InternalInvariantViolation(String),
    /// A malformed request body or parameter.
    BadRequest(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::CapacityExceeded { model_id, required_mb, available_mb } => write!(
                f,
                "loading {model_id} requires {required_mb} MiB but only {available_mb} MiB is budgeted"
            ),
            OrchestratorError::ModelNotFound(path) => write!(f, "model file not found: {path}"),
            OrchestratorError::BinaryUnavailable { message, .. } => {
                write!(f, "worker binary unavailable: {message}")
            }
            OrchestratorError::SpawnFailed(msg) => write!(f, "failed to spawn worker: {msg}"),
            OrchestratorError::ReadinessTimeout { model_id, phase } => {
                write!(f, "readiness timeout for {model_id} during {phase}")
            }
            OrchestratorError::WorkerExited { model_id, message } => {
                write!(f, "worker for {model_id} exited unexpectedly: {message}")
            }
            OrchestratorError::Busy { attempts } => {
                write!(f, "worker busy after {attempts} retry attempts")
            }
            OrchestratorError::MissingProjector(model_id) => write!(
                f,
                "model {model_id} requires a multimodal projector that was not supplied"
            ),
            OrchestratorError::Cancelled => write!(f, "request cancelled"),
            OrchestratorError::InternalInvariantViolation(msg) => {
                write!(f, "internal invariant violation: {msg}")
            }
            OrchestratorError::BadRequest(msg) => write!(f, "bad request: {msg}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl OrchestratorError {
    fn code(&self) -> &'static str {
        match self {
            OrchestratorError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            OrchestratorError::ModelNotFound(_) => "MODEL_NOT_FOUND",
            OrchestratorError::BinaryUnavailable { .. } => "BINARY_UNAVAILABLE",
            OrchestratorError::SpawnFailed(_) => "SPAWN_FAILED",
            OrchestratorError::ReadinessTimeout { .. } => "READINESS_TIMEOUT",
            OrchestratorError::WorkerExited { .. } => "WORKER_EXITED",
            OrchestratorError::Busy { .. } => "BUSY",
            OrchestratorError::MissingProjector(_) => "MISSING_PROJECTOR",
            OrchestratorError::Cancelled => "CANCELLED",
            OrchestratorError::InternalInvariantViolation(_) => "INTERNAL_INVARIANT_VIOLATION",
            OrchestratorError::BadRequest(_) => "BAD_REQUEST",
        }
    }

    /// Attempts exhausted while waiting on a busy worker; used by the proxy retry ladder.
    pub fn busy(attempts: u32) -> Self {
        OrchestratorError::Busy { attempts }
    }
}

impl ResponseError for OrchestratorError {
    fn status_code(&self) -> StatusCode {
        match self {
            OrchestratorError::CapacityExceeded { .. } => StatusCode::BAD_REQUEST,
            OrchestratorError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::MissingProjector(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::BadRequest(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::BinaryUnavailable { transient: true, .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OrchestratorError::BinaryUnavailable { transient: false, .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            OrchestratorError::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::SpawnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::ReadinessTimeout { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::WorkerExited { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::InternalInvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // actix has no named constant for 499; build it from the raw code.
            OrchestratorError::Cancelled => StatusCode::from_u16(499).unwrap(),
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code());

        if matches!(
            self,
            OrchestratorError::Busy { .. }
                | OrchestratorError::BinaryUnavailable { transient: true, .. }
        ) {
            response.insert_header(("Retry-After", "3"));
        }

        response.json(ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exceeded_status_and_message() {
        let err = OrchestratorError::CapacityExceeded {
            model_id: "llama-3-8b".to_string(),
            required_mb: 5632,
            available_mb: 4096,
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("5632"));
    }

    #[test]
    fn test_busy_has_retry_after() {
        let err = OrchestratorError::busy(15);
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(resp.headers().contains_key("Retry-After"));
    }

    #[test]
    fn test_cancelled_maps_to_499() {
        let err = OrchestratorError::Cancelled;
        assert_eq!(err.status_code().as_u16(), 499);
    }
}
