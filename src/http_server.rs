//! HTTP server implementation using Axum.

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::parse_timeout;
use crate::error::CellError;
use crate::metrics::MetricsSnapshot;
use crate::session::SessionSnapshot;
use crate::state::AppState;
use crate::worker::protocol::ResultKind;

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct EvaluateRequest {
    code: String,
    #[serde(default = "default_true")]
    capture_stdout: bool,
    #[serde(default)]
    want_latex: bool,
    /// Seconds; overrides the configured default for this call.
    #[serde(default)]
    timeout: Option<f64>,
}

#[derive(Serialize)]
struct EvaluateResponse {
    result_type: ResultKind,
    result: Option<String>,
    latex: Option<String>,
    stdout: String,
    elapsed_ms: f64,
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    traceback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    retryable: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// An error rendered as `{"error": {...}}` with a status matching its kind.
pub struct ApiError {
    status: StatusCode,
    detail: ErrorDetail,
}

impl ApiError {
    fn invalid_timeout(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: ErrorDetail {
                kind: "InvalidTimeout".to_string(),
                message,
                traceback: None,
                stdout: None,
                retryable: false,
            },
        }
    }
}

impl From<CellError> for ApiError {
    fn from(err: CellError) -> Self {
        let status = match &err {
            CellError::Parse { .. } => StatusCode::BAD_REQUEST,
            CellError::SecurityViolation { .. } => StatusCode::FORBIDDEN,
            CellError::Evaluation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CellError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CellError::Process(_) => StatusCode::BAD_GATEWAY,
        };
        let kind = err.kind().to_string();
        let retryable = err.is_retryable();
        let message = match &err {
            CellError::Parse { message }
            | CellError::SecurityViolation { message }
            | CellError::Evaluation { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let (traceback, stdout) = match err {
            CellError::Evaluation {
                traceback, stdout, ..
            } => (traceback, Some(stdout)),
            _ => (None, None),
        };
        Self {
            status,
            detail: ErrorDetail {
                kind,
                message,
                traceback,
                stdout,
                retryable,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.detail })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", axum::routing::delete(close_session))
        .route("/sessions/:id/evaluate", post(evaluate))
        .route("/sessions/:id/reset", post(reset_session))
        .route("/sessions/:id/cancel", post(cancel_session))
        .route("/metrics", get(metrics))
        .route("/metrics/reset", post(reset_metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port until ctrl-c.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);
    serve(listener, state, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    })
    .await
}

/// Serve on `listener` until `shutdown` resolves, then stop every session.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let manager = state.manager.clone();
    let reaper = manager.spawn_reaper(manager.settings().cull_interval);
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    reaper.stop().await;
    manager.shutdown().await;
    result
}

async fn health() -> &'static str {
    "OK"
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.manager.snapshot().await)
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn reset_metrics(State(state): State<AppState>) -> Json<MessageResponse> {
    state.metrics.reset();
    Json(MessageResponse {
        message: "Metrics reset",
    })
}

async fn evaluate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, ApiError> {
    let timeout = req
        .timeout
        .map(parse_timeout)
        .transpose()
        .map_err(ApiError::invalid_timeout)?;

    let outcome = match state.manager.get(&id).await {
        Ok(session) => {
            session
                .evaluate(&req.code, req.want_latex, req.capture_stdout, timeout)
                .await
        }
        Err(err) => Err(err),
    };
    match outcome {
        Ok(result) => {
            state.metrics.record_success(result.elapsed_ms);
            info!(session = %id, elapsed_ms = result.elapsed_ms, "cell evaluated");
            Ok(Json(EvaluateResponse {
                result_type: result.kind,
                result: result.result,
                latex: result.alt_format,
                stdout: result.stdout,
                elapsed_ms: result.elapsed_ms,
            }))
        }
        Err(err) => {
            state.metrics.record_error(&err);
            info!(session = %id, kind = err.kind(), "cell failed");
            Err(err.into())
        }
    }
}

async fn reset_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.manager.reset(&id).await?;
    Ok(Json(MessageResponse {
        message: "Session cleared",
    }))
}

async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.manager.cancel(&id).await?;
    Ok(Json(MessageResponse {
        message: "Session restarted",
    }))
}

async fn close_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.manager.close(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn detail(err: CellError) -> (StatusCode, ErrorDetail) {
        let api: ApiError = err.into();
        (api.status, api.detail)
    }

    #[test]
    fn errors_map_to_statuses() {
        let (status, body) = detail(CellError::Parse {
            message: "bad".into(),
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.kind, "SyntaxError");
        assert!(!body.retryable);

        let (status, body) = detail(CellError::Timeout(Duration::from_secs(2)));
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(body.retryable);
        assert_eq!(body.message, "evaluation timed out after 2.00s");

        let (status, _) = detail(CellError::SecurityViolation {
            message: "no".into(),
        });
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = detail(CellError::Evaluation {
            kind: "NameError".into(),
            message: "name 'x' is not defined".into(),
            traceback: Some("Traceback".into()),
            stdout: "partial".into(),
        });
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.kind, "NameError");
        assert_eq!(body.stdout.as_deref(), Some("partial"));

        let (status, _) = detail(CellError::Process("gone".into()));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }
}
