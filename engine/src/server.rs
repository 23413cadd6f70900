//! HTTP surface
//!
//! A thin axum layer over [`SessionManager`]. Session events are pushed to
//! the client as server-sent events; the response ends after the terminal
//! event. Dropping the response disconnects the session, which aborts it.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use judge_sdk::errors::{JudgeError, JudgeErrorExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::agent::{Budget, MediaRef, SessionManager};
use crate::stream::StreamEvent;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Judge(#[from] JudgeError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Judge(err) => {
                let status = match err {
                    JudgeError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                    JudgeError::StreamAlreadyTaken(_) => StatusCode::CONFLICT,
                    JudgeError::InvalidArguments { .. } => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.code())
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        };

        let body = Json(json!({
            "error": self.to_string(),
            "code": code,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
}

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub claim: String,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub budget: Option<BudgetRequest>,
}

/// Partial budget; missing limits fall back to the configured defaults
#[derive(Debug, Default, Deserialize)]
pub struct BudgetRequest {
    pub max_iterations: Option<u32>,
    pub max_seconds: Option<u64>,
}

impl BudgetRequest {
    fn resolve(&self, defaults: Budget) -> Budget {
        Budget::new(
            self.max_iterations.unwrap_or(defaults.max_iterations),
            self.max_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_wall_clock),
        )
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tools", get(list_tools))
        .route("/api/sessions", post(start_session))
        .route("/api/sessions/:id", get(get_session).delete(abort_session))
        .route("/api/sessions/:id/events", get(stream_events))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "mode": "agent",
        "running_sessions": state.manager.running().await,
        "timestamp": chrono::Utc::now(),
    }))
}

async fn list_tools(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "tools": state.manager.core().tools().descriptors() }))
}

async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let budget = request
        .budget
        .as_ref()
        .map(|b| b.resolve(state.manager.default_budget()));
    if budget.is_some_and(|b| b.max_wall_clock.is_zero()) {
        return Err(ApiError::BadRequest("max_seconds must be positive".to_string()));
    }

    let session_id = state
        .manager
        .start_session(request.claim, request.media, budget)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "session_id": session_id, "status": "running" })),
    ))
}

async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let events = state.manager.stream_events(&id).await?;
    let stream = events
        .into_stream()
        .map(|event| Ok::<_, Infallible>(sse_event(&event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn abort_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let status = state.manager.abort_session(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "session_id": id, "status": status })),
    ))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = state.manager.status(&id).await?;
    let outcome = state.manager.outcome(&id).await?;
    Ok(Json(json!({
        "session_id": id,
        "status": status,
        "outcome": outcome,
    })))
}

fn sse_event(event: &StreamEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .id(event.seq.to_string())
        .event(event.kind.as_str())
        .data(data)
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve_with_shutdown(
    listener: TcpListener,
    manager: SessionManager,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let router = create_router(AppState {
        manager: manager.clone(),
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.await;
            manager.shutdown().await;
        })
        .await?;

    Ok(())
}

/// Bind `addr` and serve until Ctrl+C or SIGTERM
pub async fn serve(manager: SessionManager, addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Judge server listening on http://{}", listener.local_addr()?);
    info!("  POST   /api/sessions              - start a session");
    info!("  GET    /api/sessions/:id/events   - stream session events");
    info!("  DELETE /api/sessions/:id          - abort a session");

    serve_with_shutdown(listener, manager, shutdown_signal()).await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_request_fills_defaults() {
        let defaults = Budget::new(10, Duration::from_secs(600));
        let partial = BudgetRequest {
            max_iterations: Some(3),
            max_seconds: None,
        };
        assert_eq!(partial.resolve(defaults), Budget::new(3, Duration::from_secs(600)));
    }

    #[test]
    fn test_status_codes() {
        let not_found = ApiError::from(JudgeError::SessionNotFound("x".into())).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let taken = ApiError::from(JudgeError::StreamAlreadyTaken("x".into())).into_response();
        assert_eq!(taken.status(), StatusCode::CONFLICT);

        let bad = ApiError::BadRequest("nope".into()).into_response();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_start_request_parses_media() {
        let request: StartSessionRequest = serde_json::from_value(json!({
            "claim": "taken in Paris",
            "media": [{"kind": "image", "uri": "https://cdn/p.jpg"}],
        }))
        .unwrap();
        assert_eq!(request.media.len(), 1);
        assert!(request.budget.is_none());
    }
}
