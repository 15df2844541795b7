//! HTTP surface for an agent: the envelope inbox, the client-facing query
//! entry point, and a liveness probe

use crate::api::{extract_token, ApiResult, PingResponse, StatusResponse};
use crate::error::{FabricError, Result};
use crate::runtime::{AgentRuntime, InboxOutcome};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::ToSchema;

/// Shared agent state
#[derive(Clone)]
pub struct AgentState {
    pub runtime: Arc<AgentRuntime>,
}

/// The answer returned to the client
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct AskResponse {
    /// The structured query the question translated into
    pub sql: String,
    /// The formatted natural-language answer
    #[serde(rename = "respuesta")]
    pub answer: String,
}

/// Create the agent router
pub fn create_router(state: AgentState) -> Router {
    Router::new()
        .route("/inbox", post(inbox_handler))
        .route("/query", post(query_handler))
        .route("/ping", get(ping_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Receive a signed envelope from the broker.
///
/// Queries are accepted with 202 and answered asynchronously; everything
/// else resolves within the handler.
async fn inbox_handler(
    State(state): State<AgentState>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<StatusResponse>)> {
    let token = extract_token(&body)?;
    let envelope = state.runtime.verify_token(token)?;
    let outcome = state.runtime.handle_envelope(envelope).await?;
    let (code, status) = match outcome {
        InboxOutcome::HeartbeatReceived => (StatusCode::OK, "heartbeat received"),
        InboxOutcome::AckProcessed => (StatusCode::OK, "ack received"),
        InboxOutcome::ResponseResolved => (StatusCode::OK, "response received"),
        InboxOutcome::ResponseIgnored => (StatusCode::OK, "ignored"),
        InboxOutcome::QueryAccepted => (StatusCode::ACCEPTED, "accepted"),
    };
    Ok((
        code,
        Json(StatusResponse {
            status: status.to_string(),
        }),
    ))
}

/// Client entry point: answer a natural-language question through the fabric
async fn query_handler(
    State(state): State<AgentState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<AskResponse>> {
    let question = body
        .get("pregunta")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| {
            FabricError::Validation("request must be {'pregunta': '...'}".to_string())
        })?;
    info!("question received: {}", question);
    let reply = state.runtime.ask(question).await?;
    Ok(Json(AskResponse {
        sql: reply.sql,
        answer: reply.answer,
    }))
}

/// Liveness probe
async fn ping_handler() -> Json<PingResponse> {
    Json(PingResponse { pong: true })
}

/// Start the agent HTTP server
pub async fn start_server(state: AgentState, host: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    info!("Starting agent server on {}", addr);

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| FabricError::Config(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| FabricError::Config(format!("Server error: {}", e)))?;

    Ok(())
}
