//! REST API server for the broker
//!
//! Provides HTTP endpoints for:
//! - Agent registration and heartbeats
//! - Capability and service discovery
//! - Envelope routing to agent callbacks
//! - Liveness monitoring

use crate::broker::{AgentCard, AgentLiveness, Broker, DiscoveredAgent, RouteOutcome};
use crate::error::{FabricError, Result};
use crate::protocol::AgentInfo;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::{IntoParams, OpenApi, ToSchema};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// The broker instance
    pub broker: Arc<Broker>,
}

/// Response from a successful registration
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct RegisterResponse {
    /// The effective agent id
    pub agent_id: String,
}

/// A signed envelope token submitted for routing or liveness
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct TokenRequest {
    /// Compact three-segment signed token whose `env` claim is the envelope
    pub jwt: String,
}

/// Generic status response
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct StatusResponse {
    #[schema(example = "sent")]
    pub status: String,
}

/// Liveness probe response
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct PingResponse {
    pub pong: bool,
}

/// Error response
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}

/// Discovery query filters; both are optional and conjunctive
#[derive(Debug, Deserialize, IntoParams)]
pub struct DiscoverParams {
    pub role: Option<String>,
    pub tool: Option<String>,
}

/// Service lookup parameter
#[derive(Debug, Deserialize, IntoParams)]
pub struct ServicesParams {
    pub service: String,
}

/// Custom error type for API responses
#[derive(Debug)]
pub struct ApiError(FabricError);

impl From<FabricError> for ApiError {
    fn from(err: FabricError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self.0 {
            // Never leak why verification failed
            FabricError::Signature(_) => {
                (StatusCode::BAD_REQUEST, "verification failed".to_string())
            }
            FabricError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            FabricError::UnknownAgent(id) => {
                (StatusCode::NOT_FOUND, format!("unknown agent: {}", id))
            }
            FabricError::Callback(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            FabricError::NoCandidates(service) => (
                StatusCode::BAD_GATEWAY,
                format!("no online agents for service '{}'", service),
            ),
            FabricError::Tool(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            FabricError::NotRegistered => (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string()),
            FabricError::ReplyTimeout => (StatusCode::GATEWAY_TIMEOUT, self.0.to_string()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });
        (status, body).into_response()
    }
}

/// Convert Result<T> to Result<T, ApiError>
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Pull the `jwt` field out of a token submission
pub fn extract_token(body: &Value) -> Result<&str> {
    body.get("jwt")
        .and_then(Value::as_str)
        .ok_or_else(|| FabricError::Validation("request must carry a 'jwt' field".to_string()))
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        register_handler,
        send_handler,
        heartbeat_handler,
        discover_handler,
        services_handler,
        cards_handler,
        card_handler,
        status_handler,
        ping_handler,
    ),
    components(
        schemas(
            AgentInfo,
            RegisterResponse,
            TokenRequest,
            StatusResponse,
            PingResponse,
            ErrorResponse,
            DiscoveredAgent,
            AgentCard,
            AgentLiveness,
        )
    ),
    tags(
        (name = "registry", description = "Agent registration and liveness"),
        (name = "discovery", description = "Capability and service discovery"),
        (name = "routing", description = "Envelope routing")
    ),
    info(
        title = "A2A Fabric Broker API",
        version = "0.1.0",
        description = "Registry, discovery, liveness, and store-and-forward routing for the agent-to-agent message fabric"
    )
)]
struct ApiDoc;

/// Create the broker API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Registry and liveness
        .route("/agent/register", post(register_handler))
        .route("/agent/heartbeat", post(heartbeat_handler))
        // Routing
        .route("/agent/send", post(send_handler))
        // Discovery
        .route("/agent/discover", get(discover_handler))
        .route("/agent/services", get(services_handler))
        .route("/agent/cards", get(cards_handler))
        .route("/agent/card/{id}", get(card_handler))
        .route("/agent/status", get(status_handler))
        // Diagnostics
        .route("/ping", get(ping_handler))
        // OpenAPI spec endpoint
        .route("/api-docs/openapi.json", get(openapi_spec_handler))
        .with_state(state)
        // Add middleware
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// OpenAPI specification endpoint
async fn openapi_spec_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Register an agent
#[utoipa::path(
    post,
    path = "/agent/register",
    tag = "registry",
    request_body = AgentInfo,
    responses(
        (status = 200, description = "Agent registered", body = RegisterResponse),
        (status = 400, description = "Malformed registration", body = ErrorResponse)
    )
)]
async fn register_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<RegisterResponse>> {
    let info: AgentInfo = serde_json::from_value(body)
        .map_err(|e| FabricError::Validation(format!("malformed registration: {}", e)))?;
    info!("Registering agent: {}", info.name);
    let agent_id = state.broker.register(info).await?;
    Ok(Json(RegisterResponse { agent_id }))
}

/// Route a signed envelope to its recipient
#[utoipa::path(
    post,
    path = "/agent/send",
    tag = "routing",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "Envelope forwarded", body = StatusResponse),
        (status = 400, description = "Bad token", body = ErrorResponse),
        (status = 404, description = "Unknown recipient", body = ErrorResponse),
        (status = 502, description = "Recipient callback failed", body = ErrorResponse)
    )
)]
async fn send_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<StatusResponse>> {
    let token = extract_token(&body)?;
    let outcome = state.broker.route(token).await?;
    let status = match outcome {
        RouteOutcome::Sent => "sent",
        RouteOutcome::HeartbeatAbsorbed => "ok",
    };
    Ok(Json(StatusResponse {
        status: status.to_string(),
    }))
}

/// Record an agent heartbeat
#[utoipa::path(
    post,
    path = "/agent/heartbeat",
    tag = "registry",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "Heartbeat recorded", body = StatusResponse),
        (status = 400, description = "Bad token or wrong envelope type", body = ErrorResponse),
        (status = 404, description = "Unknown sender", body = ErrorResponse)
    )
)]
async fn heartbeat_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<StatusResponse>> {
    let token = extract_token(&body)?;
    let agent_id = state.broker.heartbeat(token).await?;
    info!("Heartbeat from {}", agent_id);
    Ok(Json(StatusResponse {
        status: "ok".to_string(),
    }))
}

/// Discover agents by capability
#[utoipa::path(
    get,
    path = "/agent/discover",
    tag = "discovery",
    params(DiscoverParams),
    responses(
        (status = 200, description = "Matching agents keyed by id")
    )
)]
async fn discover_handler(
    State(state): State<AppState>,
    Query(params): Query<DiscoverParams>,
) -> Json<HashMap<String, DiscoveredAgent>> {
    Json(
        state
            .broker
            .discover(params.role.as_deref(), params.tool.as_deref())
            .await,
    )
}

/// Find agents implementing a service
#[utoipa::path(
    get,
    path = "/agent/services",
    tag = "discovery",
    params(ServicesParams),
    responses(
        (status = 200, description = "Matching agents keyed by id")
    )
)]
async fn services_handler(
    State(state): State<AppState>,
    Query(params): Query<ServicesParams>,
) -> Json<HashMap<String, DiscoveredAgent>> {
    Json(state.broker.services(&params.service).await)
}

/// All agent cards
#[utoipa::path(
    get,
    path = "/agent/cards",
    tag = "discovery",
    responses(
        (status = 200, description = "Full cards keyed by id")
    )
)]
async fn cards_handler(State(state): State<AppState>) -> Json<HashMap<String, AgentCard>> {
    Json(state.broker.cards().await)
}

/// One agent card
#[utoipa::path(
    get,
    path = "/agent/card/{id}",
    tag = "discovery",
    params(
        ("id" = String, Path, description = "Agent id")
    ),
    responses(
        (status = 200, description = "The agent card", body = AgentCard),
        (status = 404, description = "Unknown agent", body = ErrorResponse)
    )
)]
async fn card_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentCard>> {
    Ok(Json(state.broker.card(&id).await?))
}

/// Liveness summary for all agents
#[utoipa::path(
    get,
    path = "/agent/status",
    tag = "registry",
    responses(
        (status = 200, description = "Liveness keyed by id")
    )
)]
async fn status_handler(State(state): State<AppState>) -> Json<HashMap<String, AgentLiveness>> {
    Json(state.broker.status().await)
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/ping",
    tag = "registry",
    responses(
        (status = 200, description = "Service is up", body = PingResponse)
    )
)]
async fn ping_handler() -> Json<PingResponse> {
    Json(PingResponse { pong: true })
}

/// Start the broker API server
pub async fn start_server(state: AppState, host: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    info!("Starting broker API server on {}", addr);

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| FabricError::Config(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| FabricError::Config(format!("Server error: {}", e)))?;

    Ok(())
}
