//! Admin HTTP API

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use gatemq_core::{Broker, Connection, Destination, SendOutcome};
use gatemq_types::{
    DestinationConfig, DestinationKey, DestinationKind, DestinationRef, DestinationStats, Error,
    Message, SendOptions,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

// ==================== App State ====================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    broker: Broker,
    /// Server-owned connection carrying API publishes
    publisher: Connection,
}

impl AppState {
    pub fn new(broker: Broker, publisher: Connection) -> Self {
        Self { broker, publisher }
    }
}

// ==================== Request/Response Types ====================

/// Create destination request
#[derive(Debug, Deserialize, ToSchema)]
struct CreateDestinationRequest {
    /// Destination reference, e.g. `queue://orders` or `topic://news`
    reference: String,
    /// Optional destination configuration
    #[serde(default)]
    config: Option<DestinationConfig>,
}

/// Destination details
#[derive(Debug, Serialize, ToSchema)]
struct DestinationInfo {
    /// Canonical reference
    reference: String,
    kind: DestinationKind,
    name: String,
    /// Deleted when its owning connection closes
    temporary: bool,
    config: DestinationConfig,
    stats: DestinationStats,
}

impl From<&Destination> for DestinationInfo {
    fn from(destination: &Destination) -> Self {
        let key = destination.key();
        Self {
            reference: key.to_string(),
            kind: key.kind,
            name: key.name.clone(),
            temporary: destination.owner().is_some(),
            config: destination.config().clone(),
            stats: destination.stats(),
        }
    }
}

/// Publish message request
#[derive(Debug, Deserialize, ToSchema)]
struct PublishRequest {
    /// Text body
    #[serde(default)]
    body: Option<String>,
    /// JSON body, used instead of `body` when present
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    json: Option<serde_json::Value>,
    /// Custom message attributes
    #[serde(default)]
    attributes: Option<HashMap<String, String>>,
    /// Store the message through the persistence backend
    #[serde(default)]
    persistent: bool,
    /// Time to live in seconds
    #[serde(default)]
    ttl_secs: Option<u64>,
}

/// Publish response
#[derive(Debug, Serialize, ToSchema)]
struct PublishResponse {
    /// ID of the published message
    message_id: String,
    /// Whether the publish had to wait for flow control
    blocked: bool,
}

/// API Error response
#[derive(Debug, Serialize, ToSchema)]
struct ApiErrorBody {
    /// Error message
    error: String,
    /// Error code
    code: String,
}

/// Purge response
#[derive(Debug, Serialize, ToSchema)]
struct PurgeResponse {
    /// Number of messages purged
    purged: u64,
}

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    /// Health status
    status: String,
    /// Server version
    version: String,
    /// Open client connections
    connections: usize,
    /// Bytes resident across all destinations
    total_usage_bytes: u64,
}

// ==================== Error Handling ====================

/// Wrapper for GateMQ errors to implement IntoResponse
pub struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = match &self.0 {
            Error::DestinationNotFound(_) => (StatusCode::NOT_FOUND, "DESTINATION_NOT_FOUND"),
            Error::DestinationAlreadyExists(_) => {
                (StatusCode::CONFLICT, "DESTINATION_ALREADY_EXISTS")
            }
            Error::ConnectionNotFound(_) => (StatusCode::NOT_FOUND, "CONNECTION_NOT_FOUND"),
            Error::ConsumerNotFound(_) => (StatusCode::NOT_FOUND, "CONSUMER_NOT_FOUND"),
            Error::MessageNotFound(_) => (StatusCode::NOT_FOUND, "MESSAGE_NOT_FOUND"),
            Error::ResourceExhausted { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "RESOURCE_EXHAUSTED")
            }
            Error::ConnectionClosed(_) | Error::BrokerStopped => {
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
            }
            Error::InvalidDestination(_) => (StatusCode::BAD_REQUEST, "INVALID_DESTINATION"),
            Error::InvalidMessage(_) => (StatusCode::BAD_REQUEST, "INVALID_MESSAGE"),
            Error::QuotaMisconfigured(_) | Error::Config(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_CONFIG")
            }
            Error::Storage(_) | Error::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        let body = Json(ApiErrorBody {
            error: self.0.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

fn destination_ref(kind: &str, name: &str) -> Result<DestinationRef, Error> {
    format!("{kind}://{name}").parse()
}

fn find(state: &AppState, key: &DestinationKey) -> Result<Arc<Destination>, Error> {
    state
        .broker
        .get_destination(key)
        .ok_or_else(|| Error::DestinationNotFound(key.to_string()))
}

// ==================== OpenAPI Documentation ====================

#[derive(OpenApi)]
#[openapi(
    info(
        title = "GateMQ Admin API",
        version = "0.1.0",
        description = "GateMQ - message broker administration",
        license(name = "MIT OR Apache-2.0")
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development server")
    ),
    paths(
        health,
        list_destinations,
        create_destination,
        get_destination,
        delete_destination,
        get_destination_stats,
        purge_destination,
        publish_message,
    ),
    components(
        schemas(
            HealthResponse,
            DestinationKind,
            DestinationConfig,
            DestinationStats,
            DestinationInfo,
            CreateDestinationRequest,
            PublishRequest,
            PublishResponse,
            ApiErrorBody,
            PurgeResponse,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "destinations", description = "Queue and topic management"),
        (name = "messages", description = "Message operations")
    )
)]
struct ApiDoc;

// ==================== Handlers ====================

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    )
)]
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.broker.is_running() {
        "healthy"
    } else {
        "stopping"
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: state.broker.connection_count(),
        total_usage_bytes: state.broker.total_usage(),
    })
}

/// List all destinations
#[utoipa::path(
    get,
    path = "/api/v1/destinations",
    tag = "destinations",
    responses(
        (status = 200, description = "All queues and topics", body = Vec<DestinationInfo>)
    )
)]
async fn list_destinations(State(state): State<AppState>) -> Json<Vec<DestinationInfo>> {
    let destinations = state
        .broker
        .list_destinations()
        .iter()
        .map(|d| DestinationInfo::from(d.as_ref()))
        .collect();
    Json(destinations)
}

/// Create a destination
#[utoipa::path(
    post,
    path = "/api/v1/destinations",
    tag = "destinations",
    request_body = CreateDestinationRequest,
    responses(
        (status = 201, description = "Destination created", body = DestinationInfo),
        (status = 400, description = "Invalid reference or configuration", body = ApiErrorBody),
        (status = 409, description = "Destination already exists", body = ApiErrorBody)
    )
)]
async fn create_destination(
    State(state): State<AppState>,
    Json(req): Json<CreateDestinationRequest>,
) -> Result<(StatusCode, Json<DestinationInfo>), AppError> {
    let reference: DestinationRef = req.reference.parse()?;
    let destination = state.broker.create_destination(&reference, req.config)?;
    info!(destination = %reference, "Destination created through API");
    Ok((
        StatusCode::CREATED,
        Json(DestinationInfo::from(destination.as_ref())),
    ))
}

/// Get destination details
#[utoipa::path(
    get,
    path = "/api/v1/destinations/{kind}/{name}",
    tag = "destinations",
    params(
        ("kind" = String, Path, description = "`queue` or `topic`"),
        ("name" = String, Path, description = "Destination name")
    ),
    responses(
        (status = 200, description = "Destination details", body = DestinationInfo),
        (status = 404, description = "Destination not found", body = ApiErrorBody)
    )
)]
async fn get_destination(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Json<DestinationInfo>, AppError> {
    let reference = destination_ref(&kind, &name)?;
    let destination = find(&state, reference.key())?;
    Ok(Json(DestinationInfo::from(destination.as_ref())))
}

/// Delete a destination
#[utoipa::path(
    delete,
    path = "/api/v1/destinations/{kind}/{name}",
    tag = "destinations",
    params(
        ("kind" = String, Path, description = "`queue` or `topic`"),
        ("name" = String, Path, description = "Destination name")
    ),
    responses(
        (status = 204, description = "Destination deleted"),
        (status = 404, description = "Destination not found", body = ApiErrorBody)
    )
)]
async fn delete_destination(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let reference = destination_ref(&kind, &name)?;
    state.broker.delete_destination(reference.key())?;
    Ok(StatusCode::NO_CONTENT)
}

/// Get destination statistics
#[utoipa::path(
    get,
    path = "/api/v1/destinations/{kind}/{name}/stats",
    tag = "destinations",
    params(
        ("kind" = String, Path, description = "`queue` or `topic`"),
        ("name" = String, Path, description = "Destination name")
    ),
    responses(
        (status = 200, description = "Destination statistics", body = DestinationStats),
        (status = 404, description = "Destination not found", body = ApiErrorBody)
    )
)]
async fn get_destination_stats(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Json<DestinationStats>, AppError> {
    let reference = destination_ref(&kind, &name)?;
    Ok(Json(state.broker.stats(reference.key())?))
}

/// Drop every undelivered message
#[utoipa::path(
    post,
    path = "/api/v1/destinations/{kind}/{name}/purge",
    tag = "destinations",
    params(
        ("kind" = String, Path, description = "`queue` or `topic`"),
        ("name" = String, Path, description = "Destination name")
    ),
    responses(
        (status = 200, description = "Destination purged", body = PurgeResponse),
        (status = 404, description = "Destination not found", body = ApiErrorBody)
    )
)]
async fn purge_destination(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Json<PurgeResponse>, AppError> {
    let reference = destination_ref(&kind, &name)?;
    let purged = state.broker.purge(reference.key())?;
    Ok(Json(PurgeResponse { purged }))
}

/// Publish a message
#[utoipa::path(
    post,
    path = "/api/v1/destinations/{kind}/{name}/messages",
    tag = "messages",
    params(
        ("kind" = String, Path, description = "`queue` or `topic`"),
        ("name" = String, Path, description = "Destination name")
    ),
    request_body = PublishRequest,
    responses(
        (status = 201, description = "Message accepted", body = PublishResponse),
        (status = 400, description = "Invalid message", body = ApiErrorBody),
        (status = 503, description = "Destination over quota", body = ApiErrorBody)
    )
)]
async fn publish_message(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
    Json(req): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishResponse>), AppError> {
    let reference = destination_ref(&kind, &name)?;

    let mut message = match (req.json, req.body) {
        (Some(json), _) => {
            Message::json(&json).map_err(|e| Error::InvalidMessage(e.to_string()))?
        }
        (None, Some(body)) => Message::new(body),
        (None, None) => {
            return Err(Error::InvalidMessage("either body or json is required".to_string()).into())
        }
    };
    for (k, v) in req.attributes.unwrap_or_default() {
        message = message.with_attribute(k, v);
    }
    if let Some(ttl) = req.ttl_secs {
        let ttl = i64::try_from(ttl).map_err(|_| Error::InvalidMessage("ttl too large".into()))?;
        message = message.with_ttl(chrono::Duration::seconds(ttl));
    }
    let message_id = message.id.to_string();

    let options = if req.persistent {
        SendOptions::persistent()
    } else {
        SendOptions::default()
    };
    let outcome = state
        .publisher
        .send_with(&reference, message, options)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(PublishResponse {
            message_id,
            blocked: outcome == SendOutcome::BlockedThenAccepted,
        }),
    ))
}

// ==================== Router ====================

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Health
        .route("/health", get(health))
        // Destinations
        .route(
            "/api/v1/destinations",
            get(list_destinations).post(create_destination),
        )
        .route(
            "/api/v1/destinations/:kind/:name",
            get(get_destination).delete(delete_destination),
        )
        .route(
            "/api/v1/destinations/:kind/:name/stats",
            get(get_destination_stats),
        )
        .route(
            "/api/v1/destinations/:kind/:name/purge",
            post(purge_destination),
        )
        // Messages
        .route(
            "/api/v1/destinations/:kind/:name/messages",
            post(publish_message),
        )
        // Middleware
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
