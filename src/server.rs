use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::api::ConversationApi;
use crate::chat::{AppendRequest, ConversationSummary, Message};
use crate::entity::{AdminKey, SessionId};
use crate::error::SyncError;
use crate::transport::LocalTransport;

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

// -----------------------------------------------------------------------------
// Wire Types
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostMessageBody {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Optional body of the mark-read route. Without it the mark is unconditional.
#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadBody {
    pub seen: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
            SyncError::AuthExpired => StatusCode::UNAUTHORIZED,
            SyncError::Rejected(_) => StatusCode::BAD_REQUEST,
            SyncError::Network(_) | SyncError::Storage(_) => {
                error!("Request failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

// -----------------------------------------------------------------------------
// Router
// -----------------------------------------------------------------------------

pub struct ChatServer {
    api: Arc<LocalTransport>,
}

impl ChatServer {
    pub fn new(api: LocalTransport) -> Self {
        Self { api: Arc::new(api) }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(health_handler))
            .route(
                "/api/chat/:session_id",
                get(get_conversation_handler).post(post_message_handler),
            )
            .route("/api/admin/conversations", get(list_handler))
            .route(
                "/api/admin/conversations/:session_id",
                axum::routing::delete(delete_handler),
            )
            .route(
                "/api/admin/conversations/:session_id/messages",
                post(reply_handler),
            )
            .route("/api/admin/conversations/:session_id/read", post(mark_read_handler))
            .with_state(self.api.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }
}

type ApiState = State<Arc<LocalTransport>>;

fn session_from_path(raw: &str) -> Result<SessionId, SyncError> {
    SessionId::parse(raw).ok_or_else(|| SyncError::rejected("invalid session id"))
}

fn admin_key(headers: &HeaderMap) -> Result<AdminKey, SyncError> {
    headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(AdminKey::new)
        .ok_or(SyncError::AuthExpired)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "alive".to_string(),
        timestamp: Utc::now(),
    })
}

async fn get_conversation_handler(
    State(api): ApiState,
    Path(session_id): Path<String>,
) -> Result<Json<MessagesResponse>, SyncError> {
    let session_id = session_from_path(&session_id)?;
    let messages = api.get_conversation(&session_id).await?;
    Ok(Json(MessagesResponse { messages }))
}

async fn post_message_handler(
    State(api): ApiState,
    Path(session_id): Path<String>,
    Json(body): Json<PostMessageBody>,
) -> Result<Json<Message>, SyncError> {
    let session_id = session_from_path(&session_id)?;
    let req = AppendRequest::user(session_id, body.text).with_display_name(body.display_name);
    Ok(Json(api.append_message(req).await?))
}

async fn list_handler(
    State(api): ApiState,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, SyncError> {
    let key = admin_key(&headers)?;
    Ok(Json(api.list_conversations(&key).await?))
}

async fn reply_handler(
    State(api): ApiState,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PostMessageBody>,
) -> Result<Json<Message>, SyncError> {
    let key = admin_key(&headers)?;
    let session_id = session_from_path(&session_id)?;
    let message = api
        .append_message(AppendRequest::admin(session_id.clone(), body.text, key))
        .await?;
    info!("Admin replied in {}", session_id);
    Ok(Json(message))
}

async fn mark_read_handler(
    State(api): ApiState,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<MarkReadBody>>,
) -> Result<Json<StatusResponse>, SyncError> {
    let key = admin_key(&headers)?;
    let session_id = session_from_path(&session_id)?;
    let seen = body.map_or_else(Utc::now, |Json(body)| body.seen);
    api.mark_read(&session_id, seen, &key).await?;
    Ok(Json(StatusResponse {
        status: "ok".to_string(),
    }))
}

async fn delete_handler(
    State(api): ApiState,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, SyncError> {
    let key = admin_key(&headers)?;
    let session_id = session_from_path(&session_id)?;
    api.delete_conversation(&session_id, &key).await?;
    info!("Deleted conversation {}", session_id);
    Ok(Json(StatusResponse {
        status: "deleted".to_string(),
    }))
}
