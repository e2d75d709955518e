use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use server_api::{ApiContext, LoggingNotifier, PresenceRegistry};
use shared::{
    domain::MessageStatus,
    error::{ApiError, ErrorCode},
    protocol::{
        ChatListResponse, ClearChatResponse, MessagePayload, PairMessagesResponse,
        StatusUpdateResponse, SyncResponse,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod app_state;
mod auth;
mod config;
mod ws;

use app_state::AppState;
use auth::AuthenticatedUser;
use config::{load_settings, prepare_database_url};
use ws::{ws_handler, ConnectionTable};

const MAX_BODY_BYTES: usize = 64 * 1024;

// Field names below are part of the client contract. `/message` alone
// spells the timestamp `timeStamp`; the other routes use `timestamp`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    sender_phone_number: Option<String>,
    receiver_phone_number: Option<String>,
    content: Option<String>,
    time_stamp: Option<DateTime<Utc>>,
    #[serde(default)]
    is_encrypted: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdateRequest {
    sender_phone_number: Option<String>,
    receiver_phone_number: Option<String>,
    previous_status: Option<MessageStatus>,
    current_status: Option<MessageStatus>,
    // Optional upper bound on created_at; absent means unbounded.
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairRequest {
    sender_phone_number: Option<String>,
    receiver_phone_number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatListRequest {
    user_phone_number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearChatRequest {
    sender_phone_number: Option<String>,
    receiver_phone_number: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    user_phone_number: Option<String>,
    // Absent on a first-ever sync; the clear horizon still applies.
    #[serde(default)]
    last_synced_at: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let connections = Arc::new(ConnectionTable::new());
    let api = ApiContext {
        storage,
        presence: PresenceRegistry::new(),
        live: connections.clone(),
        notifier: Arc::new(LoggingNotifier),
    };
    let state = AppState {
        api,
        connections,
        auth_secret: settings.auth_secret,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/message", post(http_send_message))
        .route("/messages/status", put(http_update_statuses))
        .route("/users/messages", post(http_pair_messages))
        .route("/chats/user", post(http_chat_list))
        .route("/chat/delete", post(http_clear_chat))
        .route("/sync", post(http_sync))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    _auth: AuthenticatedUser,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessagePayload>, (StatusCode, Json<ApiError>)> {
    let sender = require(req.sender_phone_number, "senderPhoneNumber")?;
    let receiver = require(req.receiver_phone_number, "receiverPhoneNumber")?;
    let content = require(req.content, "content")?;
    let timestamp = require(req.time_stamp, "timeStamp")?;

    let payload = server_api::send_message(
        &state.api,
        &sender,
        &receiver,
        &content,
        req.is_encrypted.unwrap_or(false),
        timestamp,
    )
    .await
    .map_err(reject)?;
    Ok(Json(payload))
}

async fn http_update_statuses(
    State(state): State<Arc<AppState>>,
    _auth: AuthenticatedUser,
    Json(req): Json<StatusUpdateRequest>,
) -> Result<Response, (StatusCode, Json<ApiError>)> {
    let sender = require(req.sender_phone_number, "senderPhoneNumber")?;
    let receiver = require(req.receiver_phone_number, "receiverPhoneNumber")?;
    let previous = require(req.previous_status, "previousStatus")?;
    let current = require(req.current_status, "currentStatus")?;

    let count = server_api::update_statuses(
        &state.api,
        &sender,
        &receiver,
        previous,
        current,
        req.timestamp,
    )
    .await
    .map_err(reject)?;

    if count == 0 {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok((StatusCode::OK, Json(StatusUpdateResponse { count })).into_response())
}

async fn http_pair_messages(
    State(state): State<Arc<AppState>>,
    _auth: AuthenticatedUser,
    Json(req): Json<PairRequest>,
) -> Result<Json<PairMessagesResponse>, (StatusCode, Json<ApiError>)> {
    let requester = require(req.sender_phone_number, "senderPhoneNumber")?;
    let peer = require(req.receiver_phone_number, "receiverPhoneNumber")?;

    let chats = server_api::pair_messages(&state.api, &requester, &peer)
        .await
        .map_err(reject)?;
    Ok(Json(PairMessagesResponse { chats }))
}

async fn http_chat_list(
    State(state): State<Arc<AppState>>,
    _auth: AuthenticatedUser,
    Json(req): Json<ChatListRequest>,
) -> Result<Json<ChatListResponse>, (StatusCode, Json<ApiError>)> {
    let user = require(req.user_phone_number, "userPhoneNumber")?;

    let chats = server_api::chat_list(&state.api, &user)
        .await
        .map_err(reject)?;
    Ok(Json(ChatListResponse { chats }))
}

async fn http_clear_chat(
    State(state): State<Arc<AppState>>,
    _auth: AuthenticatedUser,
    Json(req): Json<ClearChatRequest>,
) -> Result<Response, (StatusCode, Json<ApiError>)> {
    let owner = require(req.sender_phone_number, "senderPhoneNumber")?;
    let peer = require(req.receiver_phone_number, "receiverPhoneNumber")?;
    let timestamp = require(req.timestamp, "timestamp")?;

    let cleared = server_api::clear_chat(&state.api, &owner, &peer, timestamp)
        .await
        .map_err(reject)?;

    match cleared {
        Some(count) => Ok((
            StatusCode::OK,
            Json(ClearChatResponse {
                count,
                message: "conversation cleared".to_string(),
            }),
        )
            .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn http_sync(
    State(state): State<Arc<AppState>>,
    _auth: AuthenticatedUser,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, (StatusCode, Json<ApiError>)> {
    let user = require(req.user_phone_number, "userPhoneNumber")?;

    let data = server_api::sync_messages(&state.api, &user, req.last_synced_at)
        .await
        .map_err(reject)?;
    Ok(Json(SyncResponse { data }))
}

/// Missing contract fields are a 400, not the extractor's default 422.
fn require<T>(field: Option<T>, name: &str) -> Result<T, (StatusCode, Json<ApiError>)> {
    field.ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ApiError::validation(format!(
                "missing required field {name}"
            ))),
        )
    })
}

fn reject(error: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match error.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
