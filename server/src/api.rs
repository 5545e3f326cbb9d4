//! REST surface for threads, history and key documents
//!
//! Every route takes `Authorization: Bearer <credential>`; the credential
//! names the caller. Threads are only visible to their members; for anyone
//! else they do not exist.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    Json,
};
use chrono::Utc;
use parley_shared::{AccountId, MessageContent, MessageEnvelope, Thread};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::ApiError;
use crate::websocket::ServerState;

/// The authenticated account making a request
pub struct Caller(pub AccountId);

#[async_trait]
impl FromRequestParts<Arc<ServerState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ServerState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;
        state
            .auth
            .authenticate(token)
            .map(Caller)
            .ok_or(ApiError::Unauthorized)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateThread {
    pub peer_id: AccountId,
}

/// Body of `POST /threads/:id/messages`
///
/// The id is chosen by the sender so the live copy and the stored copy
/// match; retries with the same id are idempotent.
#[derive(Debug, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub receiver_id: AccountId,
    pub content: MessageContent,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublicKeyDocument {
    pub public_key: String,
}

async fn member_thread(
    state: &ServerState,
    caller: &AccountId,
    thread_id: Uuid,
) -> Result<Thread, ApiError> {
    match state.db.get_thread(thread_id).await? {
        Some(thread) if thread.has_member(caller) => Ok(thread),
        _ => Err(ApiError::NotFound(format!("thread {}", thread_id))),
    }
}

pub async fn create_thread(
    Caller(caller): Caller,
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateThread>,
) -> Result<Json<Thread>, ApiError> {
    let thread = state.db.find_or_create_thread(&caller, &body.peer_id).await?;
    Ok(Json(thread))
}

pub async fn list_threads(
    Caller(caller): Caller,
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<Thread>>, ApiError> {
    Ok(Json(state.db.list_threads_for_account(&caller).await?))
}

pub async fn get_thread(
    Caller(caller): Caller,
    State(state): State<Arc<ServerState>>,
    Path(thread_id): Path<Uuid>,
) -> Result<Json<Thread>, ApiError> {
    Ok(Json(member_thread(&state, &caller, thread_id).await?))
}

pub async fn list_messages(
    Caller(caller): Caller,
    State(state): State<Arc<ServerState>>,
    Path(thread_id): Path<Uuid>,
) -> Result<Json<Vec<MessageEnvelope>>, ApiError> {
    member_thread(&state, &caller, thread_id).await?;
    Ok(Json(state.db.list_messages(thread_id).await?))
}

pub async fn post_message(
    Caller(caller): Caller,
    State(state): State<Arc<ServerState>>,
    Path(thread_id): Path<Uuid>,
    Json(body): Json<NewMessage>,
) -> Result<(StatusCode, Json<MessageEnvelope>), ApiError> {
    member_thread(&state, &caller, thread_id).await?;

    let envelope = MessageEnvelope {
        id: body.id.unwrap_or_else(Uuid::new_v4),
        thread_id,
        sender_id: caller,
        receiver_id: body.receiver_id,
        content: body.content,
        created_at: Utc::now(),
    };
    let stored = state.db.append_message(envelope).await?;
    debug!(
        "Stored message {} in thread {} ({})",
        stored.id,
        thread_id,
        if stored.content.is_encrypted() { "encrypted" } else { "plaintext" }
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn put_public_key(
    Caller(caller): Caller,
    State(state): State<Arc<ServerState>>,
    Json(body): Json<PublicKeyDocument>,
) -> Result<StatusCode, ApiError> {
    state
        .db
        .publish_public_key(&caller, &body.public_key)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_public_key(
    Caller(_): Caller,
    State(state): State<Arc<ServerState>>,
    Path(account): Path<AccountId>,
) -> Result<Json<PublicKeyDocument>, ApiError> {
    let public_key = state
        .db
        .fetch_public_key(&account)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("public key for {}", account)))?;
    Ok(Json(PublicKeyDocument { public_key }))
}
