//! Version 1 of the HTTP API.
//!
//! Handlers are intentionally thin wrappers that validate input, run
//! database work on the blocking thread pool, and return JSON payloads.
//! The chat contract uses camelCase field names because the browser UI
//! consumes it directly.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tokio::task::{spawn_blocking, JoinError};
use tower_http::cors::CorsLayer;

use crate::db::DbPool;
use crate::dispatcher::Dispatcher;
use crate::errors::RouterError;
use crate::logging;
use crate::providers::config;
use crate::store::{ConversationRecord, ConversationStore, MessageRecord};
use crate::stream::StreamEmitter;

const DEFAULT_EVENT_LIMIT: usize = 50;

/// Shared application state injected into each handler.
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub store: Arc<ConversationStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub emitter: StreamEmitter,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/chat", post(chat))
        .route("/api/v1/chat/stream", post(chat_stream))
        .route("/api/v1/conversations", get(list_conversations))
        .route("/api/v1/conversations/:id", get(get_conversation))
        .route("/api/v1/conversations/:id/messages", get(list_messages))
        .route("/api/v1/providers", get(list_providers))
        .route("/api/v1/events", get(list_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error envelope returned on every non-2xx response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<RouterError>() {
            Some(RouterError::ConversationNotFound) => StatusCode::NOT_FOUND,
            Some(RouterError::TurnInFlight) => StatusCode::CONFLICT,
            Some(RouterError::EmptyPrompt) => StatusCode::BAD_REQUEST,
            Some(RouterError::ProviderUnavailable) => StatusCode::BAD_GATEWAY,
            Some(RouterError::DbUnavailable) | Some(RouterError::Unknown) | None => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn join_error(err: JoinError) -> ApiError {
    ApiError::internal(err.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub conversation_id: Option<String>,
    pub prompt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub conversation_id: String,
    pub model_used: String,
    pub reply: String,
}

#[derive(Debug, Serialize)]
pub struct ConversationView {
    #[serde(flatten)]
    pub conversation: ConversationRecord,
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
    pub module: Option<String>,
}

/// Simple health-check endpoint.
async fn ping() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "ts": OffsetDateTime::now_utc().unix_timestamp(),
    }))
}

/// Run one chat turn and return the completed reply.
async fn chat(
    State(state): State<ApiState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let outcome = state
        .dispatcher
        .send(request.conversation_id, request.prompt)
        .await?;
    Ok(Json(ChatResponse {
        conversation_id: outcome.conversation.id,
        model_used: outcome.reply.model_used.unwrap_or_default(),
        reply: outcome.reply.body,
    }))
}

/// Run one chat turn and replay the completed reply incrementally as SSE.
/// Disconnecting cancels the replay only; the message is already persisted.
async fn chat_stream(
    State(state): State<ApiState>,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .dispatcher
        .send(request.conversation_id, request.prompt)
        .await?;

    let done_payload = json!({
        "conversationId": outcome.conversation.id,
        "modelUsed": outcome.reply.model_used.clone().unwrap_or_default(),
    })
    .to_string();

    let increments = state
        .emitter
        .emit(&outcome.reply.body)
        .map(|chunk| Ok::<_, Infallible>(Event::default().data(chunk)));
    let done = futures::stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("done").data(done_payload))
    });

    Ok(Sse::new(increments.chain(done)).keep_alive(KeepAlive::default()))
}

async fn list_conversations(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.clone();
    let summaries = spawn_blocking(move || store.list(query.limit))
        .await
        .map_err(join_error)??;
    Ok(Json(summaries))
}

async fn get_conversation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.clone();
    let view = spawn_blocking(move || {
        let conversation = store.get(&id)?;
        let messages = store.messages(&id, None)?;
        Ok::<_, anyhow::Error>(ConversationView {
            conversation,
            messages,
        })
    })
    .await
    .map_err(join_error)??;
    Ok(Json(view))
}

async fn list_messages(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.clone();
    let messages = spawn_blocking(move || store.messages(&id, query.limit))
        .await
        .map_err(join_error)??;
    Ok(Json(messages))
}

async fn list_providers(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let pool = state.db.clone();
    let providers = spawn_blocking(move || {
        let conn = pool.get()?;
        config::list_providers(&conn)
    })
    .await
    .map_err(join_error)??;
    Ok(Json(providers))
}

/// Recent routing/dispatch events for diagnostics.
async fn list_events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = state.db.clone();
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    let events = spawn_blocking(move || {
        let conn = pool.get().map_err(anyhow::Error::from)?;
        logging::recent_events(&conn, query.module.as_deref(), limit).map_err(anyhow::Error::from)
    })
    .await
    .map_err(join_error)??;
    Ok(Json(events))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_uses_camel_case_keys() {
        let request: ChatRequest =
            serde_json::from_str("{\"conversationId\": \"c-1\", \"prompt\": \"hi\"}").unwrap();
        assert_eq!(request.conversation_id.as_deref(), Some("c-1"));
        assert_eq!(request.prompt, "hi");

        let request: ChatRequest = serde_json::from_str("{\"prompt\": \"hi\"}").unwrap();
        assert!(request.conversation_id.is_none());
    }

    #[test]
    fn chat_response_serialises_camel_case_keys() {
        let response = ChatResponse {
            conversation_id: "c-1".into(),
            model_used: "Claude".into(),
            reply: "hello".into(),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["conversationId"], "c-1");
        assert_eq!(value["modelUsed"], "Claude");
        assert_eq!(value["reply"], "hello");
    }

    #[test]
    fn router_errors_map_to_client_statuses() {
        let not_found: ApiError = anyhow::Error::from(RouterError::ConversationNotFound).into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let busy: ApiError = anyhow::Error::from(RouterError::TurnInFlight).into();
        assert_eq!(busy.status, StatusCode::CONFLICT);

        let empty: ApiError = anyhow::Error::from(RouterError::EmptyPrompt).into();
        assert_eq!(empty.status, StatusCode::BAD_REQUEST);

        let other: ApiError = anyhow::anyhow!("boom").into();
        assert_eq!(other.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
