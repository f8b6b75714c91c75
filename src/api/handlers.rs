//! HTTP request handlers

use super::types::{
    ChatRequest, ChatResponse, ConversationListResponse, ConversationResponse, ErrorResponse,
    ModelsResponse, VoiceRequest,
};
use super::AppState;
use crate::db::Turn;
use crate::runtime::{reply_status, OrchestratorError, SubmitRequest};
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Path, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Submissions
        .route("/api/chat", post(send_chat))
        .route("/api/voice", post(send_voice))
        // History
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/:id", get(get_conversation))
        .route(
            "/api/conversations/:id/turns/:seq/audio",
            get(get_turn_audio),
        )
        // Model info
        .route("/api/models", get(list_models))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Identity
// ============================================================

/// User id as asserted by the upstream auth layer
#[derive(Debug, Clone)]
pub struct UserId(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or(AppError::Unauthorized)
    }
}

// ============================================================
// Submissions
// ============================================================

async fn send_chat(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let request =
        SubmitRequest::text(req.conversation_id, user_id, req.text).with_audio(req.want_audio);

    let outcome = state.orchestrator.submit_user_message(request).await?;
    Ok(Json(outcome.into()))
}

async fn send_voice(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    payload: Result<Json<VoiceRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, AppError> {
    // Bad base64 surfaces here as a body rejection
    let Json(req) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let outcome = state
        .orchestrator
        .submit_voice_message(req.conversation_id, &user_id, req.clip)
        .await?;
    Ok(Json(outcome.into()))
}

// ============================================================
// History
// ============================================================

async fn list_conversations(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<ConversationListResponse>, AppError> {
    let conversations = state.orchestrator.list_conversations(&user_id).await?;
    Ok(Json(ConversationListResponse { conversations }))
}

async fn get_conversation(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, AppError> {
    let conversation = state.orchestrator.history(&id, &user_id).await?;
    let status = reply_status(&conversation.turns);

    Ok(Json(ConversationResponse {
        id: conversation.id,
        turns: conversation.turns,
        reply_status: status,
        awaiting_reply: status.is_awaiting_reply(),
        created_at: conversation.created_at,
        updated_at: conversation.updated_at,
    }))
}

async fn get_turn_audio(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path((id, seq)): Path<(String, i64)>,
) -> Result<Response, AppError> {
    let clip = state
        .orchestrator
        .audio_for_turn(&id, &user_id, seq)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No audio for turn {seq}")))?;

    Ok(([(header::CONTENT_TYPE, clip.media_type)], clip.data).into_response())
}

// ============================================================
// Model Info
// ============================================================

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.llm_registry.available_model_info(),
        default: state.llm_registry.default_model_id().to_string(),
        voice_enabled: state.orchestrator.voice_enabled(),
    })
}

// ============================================================
// Version
// ============================================================

async fn get_version() -> &'static str {
    concat!("colloquy ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    ProviderFailure {
        message: String,
        retryable: bool,
        user_turn: Box<Turn>,
    },
    Internal(String),
}

impl From<OrchestratorError> for AppError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::InvalidInput(msg) => AppError::BadRequest(msg),
            e @ OrchestratorError::Transcription(_) => AppError::BadRequest(e.to_string()),
            OrchestratorError::NotFound(id) => {
                AppError::NotFound(format!("Conversation not found: {id}"))
            }
            OrchestratorError::ProviderFailure {
                message,
                retryable,
                user_turn,
            } => AppError::ProviderFailure {
                message,
                retryable,
                user_turn,
            },
            e @ (OrchestratorError::StoreFailure(_) | OrchestratorError::Internal(_)) => {
                tracing::error!(kind = ?e.kind(), error = %e, "Request failed");
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorResponse::new(msg)),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new(format!("Missing {USER_ID_HEADER} header")),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorResponse::new(msg)),
            AppError::ProviderFailure {
                message,
                retryable,
                user_turn,
            } => {
                let status = if retryable {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::BAD_GATEWAY
                };
                (
                    status,
                    ErrorResponse::provider_failure(message, retryable, *user_turn),
                )
            }
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::new(msg)),
        };

        (status, Json(body)).into_response()
    }
}
