//! Handler for outbound chat messages.

use axum::extract::State;
use axum::Json;
use relay_goofish::OutboundRequest;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub account_id: String,
    /// Conversation id, without the gateway suffix.
    pub chat_id: String,
    pub to_user_id: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub success: bool,
}

/// POST /api/send
///
/// Writes the message on the account's socket. Answers `{"success": true}`
/// once the frame is on the wire, or `400 NOT_CONNECTED` if the account is
/// unknown or not ready.
pub async fn send_message(
    State(state): State<AppState>,
    Json(input): Json<SendMessageRequest>,
) -> AppResult<Json<SendMessageResponse>> {
    for (field, value) in [
        ("accountId", &input.account_id),
        ("chatId", &input.chat_id),
        ("toUserId", &input.to_user_id),
        ("text", &input.text),
    ] {
        if value.trim().is_empty() {
            return Err(AppError::BadRequest(format!("{field} must not be empty")));
        }
    }

    let request = OutboundRequest::new(input.chat_id, input.to_user_id, input.text);
    state.clients.send(&input.account_id, request).await?;

    Ok(Json(SendMessageResponse { success: true }))
}
