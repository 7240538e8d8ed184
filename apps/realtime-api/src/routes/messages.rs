//! Direct-message push endpoint.
//!
//! Persistence and sender authentication live elsewhere; this endpoint's job
//! is the realtime leg: look the recipient up in the presence registry and
//! push `newMessage` to their connection. An offline recipient simply does
//! not receive the push; there is no queueing and no durable delivery.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;

use studyhall_common::id;
use studyhall_common::protocol::{DirectMessage, ServerEvent};

use crate::error::{ApiError, FieldError};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/messages", post(send_message))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: String,
    pub recipient_id: String,
    pub content: Option<String>,
}

async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<DirectMessage>), ApiError> {
    let content = body.content.as_deref().map(|s| s.trim());
    let mut errors = Vec::new();
    if body.sender_id.is_empty() {
        errors.push(FieldError {
            field: "sender_id".to_string(),
            message: "Sender is required".to_string(),
        });
    }
    if body.recipient_id.is_empty() {
        errors.push(FieldError {
            field: "recipient_id".to_string(),
            message: "Recipient is required".to_string(),
        });
    }
    match content {
        None | Some("") => {
            errors.push(FieldError {
                field: "content".to_string(),
                message: "Message content is required".to_string(),
            });
        }
        Some(c) if c.len() > 4000 => {
            errors.push(FieldError {
                field: "content".to_string(),
                message: "Message content must be 4000 characters or fewer".to_string(),
            });
        }
        _ => {}
    }
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }

    let message = DirectMessage {
        id: id::prefixed_ulid(id::prefix::MESSAGE),
        sender_id: body.sender_id,
        recipient_id: body.recipient_id,
        content: content.unwrap().to_string(),
        created_at: Utc::now(),
    };

    let delivered = state
        .registry
        .send_to(&message.recipient_id, &ServerEvent::NewMessage(message.clone()));
    if !delivered {
        tracing::debug!(
            recipient_id = %message.recipient_id,
            "recipient offline, realtime push dropped"
        );
    }

    Ok((StatusCode::CREATED, Json(message)))
}
