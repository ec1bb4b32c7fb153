//! # Chat Handlers
//!
//! Text chat with the hosted model, with optional attachments and image
//! output.
//!
//! ## Endpoints:
//! - `POST /api/v1/chat` - JSON request
//! - `POST /api/v1/chat/upload` - multipart form, files become attachments
//!
//! When `session_id` names a stored session, its earlier turns are sent as
//! context and the new exchange is appended to it.

use crate::error::AppError;
use crate::genai::{ContextTurn, GenerateReply, GenerateRequest, InlineData, Role};
use crate::history::{ChatTurn, StoredAttachment};
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Largest single uploaded file.
const MAX_ATTACHMENT_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttachmentInput {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentInput>,
    #[serde(default)]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub generate_image: bool,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub text: String,
    pub images: Vec<InlineData>,
}

pub async fn chat(
    state: web::Data<AppState>,
    body: web::Json<ChatRequest>,
) -> Result<HttpResponse, AppError> {
    let response = run_chat(&state, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

/// Multipart variant of `chat`.
///
/// ## Fields:
/// - `text`, `system_instruction`, `session_id`: plain text
/// - `generate_image`: "true" / "1" to request image output
/// - any part with a filename: an attachment, typed by its content type
pub async fn chat_upload(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let mut request = ChatRequest::default();

    while let Some(item) = payload.next().await {
        let mut field: Field = item.map_err(|e| AppError::ValidationError(format!("Multipart error: {}", e)))?;

        let (field_name, filename) = {
            let disposition = field.content_disposition().ok_or_else(|| {
                AppError::ValidationError("Missing content disposition".to_string())
            })?;
            (
                disposition.get_name().unwrap_or_default().to_string(),
                disposition.get_filename().map(str::to_string),
            )
        };
        let mime_type = field
            .content_type()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let bytes = read_field(&mut field).await?;

        if filename.is_some() {
            debug!(name = ?filename, mime_type = %mime_type, size = bytes.len(), "Received attachment");
            request.attachments.push(AttachmentInput {
                mime_type,
                data: STANDARD.encode(&bytes),
                name: filename,
            });
            continue;
        }

        let value = String::from_utf8(bytes)
            .map_err(|_| AppError::ValidationError(format!("Field {} is not UTF-8 text", field_name)))?;

        match field_name.as_str() {
            "text" => request.text = value,
            "system_instruction" => request.system_instruction = Some(value),
            "session_id" => request.session_id = Some(value),
            "generate_image" => request.generate_image = matches!(value.trim(), "true" | "1" | "on"),
            other => debug!(field = %other, "Ignoring unknown form field"),
        }
    }

    let response = run_chat(&state, request).await?;
    Ok(HttpResponse::Ok().json(response))
}

async fn read_field(field: &mut Field) -> Result<Vec<u8>, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
        bytes.extend_from_slice(&chunk);
        if bytes.len() > MAX_ATTACHMENT_BYTES {
            return Err(AppError::ValidationError(format!(
                "Attachment too large (max: {} bytes)",
                MAX_ATTACHMENT_BYTES
            )));
        }
    }
    Ok(bytes)
}

async fn run_chat(state: &AppState, request: ChatRequest) -> Result<ChatResponse, AppError> {
    if request.text.trim().is_empty() && request.attachments.is_empty() {
        return Err(AppError::ValidationError(
            "Either text or at least one attachment is required".to_string(),
        ));
    }

    let session_id = request
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let history = match &session_id {
        Some(id) => state
            .history
            .get(id)?
            .turns
            .into_iter()
            .map(|turn| ContextTurn {
                role: turn.role,
                text: turn.text,
            })
            .collect(),
        None => Vec::new(),
    };

    let generate = GenerateRequest {
        text: request.text.clone(),
        attachments: request
            .attachments
            .iter()
            .map(|a| InlineData {
                mime_type: a.mime_type.clone(),
                data: a.data.clone(),
            })
            .collect(),
        system_instruction: request.system_instruction.clone(),
        generate_image: request.generate_image,
        history,
    };

    let reply = state.genai_client().generate(&generate).await?;

    if let Some(id) = &session_id {
        state.history.append_turns(id, exchange_turns(&request, &reply))?;
    }

    info!(
        session_id = ?session_id,
        attachments = request.attachments.len(),
        images = reply.images.len(),
        "Chat reply generated"
    );

    Ok(ChatResponse {
        session_id,
        text: reply.text,
        images: reply.images,
    })
}

fn exchange_turns(request: &ChatRequest, reply: &GenerateReply) -> Vec<ChatTurn> {
    let user_attachments = request
        .attachments
        .iter()
        .map(|a| StoredAttachment {
            mime_type: a.mime_type.clone(),
            name: a.name.clone(),
            data: a.data.clone(),
        })
        .collect();

    let model_attachments = reply
        .images
        .iter()
        .map(|image| StoredAttachment {
            mime_type: image.mime_type.clone(),
            name: None,
            data: image.data.clone(),
        })
        .collect();

    vec![
        ChatTurn::new(Role::User, request.text.clone(), user_attachments),
        ChatTurn::new(Role::Model, reply.text.clone(), model_attachments),
    ]
}
