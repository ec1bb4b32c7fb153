//! # Hosted Model Client
//!
//! Request/response calls to the hosted generative model: text chat (with
//! inline attachments and optional image output) and text-to-speech.
//!
//! ## Error Classification:
//! Every remote failure goes through `LiveError::from_remote_message`, so the
//! same "entity was not found" marker that ends a live session also turns a
//! chat failure into an authorization problem. Nothing here retries.

use crate::config::GenAiConfig;
use crate::live::LiveError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Inline binary payload (attachment in, generated image out).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineData {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One prior exchange sent as conversation context.
#[derive(Debug, Clone)]
pub struct ContextTurn {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub text: String,
    pub attachments: Vec<InlineData>,
    pub system_instruction: Option<String>,
    pub generate_image: bool,
    pub history: Vec<ContextTurn>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerateReply {
    pub text: String,
    pub images: Vec<InlineData>,
}

// Wire format of the generateContent endpoint
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenerationConfig>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireInlineData>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    response_modalities: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<serde_json::Value>,
}

#[derive(Deserialize, Default)]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
}

#[derive(Deserialize)]
struct WireCandidate {
    #[serde(default)]
    content: WireContent,
}

#[derive(Deserialize)]
struct WireErrorBody {
    error: WireError,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
}

impl WirePart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    fn inline(data: &InlineData) -> Self {
        Self {
            text: None,
            inline_data: Some(WireInlineData {
                mime_type: data.mime_type.clone(),
                data: data.data.clone(),
            }),
        }
    }
}

/// Client for the hosted model's REST surface.
#[derive(Clone)]
pub struct GenAiClient {
    config: GenAiConfig,
    client: reqwest::Client,
}

impl GenAiClient {
    pub fn new(config: GenAiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.api_key.trim().is_empty()
    }

    /// Text (and optionally image) generation.
    pub async fn generate(&self, request: &GenerateRequest) -> Result<GenerateReply, LiveError> {
        let model = if request.generate_image {
            &self.config.image_model
        } else {
            &self.config.text_model
        };

        let body = build_generate_body(request);
        let response = self.post(model, &body).await?;
        let reply = reply_from_response(response);

        debug!(
            model = %model,
            text_len = reply.text.len(),
            images = reply.images.len(),
            "Generation complete"
        );
        Ok(reply)
    }

    /// Speech synthesis. `Ok(None)` when the remote answered without audio.
    pub async fn synthesize_speech(&self, text: &str) -> Result<Option<String>, LiveError> {
        let body = build_tts_body(text, &self.config.voice_name);
        let response = self.post(&self.config.tts_model, &body).await?;
        Ok(first_inline_data(response).map(|inline| inline.data))
    }

    async fn post(&self, model: &str, body: &WireRequest) -> Result<WireResponse, LiveError> {
        if !self.is_configured() {
            return Err(LiveError::AuthorizationFailure("No API key configured".to_string()));
        }

        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        );

        let res = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.config.api_key.trim())
            .json(body)
            .send()
            .await
            .map_err(|e| LiveError::TransportFailure(format!("Request failed: {}", e)))?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            let message = remote_error_message(&text).unwrap_or(text);
            warn!(status = status.as_u16(), model = %model, "Remote model error: {}", message);
            return Err(LiveError::from_remote_message(format!("{} ({})", message, status)));
        }

        res.json::<WireResponse>()
            .await
            .map_err(|e| LiveError::TransportFailure(format!("Response parse failed: {}", e)))
    }
}

fn build_generate_body(request: &GenerateRequest) -> WireRequest {
    let mut contents: Vec<WireContent> = request
        .history
        .iter()
        .filter(|turn| !turn.text.trim().is_empty())
        .map(|turn| WireContent {
            role: Some(role_name(turn.role).to_string()),
            parts: vec![WirePart::text(turn.text.clone())],
        })
        .collect();

    let mut parts: Vec<WirePart> = request.attachments.iter().map(WirePart::inline).collect();
    if !request.text.is_empty() {
        parts.push(WirePart::text(request.text.clone()));
    }
    contents.push(WireContent {
        role: Some("user".to_string()),
        parts,
    });

    WireRequest {
        contents,
        system_instruction: request
            .system_instruction
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| WireContent {
                role: None,
                parts: vec![WirePart::text(s)],
            }),
        generation_config: request.generate_image.then(|| WireGenerationConfig {
            response_modalities: vec!["TEXT", "IMAGE"],
            speech_config: None,
        }),
    }
}

fn build_tts_body(text: &str, voice_name: &str) -> WireRequest {
    WireRequest {
        contents: vec![WireContent {
            role: Some("user".to_string()),
            parts: vec![WirePart::text(text)],
        }],
        system_instruction: None,
        generation_config: Some(WireGenerationConfig {
            response_modalities: vec!["AUDIO"],
            speech_config: Some(serde_json::json!({
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice_name } }
            })),
        }),
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "model",
    }
}

fn reply_from_response(response: WireResponse) -> GenerateReply {
    let mut reply = GenerateReply::default();
    let parts = response
        .candidates
        .into_iter()
        .next()
        .map(|c| c.content.parts)
        .unwrap_or_default();

    for part in parts {
        if let Some(text) = part.text {
            reply.text.push_str(&text);
        }
        if let Some(inline) = part.inline_data {
            reply.images.push(InlineData {
                mime_type: inline.mime_type,
                data: inline.data,
            });
        }
    }
    reply
}

fn first_inline_data(response: WireResponse) -> Option<InlineData> {
    response
        .candidates
        .into_iter()
        .flat_map(|c| c.content.parts)
        .find_map(|p| p.inline_data)
        .filter(|inline| !inline.data.is_empty())
        .map(|inline| InlineData {
            mime_type: inline.mime_type,
            data: inline.data,
        })
}

fn remote_error_message(body: &str) -> Option<String> {
    serde_json::from_str::<WireErrorBody>(body)
        .ok()
        .map(|b| b.error.message)
        .filter(|m| !m.is_empty())
}

#[cfg(test)]
pub(crate) mod test_support {
    use actix_web::dev::ServerHandle;
    use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
    use serde_json::Value;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    /// One request received by `StubModel`.
    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        /// Last path segment, e.g. `gemini-2.5-flash:generateContent`.
        pub model_call: String,
        pub api_key: Option<String>,
        pub body: Value,
    }

    struct StubState {
        calls: Arc<Mutex<Vec<RecordedCall>>>,
        reply: Value,
    }

    /// Local stand-in for the hosted model that answers every
    /// `generateContent` call with the same reply and records the request.
    pub struct StubModel {
        pub base_url: String,
        calls: Arc<Mutex<Vec<RecordedCall>>>,
        handle: ServerHandle,
    }

    async fn generate_content(
        state: web::Data<StubState>,
        req: HttpRequest,
        call: web::Path<String>,
        body: web::Json<Value>,
    ) -> HttpResponse {
        let api_key = req
            .headers()
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        state.calls.lock().unwrap().push(RecordedCall {
            model_call: call.into_inner(),
            api_key,
            body: body.into_inner(),
        });
        HttpResponse::Ok().json(&state.reply)
    }

    impl StubModel {
        /// Must be called inside an actix system (`#[actix_web::test]`).
        pub fn start(reply: Value) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            let calls = Arc::new(Mutex::new(Vec::new()));

            let shared = calls.clone();
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(StubState {
                        calls: shared.clone(),
                        reply: reply.clone(),
                    }))
                    .route("/models/{call}", web::post().to(generate_content))
            })
            .workers(1)
            .listen(listener)
            .unwrap()
            .run();

            let handle = server.handle();
            actix_web::rt::spawn(server);

            Self {
                base_url: format!("http://127.0.0.1:{}", port),
                calls,
                handle,
            }
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        pub async fn stop(self) {
            self.handle.stop(false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn to_value(body: &WireRequest) -> Value {
        serde_json::to_value(body).unwrap()
    }

    #[test]
    fn test_generate_body_places_history_attachments_and_text() {
        let request = GenerateRequest {
            text: "What is in this picture?".to_string(),
            attachments: vec![InlineData {
                mime_type: "image/png".to_string(),
                data: "iVBORw0".to_string(),
            }],
            system_instruction: Some("Be brief".to_string()),
            generate_image: false,
            history: vec![
                ContextTurn { role: Role::User, text: "hi".to_string() },
                ContextTurn { role: Role::Model, text: "hello".to_string() },
            ],
        };

        let body = to_value(&build_generate_body(&request));
        assert_eq!(body["contents"].as_array().unwrap().len(), 3);
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][2]["parts"][0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(body["contents"][2]["parts"][1]["text"], "What is in this picture?");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be brief");
        assert!(body.get("generationConfig").is_none());
    }

    #[test]
    fn test_image_generation_requests_both_modalities() {
        let request = GenerateRequest {
            text: "draw a cat".to_string(),
            generate_image: true,
            ..Default::default()
        };
        let body = to_value(&build_generate_body(&request));
        assert_eq!(body["generationConfig"]["responseModalities"], json!(["TEXT", "IMAGE"]));
    }

    #[test]
    fn test_tts_body_names_voice() {
        let body = to_value(&build_tts_body("hello", "Kore"));
        assert_eq!(body["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            body["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
    }

    #[test]
    fn test_reply_collects_text_and_images() {
        let response: WireResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        { "text": "Here " },
                        { "inlineData": { "mimeType": "image/png", "data": "AAAA" } },
                        { "text": "it is" }
                    ]
                }
            }]
        }))
        .unwrap();

        let reply = reply_from_response(response);
        assert_eq!(reply.text, "Here it is");
        assert_eq!(reply.images.len(), 1);
        assert_eq!(reply.images[0].mime_type, "image/png");
    }

    #[test]
    fn test_tts_without_payload_is_none() {
        let empty: WireResponse = serde_json::from_value(json!({ "candidates": [] })).unwrap();
        assert!(first_inline_data(empty).is_none());

        let audio: WireResponse = serde_json::from_value(json!({
            "candidates": [{ "content": { "parts": [{ "inlineData": { "mimeType": "audio/pcm", "data": "AQI=" } }] } }]
        }))
        .unwrap();
        assert_eq!(first_inline_data(audio).unwrap().data, "AQI=");
    }

    #[test]
    fn test_remote_error_message_extraction() {
        let body = r#"{"error":{"code":404,"message":"Requested entity was not found.","status":"NOT_FOUND"}}"#;
        let message = remote_error_message(body).unwrap();
        assert!(matches!(
            LiveError::from_remote_message(message),
            LiveError::AuthorizationFailure(_)
        ));
        assert!(remote_error_message("<html>").is_none());
    }

    #[tokio::test]
    async fn test_missing_key_is_authorization_failure() {
        let client = GenAiClient::new(GenAiConfig {
            api_key: String::new(),
            ..GenAiConfig::default()
        });
        let err = client.synthesize_speech("hi").await.unwrap_err();
        assert!(matches!(err, LiveError::AuthorizationFailure(_)));
    }
}
