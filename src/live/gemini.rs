//! # Remote Live Endpoint
//!
//! Duplex WebSocket to the hosted model's bidirectional streaming API.
//!
//! ## Protocol:
//! 1. **Setup**: first client message names the model, audio output and voice
//! 2. **Acknowledgment**: `setupComplete` → `LiveEvent::Opened`
//! 3. **Capture**: `realtimeInput.mediaChunks` carries one EncodedBlob per tick
//! 4. **Speech**: `serverContent.modelTurn.parts[].inlineData` → `LiveEvent::FrameReceived`
//! 5. **Barge-in**: `serverContent.interrupted` → `LiveEvent::Interrupted`
//!
//! Server messages may arrive as text or binary frames; both hold JSON.

use crate::audio::pcm::{parse_pcm_mime_type, AudioFrame, EncodedBlob};
use crate::live::events::{EventSender, LiveEvent};
use crate::live::manager::{ConnectRequest, LiveConnector, RemoteLink};
use crate::live::LiveError;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Settings for the remote live endpoint.
#[derive(Debug, Clone)]
pub struct GeminiLiveSettings {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub output_sample_rate: u32,
    pub output_channels: u16,
}

pub struct GeminiLiveConnector {
    settings: GeminiLiveSettings,
}

impl GeminiLiveConnector {
    pub fn new(settings: GeminiLiveSettings) -> Self {
        Self { settings }
    }

    fn endpoint(&self) -> String {
        let separator = if self.settings.url.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.settings.url, separator, self.settings.api_key)
    }
}

impl LiveConnector for GeminiLiveConnector {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Box<dyn RemoteLink>, LiveError>> {
        let settings = self.settings.clone();
        let endpoint = self.endpoint();

        async move {
            if settings.api_key.is_empty() {
                return Err(LiveError::AuthorizationFailure("No API key configured".to_string()));
            }

            let (socket, _response) = tokio_tungstenite::connect_async(endpoint.as_str())
                .await
                .map_err(|e| LiveError::from_remote_message(e.to_string()))?;
            let (mut sink, mut stream) = socket.split();

            let setup = setup_message(&settings, request.system_instruction.as_deref());
            sink.send(Message::Text(setup.to_string()))
                .await
                .map_err(|e| LiveError::TransportFailure(format!("Failed to send setup: {}", e)))?;

            info!(session_epoch = request.events.epoch(), model = %settings.model, "Remote live socket open");

            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

            tokio::spawn(async move {
                while let Some(outbound) = outbound_rx.recv().await {
                    let result = match outbound {
                        Outbound::Audio(blob) => sink.send(Message::Text(audio_message(&blob).to_string())).await,
                        Outbound::Close => {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: "client stopped".into(),
                                })))
                                .await;
                            break;
                        }
                    };
                    if let Err(err) = result {
                        debug!("Remote live writer stopped: {}", err);
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            let events = request.events;
            let sample_rate = settings.output_sample_rate;
            let channels = settings.output_channels;
            tokio::spawn(async move {
                read_loop(&mut stream, &events, sample_rate, channels).await;
            });

            Ok(Box::new(GeminiLiveLink {
                outbound: outbound_tx,
                closed: false,
            }) as Box<dyn RemoteLink>)
        }
        .boxed()
    }
}

async fn read_loop<S>(stream: &mut S, events: &EventSender, sample_rate: u32, channels: u16)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let payload = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Ignoring non-UTF-8 binary frame from remote");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                events.emit(close_event(frame));
                return;
            }
            Ok(_) => continue,
            Err(err) => {
                events.emit(LiveEvent::Errored(err.to_string()));
                return;
            }
        };

        for event in parse_server_message(&payload, sample_rate, channels) {
            if !events.emit(event) {
                return;
            }
        }
    }

    events.emit(LiveEvent::Errored("Remote live connection ended unexpectedly".to_string()));
}

fn close_event(frame: Option<CloseFrame<'_>>) -> LiveEvent {
    match frame {
        None => LiveEvent::Closed,
        Some(frame) if frame.code == CloseCode::Normal => LiveEvent::Closed,
        Some(frame) => {
            let reason = if frame.reason.is_empty() {
                format!("Remote closed the session ({})", u16::from(frame.code))
            } else {
                frame.reason.to_string()
            };
            LiveEvent::Errored(reason)
        }
    }
}

enum Outbound {
    Audio(EncodedBlob),
    Close,
}

struct GeminiLiveLink {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: bool,
}

impl RemoteLink for GeminiLiveLink {
    fn send_audio(&mut self, blob: EncodedBlob) -> Result<(), LiveError> {
        if self.closed {
            return Err(LiveError::TransportFailure("Live link is closed".to_string()));
        }
        self.outbound
            .send(Outbound::Audio(blob))
            .map_err(|_| LiveError::TransportFailure("Live link writer has stopped".to_string()))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.outbound.send(Outbound::Close);
        }
    }
}

impl Drop for GeminiLiveLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [&'a EncodedBlob; 1],
}

fn audio_message(blob: &EncodedBlob) -> Value {
    json!({ "realtimeInput": RealtimeInput { media_chunks: [blob] } })
}

fn setup_message(settings: &GeminiLiveSettings, system_instruction: Option<&str>) -> Value {
    let model = if settings.model.starts_with("models/") {
        settings.model.clone()
    } else {
        format!("models/{}", settings.model)
    };

    let mut setup = json!({
        "model": model,
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": settings.voice_name }
                }
            }
        }
    });

    if let Some(instruction) = system_instruction.filter(|s| !s.trim().is_empty()) {
        setup["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
    }

    json!({ "setup": setup })
}

/// Turn one server message into events. Audio parts that do not decode are
/// skipped; the rest of the message still counts.
pub fn parse_server_message(payload: &str, sample_rate: u32, channels: u16) -> Vec<LiveEvent> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            warn!("Ignoring malformed live message: {}", err);
            return Vec::new();
        }
    };

    let mut events = Vec::new();

    if value.get("setupComplete").is_some() {
        events.push(LiveEvent::Opened);
    }

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        events.push(LiveEvent::Errored(message));
    }

    let Some(content) = value.get("serverContent") else {
        return events;
    };

    if content.get("interrupted").and_then(Value::as_bool).unwrap_or(false) {
        events.push(LiveEvent::Interrupted);
    }

    let parts = content
        .pointer("/modelTurn/parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for part in parts {
        let Some(inline) = part.get("inlineData") else {
            continue;
        };
        match decode_inline_audio(inline, sample_rate, channels) {
            Ok(Some(frame)) => events.push(LiveEvent::FrameReceived(frame)),
            Ok(None) => {}
            Err(err) => debug!("Skipping audio part: {}", err),
        }
    }

    events
}

fn decode_inline_audio(inline: &Value, default_rate: u32, channels: u16) -> Result<Option<AudioFrame>, LiveError> {
    let mime_type = inline.get("mimeType").and_then(Value::as_str).unwrap_or_default();
    let Some(rate) = parse_pcm_mime_type(mime_type) else {
        return Ok(None);
    };
    let data = inline
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| LiveError::DecodeFailure("Inline audio has no data".to_string()))?;

    AudioFrame::from_base64(data, rate.unwrap_or(default_rate), channels).map(Some)
}
