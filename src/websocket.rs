//! # Live Voice WebSocket
//!
//! `GET /ws/live` bridges a browser (which owns the microphone and the
//! speaker) to one live session with the hosted model.
//!
//! ## Client → Server:
//! - Text: `start_session`, `stop_session`, `buffer_ended`, `ping` (JSON, `type`-tagged)
//! - Binary: one capture tick of little-endian f32 mono samples at 16kHz
//!
//! ## Server → Client:
//! - `session_status { state, message? }`
//! - `play { buffer_id, start_time, duration, sample_rate, channels }` where
//!   each channel is base64 little-endian f32 and `start_time` is seconds on
//!   the session's output clock (zero when the remote connection was
//!   established, which is slightly before the `active` status)
//! - `stop_buffer { buffer_id }`
//! - `error { code, message }`
//! - `pong { timestamp }`
//!
//! ## Structure:
//! `LiveBridge` holds the protocol logic and the session manager; the actor
//! around it only moves frames, runs the heartbeat and drives the connect
//! future. All outbound messages go through one queue, so the browser sees
//! them in the order the manager produced them.

use crate::audio::capture::CaptureConfig;
use crate::audio::pcm::{f32_samples_from_le_bytes, f32_samples_to_base64};
use crate::audio::playback::{AudioOutput, BufferId, MonotonicClock, PlaybackBuffer};
use crate::live::manager::{LiveConnector, MicrophoneAccess, PendingStart, PlaybackDevice, RemoteLink};
use crate::live::{event_channel, EventReceiver, LiveError, LiveSessionManager, SessionState, TaggedEvent};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Outcome of the browser's microphone permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicrophoneStatus {
    Granted,
    Denied,
    Unavailable,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartSession {
        microphone: MicrophoneStatus,
        #[serde(default)]
        system_instruction: Option<String>,
    },
    StopSession,
    BufferEnded {
        buffer_id: BufferId,
    },
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionStatus {
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Play {
        buffer_id: BufferId,
        start_time: f64,
        duration: f64,
        sample_rate: u32,
        channels: Vec<String>,
    },
    StopBuffer {
        buffer_id: BufferId,
    },
    Error {
        code: String,
        message: String,
    },
    Pong {
        timestamp: u64,
    },
}

impl ServerMessage {
    fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn from_live_error(err: &LiveError) -> Self {
        ServerMessage::error(err.code(), err.user_message())
    }
}

type Outbox = Rc<RefCell<Vec<ServerMessage>>>;

/// Builds the connector for a session from the configuration current at
/// `start_session`.
pub type ConnectorSource = Box<dyn Fn(&AppState) -> Arc<dyn LiveConnector>>;

/// Microphone answer relayed from the browser.
pub struct BrowserMicrophone(pub MicrophoneStatus);

impl MicrophoneAccess for BrowserMicrophone {
    fn request_access(&self) -> BoxFuture<'static, Result<(), LiveError>> {
        let result = match self.0 {
            MicrophoneStatus::Granted => Ok(()),
            MicrophoneStatus::Denied => Err(LiveError::PermissionDenied(
                "Microphone access was refused".to_string(),
            )),
            MicrophoneStatus::Unavailable => Err(LiveError::DeviceUnavailable(
                "No microphone is available".to_string(),
            )),
        };
        future::ready(result).boxed()
    }
}

/// Speaker on the far side of the socket: play and stop become messages.
pub struct ClientOutput {
    outbox: Outbox,
}

impl AudioOutput for ClientOutput {
    fn start(&mut self, buffer: &PlaybackBuffer) -> Result<(), LiveError> {
        self.outbox.borrow_mut().push(ServerMessage::Play {
            buffer_id: buffer.id,
            start_time: buffer.start_time,
            duration: buffer.duration,
            sample_rate: buffer.sample_rate,
            channels: buffer.channels.iter().map(|c| f32_samples_to_base64(c)).collect(),
        });
        Ok(())
    }

    fn stop(&mut self, id: BufferId) -> Result<(), LiveError> {
        self.outbox.borrow_mut().push(ServerMessage::StopBuffer { buffer_id: id });
        Ok(())
    }
}

pub struct BrowserPlayback {
    outbox: Outbox,
}

impl PlaybackDevice for BrowserPlayback {
    type Output = ClientOutput;
    type Clock = MonotonicClock;

    fn open(&mut self) -> Result<(ClientOutput, MonotonicClock), LiveError> {
        Ok((
            ClientOutput {
                outbox: self.outbox.clone(),
            },
            MonotonicClock::start(),
        ))
    }
}

/// Protocol logic of one browser connection.
pub struct LiveBridge {
    manager: LiveSessionManager<BrowserPlayback>,
    outbox: Outbox,
    app_state: AppState,
    connector_source: ConnectorSource,
    reported_state: SessionState,
    holds_slot: bool,
}

impl LiveBridge {
    pub fn new(app_state: AppState) -> (Self, EventReceiver) {
        Self::with_connector_source(app_state, Box::new(AppState::live_connector))
    }

    pub fn with_connector_source(app_state: AppState, connector_source: ConnectorSource) -> (Self, EventReceiver) {
        let config = app_state.get_config();
        let connector = connector_source(&app_state);
        let outbox: Outbox = Rc::new(RefCell::new(Vec::new()));
        let (hub, events) = event_channel();

        let manager = LiveSessionManager::new(
            BrowserPlayback {
                outbox: outbox.clone(),
            },
            connector,
            hub,
            CaptureConfig {
                sample_rate: config.audio.input_sample_rate,
                chunk_samples: config.audio.capture_chunk_samples,
            },
        );

        let bridge = Self {
            manager,
            outbox,
            app_state,
            connector_source,
            reported_state: SessionState::Idle,
            holds_slot: false,
        };
        (bridge, events)
    }

    pub fn state(&self) -> SessionState {
        self.manager.state()
    }

    /// Admission, then Idle → Connecting. Returns the connect work to run.
    pub fn start(
        &mut self,
        microphone: MicrophoneStatus,
        system_instruction: Option<String>,
    ) -> Option<PendingStart> {
        if self.manager.state() != SessionState::Idle {
            let err = LiveError::InvalidState(format!(
                "A session is already {}",
                self.manager.state().as_str()
            ));
            self.push(ServerMessage::from_live_error(&err));
            return None;
        }

        if !self.app_state.try_acquire_live_session() {
            warn!("Live session limit reached");
            self.push(ServerMessage::error(
                "session_limit",
                "Too many live conversations are running. Try again shortly.",
            ));
            return None;
        }
        self.holds_slot = true;

        // Credentials may have been replaced since the socket opened.
        self.manager.set_connector((self.connector_source)(&self.app_state));

        let pending = match self.manager.begin_start(&BrowserMicrophone(microphone), system_instruction) {
            Ok(pending) => Some(pending),
            Err(err) => {
                self.push(ServerMessage::from_live_error(&err));
                None
            }
        };
        self.sync();
        pending
    }

    pub fn complete_start(&mut self, epoch: u64, result: Result<Box<dyn RemoteLink>, LiveError>) {
        // The failure itself is reported by `sync` from the manager's last error.
        let _ = self.manager.complete_start(epoch, result);
        self.sync();
    }

    pub fn handle_event(&mut self, tagged: TaggedEvent) {
        self.manager.handle_event(tagged);
        self.sync();
    }

    pub fn capture(&mut self, data: &[u8]) {
        match f32_samples_from_le_bytes(data) {
            Ok(samples) => {
                self.manager.on_capture_tick(&samples);
            }
            Err(err) => self.push(ServerMessage::error("invalid_audio", err.to_string())),
        }
    }

    pub fn buffer_ended(&mut self, id: BufferId) {
        if !self.manager.on_buffer_ended(id) {
            debug!(buffer_id = %id, "Ended buffer was not live");
        }
    }

    pub fn stop(&mut self) {
        self.manager.stop();
        self.sync();
    }

    pub fn pong(&mut self, timestamp: u64) {
        self.push(ServerMessage::Pong { timestamp });
    }

    pub fn protocol_error(&mut self, message: impl Into<String>) {
        self.push(ServerMessage::error("invalid_message", message));
    }

    /// Messages produced since the last call, in order.
    pub fn take_outgoing(&mut self) -> Vec<ServerMessage> {
        std::mem::take(&mut *self.outbox.borrow_mut())
    }

    fn push(&self, message: ServerMessage) {
        self.outbox.borrow_mut().push(message);
    }

    /// Report state changes and release the admission slot once idle.
    fn sync(&mut self) {
        let state = self.manager.state();

        if state != self.reported_state {
            let message = if state == SessionState::Idle {
                self.manager.last_error().map(|err| {
                    self.push(ServerMessage::from_live_error(err));
                    err.user_message().to_string()
                })
            } else {
                None
            };

            self.push(ServerMessage::SessionStatus {
                state: state.as_str().to_string(),
                message,
            });
            self.reported_state = state;
        }

        if state == SessionState::Idle && self.holds_slot {
            self.holds_slot = false;
            self.app_state.release_live_session();
        }
    }
}

impl Drop for LiveBridge {
    fn drop(&mut self) {
        self.manager.stop();
        if self.holds_slot {
            self.holds_slot = false;
            self.app_state.release_live_session();
        }
    }
}

/// Actor for one `/ws/live` connection.
pub struct LiveWebSocket {
    bridge: LiveBridge,
    events: Option<EventReceiver>,
    app_state: AppState,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
}

impl LiveWebSocket {
    pub fn new(app_state: AppState) -> Self {
        let config = app_state.get_config();
        let (bridge, events) = LiveBridge::new(app_state.clone());
        Self {
            bridge,
            events: Some(events),
            app_state,
            heartbeat_interval: Duration::from_secs(config.live.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.live.client_timeout_secs),
            last_heartbeat: Instant::now(),
        }
    }

    fn flush(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        for message in self.bridge.take_outgoing() {
            match serde_json::to_string(&message) {
                Ok(json) => ctx.text(json),
                Err(err) => error!("Failed to serialize outbound message: {}", err),
            }
        }
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::StartSession {
                microphone,
                system_instruction,
            } => {
                if let Some(pending) = self.bridge.start(microphone, system_instruction) {
                    let epoch = pending.epoch;
                    ctx.spawn(pending.connect.into_actor(self).map(move |result, act, ctx| {
                        act.bridge.complete_start(epoch, result);
                        act.flush(ctx);
                    }));
                }
            }
            ClientMessage::StopSession => self.bridge.stop(),
            ClientMessage::BufferEnded { buffer_id } => self.bridge.buffer_ended(buffer_id),
            ClientMessage::Ping { timestamp } => self.bridge.pong(timestamp),
        }
    }
}

impl Actor for LiveWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Live WebSocket connection started");
        self.app_state.client_connected();

        if let Some(events) = self.events.take() {
            ctx.add_stream(UnboundedReceiverStream::new(events));
        }

        let timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!("Live WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.bridge.stop();
        self.app_state.client_disconnected();
        info!("Live WebSocket connection stopped");
    }
}

impl StreamHandler<TaggedEvent> for LiveWebSocket {
    fn handle(&mut self, event: TaggedEvent, ctx: &mut Self::Context) {
        self.bridge.handle_event(event);
        self.flush(ctx);
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!("Live event stream finished");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for LiveWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_client_message(message, ctx),
                Err(err) => self.bridge.protocol_error(format!("Invalid JSON: {}", err)),
            },
            Ok(ws::Message::Binary(data)) => self.bridge.capture(&data),
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Live WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
        self.flush(ctx);
    }
}

pub async fn live_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New live WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(LiveWebSocket::new(app_state.get_ref().clone()), &req, stream)
}
