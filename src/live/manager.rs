//! # Live Session Lifecycle
//!
//! Owns the single remote session handle of one browser connection, together
//! with its two audio contexts (capture pipeline and playback scheduler), and
//! guarantees they are torn down together.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: nothing open
//! 2. **Connecting**: microphone requested, remote connection opening
//! 3. **Active**: remote acknowledged the setup, capture ticks flow out
//! 4. **Closed** / **Errored**: remote went away; teardown runs and the
//!    manager is back to **Idle** before the call returns
//!
//! ## Epochs:
//! Every start allocates a new epoch and every stop advances it. Connect
//! results and remote events carry the epoch they were created under, so
//! anything arriving after a `stop()` (a late open acknowledgment, trailing
//! frames) is dropped instead of resurrecting the session.

use crate::audio::capture::{BlobSink, CaptureConfig, CapturePipeline};
use crate::audio::pcm::EncodedBlob;
use crate::audio::playback::{AudioClock, AudioOutput, BufferId, PlaybackScheduler};
use crate::live::events::{EventHub, EventSender, LiveEvent, TaggedEvent};
use crate::live::LiveError;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closed,
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        }
    }
}

/// Asks the user for the microphone.
pub trait MicrophoneAccess {
    fn request_access(&self) -> BoxFuture<'static, Result<(), LiveError>>;
}

/// Open half of the remote live session.
pub trait RemoteLink: Send {
    fn send_audio(&mut self, blob: EncodedBlob) -> Result<(), LiveError>;

    /// Close the connection. Must not fail and may be called on a dead link.
    fn close(&mut self);
}

impl BlobSink for Box<dyn RemoteLink> {
    fn send_audio(&mut self, blob: EncodedBlob) -> Result<(), LiveError> {
        (**self).send_audio(blob)
    }
}

/// What a connector needs to open one session.
pub struct ConnectRequest {
    pub events: EventSender,
    pub system_instruction: Option<String>,
}

/// Opens remote sessions. The returned future resolves once the transport is
/// up; the remote's own acknowledgment arrives later as `LiveEvent::Opened`.
pub trait LiveConnector: Send + Sync {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<Box<dyn RemoteLink>, LiveError>>;
}

/// Opens the output audio context for a session.
pub trait PlaybackDevice {
    type Output: AudioOutput;
    type Clock: AudioClock;

    fn open(&mut self) -> Result<(Self::Output, Self::Clock), LiveError>;
}

/// Everything one live session owns. Dropped as a unit on stop.
struct SessionHandle<O, C> {
    link: Box<dyn RemoteLink>,
    capture: CapturePipeline,
    playback: PlaybackScheduler<O, C>,
}

/// Connect work that runs outside the manager (so an actor is not blocked
/// while the user answers the permission prompt).
pub struct PendingStart {
    pub epoch: u64,
    pub connect: BoxFuture<'static, Result<Box<dyn RemoteLink>, LiveError>>,
}

pub struct LiveSessionManager<D: PlaybackDevice> {
    state: SessionState,
    epoch: u64,
    handle: Option<SessionHandle<D::Output, D::Clock>>,
    /// `Opened` that overtook the connect result.
    early_open: bool,
    last_error: Option<LiveError>,
    device: D,
    connector: Arc<dyn LiveConnector>,
    events: EventHub,
    capture_config: CaptureConfig,
}

impl<D: PlaybackDevice> LiveSessionManager<D> {
    pub fn new(
        device: D,
        connector: Arc<dyn LiveConnector>,
        events: EventHub,
        capture_config: CaptureConfig,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            epoch: 0,
            handle: None,
            early_open: false,
            last_error: None,
            device,
            connector,
            events,
            capture_config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Most recent failure, kept until the next start.
    pub fn last_error(&self) -> Option<&LiveError> {
        self.last_error.as_ref()
    }

    pub fn has_session(&self) -> bool {
        self.handle.is_some()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.handle.as_ref().map_or(0, |h| h.playback.live_count())
    }

    pub fn next_start_time(&self) -> Option<f64> {
        self.handle.as_ref().map(|h| h.playback.next_start_time())
    }

    pub fn ticks_sent(&self) -> u64 {
        self.handle.as_ref().map_or(0, |h| h.capture.ticks_sent())
    }

    /// Connector for the next start. An open session keeps its own link.
    pub fn set_connector(&mut self, connector: Arc<dyn LiveConnector>) {
        self.connector = connector;
    }

    /// Idle → Connecting. Fails without side effects if a session exists.
    pub fn begin_start(
        &mut self,
        microphone: &dyn MicrophoneAccess,
        system_instruction: Option<String>,
    ) -> Result<PendingStart, LiveError> {
        if self.state != SessionState::Idle {
            warn!(state = self.state.as_str(), "Rejecting start while a session exists");
            return Err(LiveError::InvalidState(format!(
                "Cannot start from state: {}",
                self.state.as_str()
            )));
        }

        self.epoch += 1;
        self.state = SessionState::Connecting;
        self.early_open = false;
        self.last_error = None;
        info!(session_epoch = self.epoch, "Live session connecting");

        let permission = microphone.request_access();
        let connector = self.connector.clone();
        let request = ConnectRequest {
            events: self.events.sender(self.epoch),
            system_instruction,
        };

        let connect = async move {
            permission.await?;
            connector.connect(request).await
        }
        .boxed();

        Ok(PendingStart {
            epoch: self.epoch,
            connect,
        })
    }

    /// Install the connect result. Results for a stopped session are closed
    /// and ignored.
    pub fn complete_start(
        &mut self,
        epoch: u64,
        result: Result<Box<dyn RemoteLink>, LiveError>,
    ) -> Result<(), LiveError> {
        if epoch != self.epoch || self.state != SessionState::Connecting {
            debug!(session_epoch = epoch, current = self.epoch, "Discarding stale connect result");
            if let Ok(mut link) = result {
                link.close();
            }
            return Ok(());
        }

        let mut link = match result {
            Ok(link) => link,
            Err(err) => {
                self.fail(err.clone());
                return Err(err);
            }
        };

        let (output, clock) = match self.device.open() {
            Ok(parts) => parts,
            Err(err) => {
                link.close();
                self.fail(err.clone());
                return Err(err);
            }
        };

        self.handle = Some(SessionHandle {
            link,
            capture: CapturePipeline::new(self.capture_config.clone()),
            playback: PlaybackScheduler::new(output, clock),
        });

        if self.early_open {
            self.early_open = false;
            self.state = SessionState::Active;
            info!(session_epoch = self.epoch, "Live session active");
        }

        Ok(())
    }

    /// Run a whole start in place. Used where nothing else needs the manager
    /// while the connection opens.
    pub async fn start(
        &mut self,
        microphone: &dyn MicrophoneAccess,
        system_instruction: Option<String>,
    ) -> Result<(), LiveError> {
        let pending = self.begin_start(microphone, system_instruction)?;
        let result = pending.connect.await;
        self.complete_start(pending.epoch, result)
    }

    /// Feed one remote event.
    pub fn handle_event(&mut self, tagged: TaggedEvent) {
        if tagged.epoch != self.epoch || self.state == SessionState::Idle {
            debug!(
                session_epoch = tagged.epoch,
                current = self.epoch,
                event = tagged.event.kind(),
                "Ignoring event from a finished session"
            );
            return;
        }

        match tagged.event {
            LiveEvent::Opened => {
                if self.state != SessionState::Connecting {
                    return;
                }
                if self.handle.is_some() {
                    self.state = SessionState::Active;
                    info!(session_epoch = self.epoch, "Live session active");
                } else {
                    self.early_open = true;
                }
            }
            LiveEvent::FrameReceived(frame) => {
                if let Some(handle) = self.handle.as_mut() {
                    if let Err(err) = handle.playback.schedule(&frame) {
                        warn!("Could not schedule frame: {}", err);
                    }
                }
            }
            LiveEvent::Interrupted => {
                if let Some(handle) = self.handle.as_mut() {
                    handle.playback.interrupt();
                }
            }
            LiveEvent::Closed => {
                self.state = SessionState::Closed;
                info!(session_epoch = self.epoch, "Remote closed the live session");
                self.stop();
            }
            LiveEvent::Errored(reason) => {
                self.fail(LiveError::from_remote_message(reason));
            }
        }
    }

    /// One microphone tick. Only forwarded while Active.
    pub fn on_capture_tick(&mut self, samples: &[f32]) -> bool {
        if self.state != SessionState::Active {
            return false;
        }
        match self.handle.as_mut() {
            Some(handle) => handle.capture.process_tick(samples, Some(&mut handle.link)),
            None => false,
        }
    }

    /// Natural completion of a playback buffer.
    pub fn on_buffer_ended(&mut self, id: BufferId) -> bool {
        self.handle
            .as_mut()
            .map_or(false, |handle| handle.playback.on_buffer_ended(id))
    }

    /// Tear everything down and return to Idle. Safe in any state, any number
    /// of times; release failures are swallowed.
    pub fn stop(&mut self) {
        let previous = self.state;
        self.epoch += 1;
        self.early_open = false;

        if let Some(mut handle) = self.handle.take() {
            handle.link.close();
            let stopped = handle.playback.stop_all();
            debug!(stopped, "Released live session audio");
        }

        self.state = SessionState::Idle;
        if previous != SessionState::Idle {
            info!(from = previous.as_str(), "Live session stopped");
        }
    }

    fn fail(&mut self, err: LiveError) {
        warn!(session_epoch = self.epoch, code = err.code(), "Live session failed: {}", err);
        self.state = SessionState::Errored;
        self.last_error = Some(err);
        self.stop();
    }
}
