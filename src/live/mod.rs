//! # Live Session Module
//!
//! Lifecycle of one realtime voice conversation: connecting to the remote
//! endpoint, forwarding capture ticks, scheduling the model's speech and
//! tearing everything down again.

pub mod error;
pub mod events;
pub mod gemini;
pub mod manager;

pub use error::LiveError;
pub use events::{event_channel, EventReceiver, TaggedEvent};
pub use manager::{LiveSessionManager, SessionState};
