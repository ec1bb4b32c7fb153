//! Failure taxonomy for the live voice core.
//!
//! Nothing in the live core retries. Every failure either tears the session
//! down to `Idle` or is reported back to the browser as a status message;
//! decode failures are skipped and the session keeps going.

use std::fmt;

/// Substring the remote model puts in its error message when the API key is
/// rejected. Matched case-insensitively.
pub const AUTHORIZATION_MARKER: &str = "entity was not found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveError {
    /// The user declined microphone access. Surfaced, never retried.
    PermissionDenied(String),

    /// No capture hardware is present.
    DeviceUnavailable(String),

    /// The remote rejected the credential. The UI must let the user pick another key.
    AuthorizationFailure(String),

    /// Generic network or remote error.
    TransportFailure(String),

    /// Malformed or missing inline audio payload.
    DecodeFailure(String),

    /// `start()` while a session already exists.
    InvalidState(String),
}

impl LiveError {
    /// Classify an error message coming back from the remote model.
    pub fn from_remote_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_authorization_message(&message) {
            LiveError::AuthorizationFailure(message)
        } else {
            LiveError::TransportFailure(message)
        }
    }

    /// Machine-readable code sent to the browser.
    pub fn code(&self) -> &'static str {
        match self {
            LiveError::PermissionDenied(_) => "permission_denied",
            LiveError::DeviceUnavailable(_) => "device_unavailable",
            LiveError::AuthorizationFailure(_) => "authorization_failure",
            LiveError::TransportFailure(_) => "transport_failure",
            LiveError::DecodeFailure(_) => "decode_failure",
            LiveError::InvalidState(_) => "invalid_state",
        }
    }

    /// Text shown to the user in the conversation.
    pub fn user_message(&self) -> &'static str {
        match self {
            LiveError::PermissionDenied(_) => "Microphone access was denied. Allow it in the browser to talk live.",
            LiveError::DeviceUnavailable(_) => "No microphone was found on this device.",
            LiveError::AuthorizationFailure(_) => "The API key was rejected. Please select a different key.",
            LiveError::TransportFailure(_) => "Connection interrupted. Check your network and try again.",
            LiveError::DecodeFailure(_) => "Some audio from the assistant could not be played.",
            LiveError::InvalidState(_) => "A live session is already running.",
        }
    }
}

impl fmt::Display for LiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiveError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            LiveError::DeviceUnavailable(msg) => write!(f, "Device unavailable: {}", msg),
            LiveError::AuthorizationFailure(msg) => write!(f, "Authorization failure: {}", msg),
            LiveError::TransportFailure(msg) => write!(f, "Transport failure: {}", msg),
            LiveError::DecodeFailure(msg) => write!(f, "Decode failure: {}", msg),
            LiveError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for LiveError {}

pub fn is_authorization_message(message: &str) -> bool {
    message.to_lowercase().contains(AUTHORIZATION_MARKER)
}
