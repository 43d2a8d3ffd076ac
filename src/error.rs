//! Crate-level error type.
//!
//! Every fallible operation in the library returns [`WidgetError`]. Join and
//! channel failures are fatal to the join flow; [`WidgetError::InvalidMessagePayload`]
//! is the only variant the flow recovers from locally.

use std::time::Duration;

/// Errors raised while joining a session, talking to the game API, or
/// driving the messaging channel.
#[derive(Debug, thiserror::Error)]
pub enum WidgetError {
    /// The local participant (or the session) could not be resolved from the
    /// roster, so no join request was sent.
    #[error("cannot resolve local identity: {reason}")]
    IdentityResolution { reason: String },

    /// The join request failed at the transport level or returned a body
    /// that does not carry a channel token.
    #[error("join request to {url} failed: {detail}")]
    JoinRequest { url: String, detail: String },

    /// The join service replied with a non-2xx HTTP status.
    #[error("join request to {url} returned HTTP {status}")]
    JoinStatus { url: String, status: u16 },

    /// A game API endpoint failed or answered with `{"status": "ERROR"}`.
    #[error("{endpoint} failed: {message}")]
    Api { endpoint: String, message: String },

    /// The messaging channel reported an error event.
    #[error("channel error: {detail}")]
    Channel { detail: String },

    /// An inbound channel message could not be decoded.
    #[error("invalid message payload: {detail}")]
    InvalidMessagePayload { detail: String },

    /// Tried to send on a channel that is not open.
    #[error("channel is not open for sending")]
    ChannelClosed,

    /// A stage of the join flow did not complete in time.
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    /// The join flow was cancelled through its handle.
    #[error("{stage} cancelled")]
    Cancelled { stage: &'static str },

    /// No tokio runtime was available to drive the join flow.
    #[error("no async runtime: {detail}")]
    Runtime { detail: String },

    /// Configuration could not be read or parsed.
    #[error("config error: {detail}")]
    Config { detail: String },
}

impl WidgetError {
    /// True for the failures the join service itself can cause.
    pub fn is_join_failure(&self) -> bool {
        matches!(
            self,
            WidgetError::JoinRequest { .. } | WidgetError::JoinStatus { .. }
        )
    }

    pub(crate) fn invalid_payload(detail: impl Into<String>) -> Self {
        WidgetError::InvalidMessagePayload {
            detail: detail.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
