//! Messaging channel: lifecycle events, payload decoding, WebSocket transport.
//!
//! ## Design
//! - A channel is opened synchronously from a [`ChannelToken`] and hands back
//!   a [`ChannelConnection`]: an unbounded stream of [`ChannelEvent`]s plus a
//!   [`ChannelSender`] for outbound text.
//! - The transport side is a [`ChannelPeer`]. [`WsChannelOpener`] drives one
//!   from a background tokio task; tests and in-process hosts drive one by hand.
//! - Delivery is best effort. Nothing is retried or buffered beyond the
//!   unbounded queues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::error::WidgetError;
use crate::mirror::ChannelToken;

/// Lifecycle and data events delivered by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Error(String),
    Close,
}

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

/// Decoded inbound message. `content` is the text shown to the player; any
/// other fields the server sent are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundMessage {
    pub content: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Decode a channel payload.
///
/// # Errors
/// [`WidgetError::InvalidMessagePayload`] when the payload is not JSON, is not
/// an object, or has no string `content` field.
pub fn parse_message(payload: &str) -> Result<InboundMessage, WidgetError> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| WidgetError::invalid_payload(format!("not JSON: {e}")))?;
    match value.get("content") {
        Some(serde_json::Value::String(_)) => {}
        Some(_) => return Err(WidgetError::invalid_payload("field `content` is not a string")),
        None => return Err(WidgetError::invalid_payload("missing field `content`")),
    }
    serde_json::from_value(value).map_err(|e| WidgetError::invalid_payload(e.to_string()))
}

// ---------------------------------------------------------------------------
// Connection / peer halves
// ---------------------------------------------------------------------------

/// Outbound half of a connection. Cloneable; every clone shares the open flag.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
}

impl ChannelSender {
    /// Queue `text` for the remote end.
    ///
    /// # Errors
    /// [`WidgetError::ChannelClosed`] before `open`, after `close`/`error`, or
    /// once the transport has gone away.
    pub fn send(&self, text: impl Into<String>) -> Result<(), WidgetError> {
        if !self.is_open() {
            return Err(WidgetError::ChannelClosed);
        }
        self.tx
            .send(text.into())
            .map_err(|_| WidgetError::ChannelClosed)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }
}

/// Client half of an opened channel.
#[derive(Debug)]
pub struct ChannelConnection {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    sender: ChannelSender,
}

impl ChannelConnection {
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// Next event, or `None` once the transport side is gone.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<ChannelEvent>, ChannelSender) {
        (self.events, self.sender)
    }
}

/// Transport half of a channel: emits events, receives outbound text.
#[derive(Debug)]
pub struct ChannelPeer {
    events: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl ChannelPeer {
    pub fn open(&self) {
        self.emit(ChannelEvent::Open);
    }

    pub fn message(&self, payload: impl Into<String>) {
        self.emit(ChannelEvent::Message(payload.into()));
    }

    pub fn error(&self, detail: impl Into<String>) {
        self.emit(ChannelEvent::Error(detail.into()));
    }

    pub fn close(&self) {
        self.emit(ChannelEvent::Close);
    }

    /// Next text the client sent, or `None` once every sender is dropped.
    pub async fn recv_outbound(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    fn emit(&self, event: ChannelEvent) {
        // The client may already have stopped listening; that is not an error here.
        let _ = self.events.send(event);
    }
}

/// Create a connected (client, transport) pair.
pub fn channel_pair() -> (ChannelConnection, ChannelPeer) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let connection = ChannelConnection {
        events: event_rx,
        sender: ChannelSender {
            tx: out_tx,
            open: Arc::new(AtomicBool::new(false)),
        },
    };
    let peer = ChannelPeer {
        events: event_tx,
        outbound: out_rx,
    };
    (connection, peer)
}

// ---------------------------------------------------------------------------
// Openers
// ---------------------------------------------------------------------------

/// Opens a messaging channel for a token.
pub trait ChannelOpener: Send + Sync {
    fn open(&self, token: &ChannelToken) -> Result<ChannelConnection, WidgetError>;
}

/// WebSocket channel transport.
///
/// Connects to `{base_url}?token=<token>` from a background task, so `open`
/// must be called inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct WsChannelOpener {
    base_url: String,
}

impl WsChannelOpener {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// The URL a token connects to.
    pub fn url_for(&self, token: &ChannelToken) -> Result<String, WidgetError> {
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| WidgetError::Channel {
            detail: format!("bad channel url {}: {e}", self.base_url),
        })?;
        url.query_pairs_mut().append_pair("token", token.as_str());
        Ok(url.into())
    }
}

impl ChannelOpener for WsChannelOpener {
    fn open(&self, token: &ChannelToken) -> Result<ChannelConnection, WidgetError> {
        let url = self.url_for(token)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| WidgetError::Channel {
            detail: format!("no async runtime to drive the channel: {e}"),
        })?;
        let (connection, peer) = channel_pair();
        runtime.spawn(run_ws_transport(url, peer));
        Ok(connection)
    }
}

/// Pump frames between a WebSocket and a [`ChannelPeer`] until either side ends.
async fn run_ws_transport(url: String, mut peer: ChannelPeer) {
    let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(error = %e, "channel connect failed");
            peer.error(e.to_string());
            return;
        }
    };
    debug!("channel socket connected");
    peer.open();

    let (mut ws_sink, mut ws_stream) = ws.split();
    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => peer.message(text),
                    Some(Ok(WsMessage::Close(_))) | None => {
                        peer.close();
                        break;
                    }
                    Some(Ok(_)) => {} // Ignore binary / ping / pong frames
                    Some(Err(e)) => {
                        peer.error(e.to_string());
                        break;
                    }
                }
            }

            outbound = peer.recv_outbound() => {
                match outbound {
                    Some(text) => {
                        if let Err(e) = ws_sink.send(WsMessage::Text(text)).await {
                            peer.error(e.to_string());
                            break;
                        }
                    }
                    // Client dropped the connection.
                    None => {
                        let _ = ws_sink.close().await;
                        break;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_message_extracts_content() {
        let msg = parse_message(r#"{"content":"Bob played King of Snark"}"#).unwrap();
        assert_eq!(msg.content, "Bob played King of Snark");
        assert!(msg.extra.is_empty());
    }

    #[test]
    fn parse_message_keeps_extra_fields() {
        let msg = parse_message(r#"{"content":"x","round":2,"player":"plus-1"}"#).unwrap();
        assert_eq!(msg.extra["round"], 2);
        assert_eq!(msg.extra["player"], "plus-1");
    }

    #[test]
    fn parse_message_rejects_non_json() {
        let err = parse_message("not-json").unwrap_err();
        assert!(matches!(err, WidgetError::InvalidMessagePayload { .. }));
    }

    #[test]
    fn parse_message_rejects_missing_content() {
        let err = parse_message(r#"{"selected_card": 4, "player": "plus-1"}"#).unwrap_err();
        assert!(err.to_string().contains("content"), "got {err}");
    }

    #[test]
    fn parse_message_rejects_non_string_content() {
        assert!(parse_message(r#"{"content": 5}"#).is_err());
    }

    #[test]
    fn parse_message_rejects_json_array() {
        assert!(parse_message(r#"["content"]"#).is_err());
    }

    #[tokio::test]
    async fn pair_delivers_events_in_order() {
        let (mut conn, peer) = channel_pair();
        peer.open();
        peer.message("hi");
        peer.close();
        assert_eq!(conn.next_event().await, Some(ChannelEvent::Open));
        assert_eq!(conn.next_event().await, Some(ChannelEvent::Message("hi".into())));
        assert_eq!(conn.next_event().await, Some(ChannelEvent::Close));
        drop(peer);
        assert_eq!(conn.next_event().await, None);
    }

    #[tokio::test]
    async fn sender_requires_open_flag() {
        let (conn, mut peer) = channel_pair();
        let sender = conn.sender();
        assert!(matches!(sender.send("early"), Err(WidgetError::ChannelClosed)));

        sender.set_open(true);
        sender.send("hello").unwrap();
        assert_eq!(peer.recv_outbound().await.as_deref(), Some("hello"));

        sender.set_open(false);
        assert!(matches!(sender.send("late"), Err(WidgetError::ChannelClosed)));
    }

    #[test]
    fn sender_fails_when_transport_gone() {
        let (conn, peer) = channel_pair();
        let sender = conn.sender();
        sender.set_open(true);
        drop(peer);
        assert!(matches!(sender.send("x"), Err(WidgetError::ChannelClosed)));
    }

    #[test]
    fn ws_url_carries_token_query() {
        let opener = WsChannelOpener::new("ws://localhost:8080/channel");
        let url = opener.url_for(&ChannelToken::new("abc 123")).unwrap();
        assert_eq!(url, "ws://localhost:8080/channel?token=abc+123");
    }

    #[test]
    fn ws_bad_base_url_is_channel_error() {
        let opener = WsChannelOpener::new("not a url");
        assert!(matches!(
            opener.url_for(&ChannelToken::new("t")),
            Err(WidgetError::Channel { .. })
        ));
    }

    #[test]
    fn ws_open_outside_runtime_is_channel_error() {
        let opener = WsChannelOpener::new("ws://localhost:1/channel");
        assert!(matches!(
            opener.open(&ChannelToken::new("t")),
            Err(WidgetError::Channel { .. })
        ));
    }
}
