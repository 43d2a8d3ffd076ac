//! Test doubles shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hangout_cards::api::{JoinRequest, JoinResponse, JoinService};
use hangout_cards::channel::{channel_pair, ChannelConnection, ChannelOpener, ChannelPeer};
use hangout_cards::error::WidgetError;
use hangout_cards::flow::FlowState;
use hangout_cards::host::{FlowObserver, Renderer};
use hangout_cards::memory_host::MemoryHost;
use hangout_cards::mirror::{ChannelToken, LocalMirror};

/// How [`ScriptedJoin`] answers.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Token(&'static str),
    Status(u16),
    /// Never answers.
    Hang,
}

#[derive(Clone)]
pub struct ScriptedJoin {
    reply: Reply,
    pub calls: Arc<Mutex<Vec<JoinRequest>>>,
}

impl ScriptedJoin {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl JoinService for ScriptedJoin {
    async fn join(&self, request: &JoinRequest) -> Result<JoinResponse, WidgetError> {
        self.calls.lock().unwrap().push(request.clone());
        match self.reply {
            Reply::Token(token) => Ok(JoinResponse::with_token(token)),
            Reply::Status(status) => Err(WidgetError::JoinStatus {
                url: "http://test/api/join_game".to_string(),
                status,
            }),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Opens in-process channels and keeps the transport half for the test.
#[derive(Clone, Default)]
pub struct PeerOpener {
    tokens: Arc<Mutex<Vec<String>>>,
    peer: Arc<Mutex<Option<ChannelPeer>>>,
}

impl PeerOpener {
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn take_peer(&self) -> ChannelPeer {
        self.peer.lock().unwrap().take().expect("channel was opened")
    }
}

impl ChannelOpener for PeerOpener {
    fn open(&self, token: &ChannelToken) -> Result<ChannelConnection, WidgetError> {
        self.tokens.lock().unwrap().push(token.as_str().to_string());
        let (connection, peer) = channel_pair();
        *self.peer.lock().unwrap() = Some(peer);
        Ok(connection)
    }
}

#[derive(Default)]
pub struct RecordingRenderer {
    pub renders: AtomicUsize,
    pub last: Mutex<Option<LocalMirror>>,
    pub messages: Mutex<Vec<String>>,
}

impl RecordingRenderer {
    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl Renderer for RecordingRenderer {
    fn render(&self, mirror: &LocalMirror) {
        self.renders.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(mirror.clone());
    }

    fn show_message(&self, content: &str) {
        self.messages.lock().unwrap().push(content.to_string());
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub states: Mutex<Vec<FlowState>>,
    pub discarded: AtomicUsize,
    pub failures: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn states(&self) -> Vec<FlowState> {
        self.states.lock().unwrap().clone()
    }
}

impl FlowObserver for RecordingObserver {
    fn state_changed(&self, state: FlowState) {
        self.states.lock().unwrap().push(state);
    }

    fn failed(&self, error: &WidgetError) {
        self.failures.lock().unwrap().push(error.to_string());
    }

    fn message_discarded(&self, _error: &WidgetError) {
        self.discarded.fetch_add(1, Ordering::SeqCst);
    }
}

/// A host for `hangout-1` where the local player is person `plus-1` ("Bob").
pub fn host_with_local_player() -> MemoryHost {
    let host = MemoryHost::new("hangout-1");
    let me = host.add_person("plus-1", "Bob");
    host.set_local_participant(&me.id);
    host
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
