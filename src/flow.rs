//! # Join-and-open-channel flow
//!
//! ## Responsibility
//! Resolve the local identity, exchange it for a channel token, open the
//! channel with that token, and then pump channel events into the renderer
//! until the channel closes or fails.
//!
//! ## States
//! ```text
//! Idle ──RequestToken──▶ TokenRequested ──TokenReceived──▶ ChannelOpening ──ChannelOpened──▶ ChannelOpen
//!   │                          │                                 │                              │
//!   └─IdentityUnresolved─┐     ├─JoinFailed / Aborted─┐          ├─Aborted──────┐               │
//!                        ▼     ▼                      ▼          ▼              ▼               │
//!                                  Failed  ◀──ChannelErrored── (any live state)                 │
//!                                  Closed  ◀──ChannelClosed── ChannelOpening / ChannelOpen ◀────┘
//! ```
//!
//! ## Guarantees
//! - Nothing is retried; every failure ends in `Failed` and is returned to the caller.
//! - Malformed inbound messages are reported and dropped without a state change.
//! - A flow runs at most once.
//!
//! ## NOT Responsible For
//! - Reconnecting after `close` or `error`.
//! - Deciding backoff policy for a failed join.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::api::{JoinRequest, JoinResponse, JoinService};
use crate::channel::{parse_message, ChannelConnection, ChannelEvent, ChannelOpener, ChannelSender};
use crate::error::WidgetError;
use crate::host::{FlowObserver, NoopObserver, ParticipantRoster, Renderer};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Where the join flow currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
    Idle,
    TokenRequested,
    ChannelOpening,
    ChannelOpen,
    /// The channel closed; it can no longer be used for sending.
    Closed,
    Failed,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Closed | FlowState::Failed)
    }

    /// Next state for `event`, or `None` when the event does not apply here.
    pub fn transition(self, event: FlowEvent) -> Option<FlowState> {
        use FlowEvent as E;
        use FlowState as S;
        match (self, event) {
            (S::Idle, E::RequestToken) => Some(S::TokenRequested),
            (S::Idle, E::IdentityUnresolved) => Some(S::Failed),
            (S::TokenRequested, E::TokenReceived) => Some(S::ChannelOpening),
            (S::TokenRequested, E::JoinFailed) => Some(S::Failed),
            (S::ChannelOpening, E::ChannelOpened) => Some(S::ChannelOpen),
            (S::TokenRequested | S::ChannelOpening, E::Aborted) => Some(S::Failed),
            (S::ChannelOpening | S::ChannelOpen, E::ChannelClosed) => Some(S::Closed),
            (s, E::ChannelErrored) if !s.is_terminal() => Some(S::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlowState::Idle           => "idle",
            FlowState::TokenRequested => "token_requested",
            FlowState::ChannelOpening => "channel_opening",
            FlowState::ChannelOpen    => "channel_open",
            FlowState::Closed         => "closed",
            FlowState::Failed         => "failed",
        };
        write!(f, "{s}")
    }
}

/// Inputs that drive [`FlowState::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    RequestToken,
    IdentityUnresolved,
    TokenReceived,
    JoinFailed,
    ChannelOpened,
    ChannelErrored,
    ChannelClosed,
    /// Cancelled through the handle, or a stage timed out.
    Aborted,
}

// ---------------------------------------------------------------------------
// Settings and shared state
// ---------------------------------------------------------------------------

/// Optional limits on the waiting stages. `None` waits indefinitely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowSettings {
    pub join_timeout: Option<Duration>,
    pub open_timeout: Option<Duration>,
}

struct FlowShared {
    state: watch::Sender<FlowState>,
    cancel: watch::Sender<bool>,
    sender: Mutex<Option<ChannelSender>>,
    joined: Mutex<Option<(JoinRequest, JoinResponse)>>,
}

/// Cloneable handle for observing, cancelling and sending on a running flow.
#[derive(Clone)]
pub struct FlowHandle {
    shared: Arc<FlowShared>,
}

impl FlowHandle {
    pub fn state(&self) -> FlowState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FlowState> {
        self.shared.state.subscribe()
    }

    /// Wait until the flow reaches `target` or a terminal state; returns the state reached.
    pub async fn wait_for(&self, target: FlowState) -> FlowState {
        let mut rx = self.subscribe();
        rx.wait_for(|s| *s == target || s.is_terminal())
            .await
            .map(|s| *s)
            .unwrap_or(FlowState::Failed)
    }

    /// Abort a pending token request or channel wait. Once the channel is
    /// open this closes it locally instead.
    pub fn cancel(&self) {
        self.shared.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shared.cancel.borrow()
    }

    /// Send text over the open channel.
    ///
    /// # Errors
    /// [`WidgetError::ChannelClosed`] unless the channel is currently open.
    pub fn send(&self, text: impl Into<String>) -> Result<(), WidgetError> {
        let sender = self
            .shared
            .sender
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(WidgetError::ChannelClosed)?;
        sender.send(text)
    }

    /// The request sent and the reply received, once a token was issued.
    pub fn joined(&self) -> Option<(JoinRequest, JoinResponse)> {
        self.shared.joined.lock().ok()?.clone()
    }
}

impl std::fmt::Debug for FlowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHandle")
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// JoinFlow
// ---------------------------------------------------------------------------

/// Runs the join-and-open-channel sequence once.
pub struct JoinFlow<J, C> {
    join: J,
    opener: C,
    roster: Arc<dyn ParticipantRoster>,
    renderer: Arc<dyn Renderer>,
    observer: Arc<dyn FlowObserver>,
    settings: FlowSettings,
    shared: Arc<FlowShared>,
}

impl<J: JoinService, C: ChannelOpener> JoinFlow<J, C> {
    pub fn new(
        join: J,
        opener: C,
        roster: Arc<dyn ParticipantRoster>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        let (state, _) = watch::channel(FlowState::Idle);
        let (cancel, _) = watch::channel(false);
        Self {
            join,
            opener,
            roster,
            renderer,
            observer: Arc::new(NoopObserver),
            settings: FlowSettings::default(),
            shared: Arc::new(FlowShared {
                state,
                cancel,
                sender: Mutex::new(None),
                joined: Mutex::new(None),
            }),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn FlowObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_settings(mut self, settings: FlowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn handle(&self) -> FlowHandle {
        FlowHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> FlowState {
        *self.shared.state.borrow()
    }

    /// Run the flow to completion.
    ///
    /// Returns `Ok(())` when the channel closes normally and the error that
    /// moved the flow to `Failed` otherwise. Calls after the first return
    /// immediately with `Ok(())`.
    pub async fn run(&self) -> Result<(), WidgetError> {
        if self.state() != FlowState::Idle {
            warn!(state = %self.state(), "join flow already started");
            return Ok(());
        }

        let request: JoinRequest = match self.roster.resolve_identity() {
            Ok(identity) => identity.into(),
            Err(e) => return Err(self.fail(FlowEvent::IdentityUnresolved, e)),
        };

        self.apply(FlowEvent::RequestToken);
        info!(session = %request.session_id, "requesting channel token");
        let response = match self
            .guarded("token request", self.settings.join_timeout, self.join.join(&request))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.fail(FlowEvent::JoinFailed, e)),
            Err(e) => return Err(self.fail(FlowEvent::Aborted, e)),
        };

        let token = response.channel_token.clone();
        if let Ok(mut joined) = self.shared.joined.lock() {
            *joined = Some((request, response));
        }
        self.apply(FlowEvent::TokenReceived);
        debug!(token_len = token.as_str().len(), "opening channel");

        let connection = match self.opener.open(&token) {
            Ok(connection) => connection,
            Err(e) => return Err(self.fail(FlowEvent::ChannelErrored, e)),
        };
        self.pump(connection).await
    }

    async fn pump(&self, mut connection: ChannelConnection) -> Result<(), WidgetError> {
        let sender = connection.sender();
        if let Ok(mut slot) = self.shared.sender.lock() {
            *slot = Some(sender.clone());
        }
        let open_deadline = self.settings.open_timeout.map(|d| (Instant::now() + d, d));

        loop {
            let opening = self.state() == FlowState::ChannelOpening;
            let limit = match open_deadline {
                Some((deadline, _)) if opening => {
                    Some(deadline.saturating_duration_since(Instant::now()))
                }
                _ => None,
            };
            let stage = if opening { "channel open" } else { "channel" };

            let event = match self.guarded(stage, limit, connection.next_event()).await {
                Ok(event) => event,
                Err(e) if opening => {
                    sender.set_open(false);
                    // Report the configured limit, not the remaining slice.
                    let e = match (e, open_deadline) {
                        (WidgetError::Timeout { stage, .. }, Some((_, after))) => {
                            WidgetError::Timeout { stage, after }
                        }
                        (e, _) => e,
                    };
                    return Err(self.fail(FlowEvent::Aborted, e));
                }
                Err(_) => {
                    info!("channel closed locally");
                    self.close(&sender);
                    return Ok(());
                }
            };

            match event {
                Some(ChannelEvent::Open) => {
                    if self.apply(FlowEvent::ChannelOpened) {
                        sender.set_open(true);
                        info!("channel open");
                        self.observer.connected();
                    }
                }
                Some(ChannelEvent::Message(payload)) => self.deliver(&payload),
                Some(ChannelEvent::Error(detail)) => {
                    sender.set_open(false);
                    return Err(self.fail(FlowEvent::ChannelErrored, WidgetError::Channel { detail }));
                }
                Some(ChannelEvent::Close) | None => {
                    info!("channel closed");
                    self.close(&sender);
                    return Ok(());
                }
            }
        }
    }

    fn deliver(&self, payload: &str) {
        match parse_message(payload) {
            Ok(message) => self.renderer.show_message(&message.content),
            Err(e) => {
                warn!(error = %e, state = %self.state(), "discarding channel message");
                self.observer.message_discarded(&e);
            }
        }
    }

    fn close(&self, sender: &ChannelSender) {
        sender.set_open(false);
        self.apply(FlowEvent::ChannelClosed);
        self.observer.closed();
    }

    /// Apply `event`; returns whether it caused a transition.
    fn apply(&self, event: FlowEvent) -> bool {
        let current = self.state();
        match current.transition(event) {
            Some(next) => {
                self.shared.state.send_replace(next);
                debug!(from = %current, to = %next, ?event, "flow transition");
                self.observer.state_changed(next);
                true
            }
            None => {
                debug!(state = %current, ?event, "event has no transition here");
                false
            }
        }
    }

    fn fail(&self, event: FlowEvent, err: WidgetError) -> WidgetError {
        if !self.apply(event) && !self.state().is_terminal() {
            self.apply(FlowEvent::ChannelErrored);
        }
        error!(error = %err, "join flow failed");
        self.observer.failed(&err);
        err
    }

    /// Await `work`, giving up on cancellation or when `limit` elapses.
    async fn guarded<T>(
        &self,
        stage: &'static str,
        limit: Option<Duration>,
        work: impl Future<Output = T>,
    ) -> Result<T, WidgetError> {
        let cancel = self.shared.cancel.subscribe();
        if *cancel.borrow() {
            return Err(WidgetError::Cancelled { stage });
        }
        let bounded = async {
            match limit {
                Some(after) => tokio::time::timeout(after, work)
                    .await
                    .map_err(|_| WidgetError::Timeout { stage, after }),
                None => Ok(work.await),
            }
        };
        tokio::select! {
            res = bounded => res,
            _ = cancelled(cancel) => Err(WidgetError::Cancelled { stage }),
        }
    }
}

async fn cancelled(mut rx: watch::Receiver<bool>) {
    // The sender lives in the flow; an error here only means teardown.
    let _ = rx.wait_for(|c| *c).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
