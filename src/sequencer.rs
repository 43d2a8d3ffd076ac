//! # Bootstrap sequencer
//!
//! ## Responsibility
//! On the first environment-ready signal: register the state and roster
//! listeners, replay whatever the host already holds into the [`LocalMirror`],
//! start the join flow, and deregister the ready listener.
//!
//! ## Guarantees
//! - Listeners are registered before the initial snapshot is read, so a
//!   change racing the replay is delivered rather than lost.
//! - The initial replay happens at most once, and only for mirror fields that
//!   are still empty.
//! - State and roster notifications are applied in delivery order, each as a
//!   single locked mutation followed by a render.
//!
//! ## NOT Responsible For
//! - Merging deltas: each state notification replaces the snapshot.
//! - Retrying a failed join (the error is returned from the join task).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::JoinService;
use crate::channel::ChannelOpener;
use crate::error::WidgetError;
use crate::flow::{FlowHandle, FlowSettings, JoinFlow};
use crate::host::{
    FlowObserver, NoopObserver, ParticipantRoster, ReadySignal, Renderer, SharedStateStore,
    Subscription,
};
use crate::mirror::{LocalMirror, Participant, StateChange, StateDelta};

/// Spawned join flow; resolves when the channel closes or the flow fails.
pub type JoinTask = JoinHandle<Result<(), WidgetError>>;

/// Owns the local mirror and wires host notifications and the join flow to it.
///
/// Construct with [`BootstrapSequencer::builder`]; the sequencer is always
/// shared behind an `Arc` because host listeners hold weak references to it.
pub struct BootstrapSequencer<J, C> {
    store: Arc<dyn SharedStateStore>,
    roster: Arc<dyn ParticipantRoster>,
    renderer: Arc<dyn Renderer>,
    observer: Arc<dyn FlowObserver>,
    mirror: Mutex<LocalMirror>,
    flow: Arc<JoinFlow<J, C>>,
    started: AtomicBool,
    listeners: Mutex<Vec<Subscription>>,
    ready_subscription: OnceCell<Subscription>,
    join_task: Mutex<Option<JoinTask>>,
}

impl<J, C> BootstrapSequencer<J, C>
where
    J: JoinService + 'static,
    C: ChannelOpener + 'static,
{
    pub fn builder() -> BootstrapSequencerBuilder<J, C> {
        BootstrapSequencerBuilder::new()
    }

    /// Register for the host's ready signal. The listener removes itself
    /// after its first run.
    pub fn attach(self: &Arc<Self>, ready: &dyn ReadySignal) {
        let weak = Arc::downgrade(self);
        let subscription = ready.add_ready_listener(Arc::new(move || {
            if let Some(sequencer) = weak.upgrade() {
                sequencer.on_environment_ready();
            }
        }));
        if self.ready_subscription.set(subscription.clone()).is_err() {
            warn!("sequencer already attached to a ready signal");
            subscription.cancel();
            return;
        }
        // The host may have fired synchronously while we registered.
        if self.started.load(Ordering::Acquire) {
            subscription.cancel();
        }
    }

    /// Run the bootstrap sequence. Returns `false` (and does nothing) on
    /// every call after the first.
    ///
    /// The join flow is spawned on the current tokio runtime. Without one it
    /// stays `Idle` and [`WidgetError::Runtime`] goes to the observer.
    pub fn on_environment_ready(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("ignoring repeated ready signal");
            return false;
        }
        info!(session = ?self.roster.session_id(), "environment ready");

        self.register_listeners();
        self.replay_state();
        self.replay_participants();
        self.start_join();

        if let Some(subscription) = self.ready_subscription.get() {
            subscription.cancel();
        }
        true
    }

    /// Apply a state notification and re-render.
    pub fn on_state_changed(&self, change: StateChange) {
        let Ok(mut mirror) = self.mirror.lock() else {
            error!("mirror lock poisoned; dropping state change");
            return;
        };
        debug!(
            added = change.delta.added.len(),
            removed = change.delta.removed.len(),
            keys = change.state.len(),
            "state changed"
        );
        mirror.apply_state_change(change);
        self.renderer.render(&mirror);
    }

    /// Apply a roster notification and re-render.
    pub fn on_participants_changed(&self, participants: Vec<Participant>) {
        let Ok(mut mirror) = self.mirror.lock() else {
            error!("mirror lock poisoned; dropping roster change");
            return;
        };
        debug!(count = participants.len(), "participants changed");
        mirror.apply_participants(participants);
        self.renderer.render(&mirror);
    }

    /// Read the mirror under its lock.
    pub fn with_mirror<R>(&self, f: impl FnOnce(&LocalMirror) -> R) -> Option<R> {
        self.mirror.lock().ok().map(|mirror| f(&*mirror))
    }

    /// A copy of the current mirror.
    pub fn snapshot(&self) -> LocalMirror {
        self.with_mirror(LocalMirror::clone).unwrap_or_default()
    }

    pub fn flow(&self) -> FlowHandle {
        self.flow.handle()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Take the spawned join task, if the flow was started and not yet taken.
    pub fn take_join_task(&self) -> Option<JoinTask> {
        self.join_task.lock().ok()?.take()
    }

    /// Deregister every host listener and cancel the join flow.
    pub fn detach(&self) {
        if let Some(subscription) = self.ready_subscription.get() {
            subscription.cancel();
        }
        if let Ok(mut listeners) = self.listeners.lock() {
            for subscription in listeners.drain(..) {
                subscription.cancel();
            }
        }
        self.flow.handle().cancel();
    }

    fn register_listeners(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let state = self.store.add_state_change_listener(Arc::new(move |change: StateChange| {
            if let Some(sequencer) = weak.upgrade() {
                sequencer.on_state_changed(change);
            }
        }));
        let weak = Arc::downgrade(self);
        let roster = self.roster.add_participants_listener(Arc::new(move |participants: Vec<Participant>| {
            if let Some(sequencer) = weak.upgrade() {
                sequencer.on_participants_changed(participants);
            }
        }));
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(state);
            listeners.push(roster);
        }
    }

    /// Seed the mirror from the store unless a notification already did.
    fn replay_state(&self) {
        let Ok(mut mirror) = self.mirror.lock() else {
            return;
        };
        if mirror.has_state() {
            debug!("state already observed; skipping replay");
            return;
        }
        // The host may have no state yet; that replays as empty.
        let state = self.store.state().unwrap_or_default();
        let metadata = self.store.state_metadata().unwrap_or_default();
        let change = StateChange {
            delta: StateDelta::replay_of(&metadata),
            state,
            metadata,
        };
        debug!(keys = change.state.len(), "replaying initial state");
        mirror.apply_state_change(change);
        self.renderer.render(&mirror);
    }

    fn replay_participants(&self) {
        let Ok(mut mirror) = self.mirror.lock() else {
            return;
        };
        if mirror.has_participants() {
            return;
        }
        if let Some(participants) = self.roster.participants() {
            debug!(count = participants.len(), "replaying initial roster");
            mirror.apply_participants(participants);
            self.renderer.render(&mirror);
        }
    }

    fn start_join(&self) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                let err = WidgetError::Runtime {
                    detail: e.to_string(),
                };
                error!(error = %err, "join flow not started");
                self.observer.failed(&err);
                return;
            }
        };
        let flow = Arc::clone(&self.flow);
        let task = runtime.spawn(async move { flow.run().await });
        if let Ok(mut slot) = self.join_task.lock() {
            *slot = Some(task);
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`BootstrapSequencer`].
///
/// # Example
/// ```rust,ignore
/// let host = MemoryHost::new("hangout-1");
/// let sequencer = BootstrapSequencer::builder()
///     .store(Arc::new(host.clone()))
///     .roster(Arc::new(host.clone()))
///     .renderer(renderer)
///     .join_service(GameApiClient::builder("http://127.0.0.1:8080").build())
///     .channel_opener(WsChannelOpener::new("ws://127.0.0.1:8080/channel"))
///     .build()
///     .expect("all collaborators set");
/// sequencer.attach(&host);
/// ```
pub struct BootstrapSequencerBuilder<J, C> {
    store: Option<Arc<dyn SharedStateStore>>,
    roster: Option<Arc<dyn ParticipantRoster>>,
    renderer: Option<Arc<dyn Renderer>>,
    observer: Option<Arc<dyn FlowObserver>>,
    join: Option<J>,
    opener: Option<C>,
    settings: FlowSettings,
}

impl<J, C> BootstrapSequencerBuilder<J, C>
where
    J: JoinService + 'static,
    C: ChannelOpener + 'static,
{
    pub fn new() -> Self {
        Self {
            store: None,
            roster: None,
            renderer: None,
            observer: None,
            join: None,
            opener: None,
            settings: FlowSettings::default(),
        }
    }

    pub fn store(mut self, store: Arc<dyn SharedStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn roster(mut self, roster: Arc<dyn ParticipantRoster>) -> Self {
        self.roster = Some(roster);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Optional; defaults to [`NoopObserver`].
    pub fn observer(mut self, observer: Arc<dyn FlowObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn join_service(mut self, join: J) -> Self {
        self.join = Some(join);
        self
    }

    pub fn channel_opener(mut self, opener: C) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn settings(mut self, settings: FlowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// # Errors
    /// Names the first required collaborator that was not set.
    pub fn build(self) -> Result<Arc<BootstrapSequencer<J, C>>, &'static str> {
        let store = self.store.ok_or("store is required")?;
        let roster = self.roster.ok_or("roster is required")?;
        let renderer = self.renderer.ok_or("renderer is required")?;
        let join = self.join.ok_or("join service is required")?;
        let opener = self.opener.ok_or("channel opener is required")?;
        let observer = self.observer.unwrap_or_else(|| Arc::new(NoopObserver));

        let flow = JoinFlow::new(join, opener, Arc::clone(&roster), Arc::clone(&renderer))
            .with_observer(Arc::clone(&observer))
            .with_settings(self.settings);

        Ok(Arc::new(BootstrapSequencer {
            store,
            roster,
            renderer,
            observer,
            mirror: Mutex::new(LocalMirror::new()),
            flow: Arc::new(flow),
            started: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            ready_subscription: OnceCell::new(),
            join_task: Mutex::new(None),
        }))
    }
}

impl<J, C> Default for BootstrapSequencerBuilder<J, C>
where
    J: JoinService + 'static,
    C: ChannelOpener + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
