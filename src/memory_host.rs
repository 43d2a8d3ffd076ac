//! In-process host environment.
//!
//! [`MemoryHost`] plays the part of the conferencing host: it owns the
//! authoritative shared state and roster for one session and fans out change
//! notifications to registered listeners. The headless binary runs the
//! sequencer against it, and the integration tests drive it directly.
//!
//! Listeners are always invoked with the host lock released, so a listener
//! may read back from the host (or cancel its own subscription). Mutations
//! from different threads are delivered one at a time in the order they were
//! applied; a listener must not mutate the host from inside its callback.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::host::{
    ParticipantRoster, ParticipantsListener, ReadyListener, ReadySignal, SharedStateStore,
    StateListener, Subscription,
};
use crate::mirror::{
    MetadataRecord, Participant, Person, SharedMetadata, SharedState, StateChange, StateDelta,
};

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Default)]
struct HostInner {
    session_id: Option<String>,
    local_participant_id: Option<String>,
    participants: Vec<Participant>,
    state: Option<SharedState>,
    metadata: Option<SharedMetadata>,
    state_listeners: Vec<(u64, StateListener)>,
    participant_listeners: Vec<(u64, ParticipantsListener)>,
    ready_listeners: Vec<(u64, ReadyListener)>,
    next_listener_id: u64,
}

impl HostInner {
    fn next_id(&mut self) -> u64 {
        self.next_listener_id += 1;
        self.next_listener_id
    }
}

/// Listener list a subscription removes itself from.
#[derive(Clone, Copy)]
enum ListenerKind {
    State,
    Participants,
    Ready,
}

/// Shared, cloneable in-memory host for a single session.
#[derive(Clone, Default)]
pub struct MemoryHost {
    inner: Arc<Mutex<HostInner>>,
    /// Held from applying a mutation until its listeners have returned.
    delivery: Arc<Mutex<()>>,
}

impl MemoryHost {
    /// A host for `session_id` with no state, no roster and no local participant.
    pub fn new(session_id: impl Into<String>) -> Self {
        let host = Self::default();
        if let Ok(mut guard) = host.inner.lock() {
            guard.session_id = Some(session_id.into());
        }
        host
    }

    /// Add a person to the roster and return their roster entry.
    ///
    /// The session-scoped participant id is freshly generated; `person_id` is
    /// the stable account id the join service knows them by.
    pub fn add_person(&self, person_id: &str, display_name: &str) -> Participant {
        let _delivery = self.delivery_lock();
        let participant = {
            let Ok(mut guard) = self.inner.lock() else {
                return orphan_participant(person_id, display_name);
            };
            let participant = Participant {
                id: uuid::Uuid::new_v4().to_string(),
                display_index: guard.participants.len(),
                person: Some(Person {
                    id: person_id.to_string(),
                    display_name: display_name.to_string(),
                }),
            };
            guard.participants.push(participant.clone());
            participant
        };
        self.notify_participants();
        participant
    }

    /// Remove a participant by session-scoped id. Returns whether one was removed.
    pub fn remove_participant(&self, participant_id: &str) -> bool {
        let _delivery = self.delivery_lock();
        let removed = match self.inner.lock() {
            Ok(mut guard) => {
                let before = guard.participants.len();
                guard.participants.retain(|p| p.id != participant_id);
                guard.participants.len() != before
            }
            Err(_) => false,
        };
        if removed {
            self.notify_participants();
        }
        removed
    }

    /// Mark which roster entry is "us".
    pub fn set_local_participant(&self, participant_id: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.local_participant_id = Some(participant_id.to_string());
        }
    }

    /// Apply a change to the authoritative state and notify listeners.
    ///
    /// A key listed in both `updates` and `removals` is treated as updated.
    pub fn submit_delta(&self, updates: &[(&str, &str)], removals: &[&str]) {
        let _delivery = self.delivery_lock();
        let change = {
            let Ok(mut guard) = self.inner.lock() else {
                return;
            };
            let timestamp = now_ms();
            let mut state = guard.state.take().unwrap_or_default();
            let mut metadata = guard.metadata.take().unwrap_or_default();

            let mut added = Vec::with_capacity(updates.len());
            for (key, value) in updates {
                let record = metadata_record(key, value, timestamp);
                state.insert(key.to_string(), value.to_string());
                metadata.insert(key.to_string(), record.clone());
                added.push(record);
            }
            let mut removed = Vec::new();
            for key in removals {
                if updates.iter().any(|(k, _)| k == key) {
                    continue;
                }
                if state.remove(*key).is_some() {
                    metadata.remove(*key);
                    removed.push(key.to_string());
                }
            }

            guard.state = Some(state.clone());
            guard.metadata = Some(metadata.clone());
            StateChange {
                delta: StateDelta::new(added, removed),
                state,
                metadata,
            }
        };

        for listener in self.state_listeners() {
            listener(change.clone());
        }
    }

    /// Fire the environment-ready signal to every registered listener.
    pub fn fire_ready(&self) {
        let listeners: Vec<ReadyListener> = match self.inner.lock() {
            Ok(guard) => guard.ready_listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener();
        }
    }

    /// Number of live listeners of each kind: `(state, participants, ready)`.
    pub fn listener_counts(&self) -> (usize, usize, usize) {
        match self.inner.lock() {
            Ok(guard) => (
                guard.state_listeners.len(),
                guard.participant_listeners.len(),
                guard.ready_listeners.len(),
            ),
            Err(_) => (0, 0, 0),
        }
    }

    fn delivery_lock(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`; a panicking listener leaves nothing to repair.
        self.delivery.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify_participants(&self) {
        let (roster, listeners): (Vec<Participant>, Vec<ParticipantsListener>) =
            match self.inner.lock() {
                Ok(guard) => (
                    guard.participants.clone(),
                    guard
                        .participant_listeners
                        .iter()
                        .map(|(_, l)| Arc::clone(l))
                        .collect(),
                ),
                Err(_) => return,
            };
        for listener in listeners {
            listener(roster.clone());
        }
    }

    fn state_listeners(&self) -> Vec<StateListener> {
        match self.inner.lock() {
            Ok(guard) => guard
                .state_listeners
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn subscription(&self, kind: ListenerKind, id: u64) -> Subscription {
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            if let Ok(mut guard) = inner.lock() {
                match kind {
                    ListenerKind::State => guard.state_listeners.retain(|(i, _)| *i != id),
                    ListenerKind::Participants => {
                        guard.participant_listeners.retain(|(i, _)| *i != id)
                    }
                    ListenerKind::Ready => guard.ready_listeners.retain(|(i, _)| *i != id),
                }
            }
        })
    }
}

fn metadata_record(key: &str, value: &str, timestamp: u64) -> MetadataRecord {
    let mut record = MetadataRecord::new();
    record.insert("key".into(), json!(key));
    record.insert("value".into(), json!(value));
    record.insert("timestamp".into(), json!(timestamp));
    record.insert("timediff".into(), json!(0));
    record
}

fn orphan_participant(person_id: &str, display_name: &str) -> Participant {
    Participant {
        id: uuid::Uuid::new_v4().to_string(),
        display_index: 0,
        person: Some(Person {
            id: person_id.to_string(),
            display_name: display_name.to_string(),
        }),
    }
}

impl SharedStateStore for MemoryHost {
    fn state(&self) -> Option<SharedState> {
        self.inner.lock().ok()?.state.clone()
    }

    fn state_metadata(&self) -> Option<SharedMetadata> {
        self.inner.lock().ok()?.metadata.clone()
    }

    fn add_state_change_listener(&self, listener: StateListener) -> Subscription {
        let Ok(mut guard) = self.inner.lock() else {
            return Subscription::detached();
        };
        let id = guard.next_id();
        guard.state_listeners.push((id, listener));
        drop(guard);
        self.subscription(ListenerKind::State, id)
    }
}

impl ParticipantRoster for MemoryHost {
    fn session_id(&self) -> Option<String> {
        self.inner.lock().ok()?.session_id.clone()
    }

    fn participants(&self) -> Option<Vec<Participant>> {
        let guard = self.inner.lock().ok()?;
        if guard.participants.is_empty() {
            None
        } else {
            Some(guard.participants.clone())
        }
    }

    fn local_participant_id(&self) -> Option<String> {
        self.inner.lock().ok()?.local_participant_id.clone()
    }

    fn participant_by_id(&self, id: &str) -> Option<Participant> {
        self.inner
            .lock()
            .ok()?
            .participants
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    fn add_participants_listener(&self, listener: ParticipantsListener) -> Subscription {
        let Ok(mut guard) = self.inner.lock() else {
            return Subscription::detached();
        };
        let id = guard.next_id();
        guard.participant_listeners.push((id, listener));
        drop(guard);
        self.subscription(ListenerKind::Participants, id)
    }
}

impl ReadySignal for MemoryHost {
    fn add_ready_listener(&self, listener: ReadyListener) -> Subscription {
        let Ok(mut guard) = self.inner.lock() else {
            return Subscription::detached();
        };
        let id = guard.next_id();
        guard.ready_listeners.push((id, listener));
        drop(guard);
        self.subscription(ListenerKind::Ready, id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
