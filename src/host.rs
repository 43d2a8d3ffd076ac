//! Seams to the hosting environment.
//!
//! The host application owns the replicated shared state, the participant
//! roster, and the "environment ready" signal. This crate only consumes them
//! through the traits below, so the same sequencer runs against the real host
//! bridge, the in-process [`MemoryHost`](crate::memory_host::MemoryHost), or a
//! test double.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::WidgetError;
use crate::flow::FlowState;
use crate::mirror::{LocalMirror, Participant, SharedMetadata, SharedState, StateChange};

/// Callback for shared-state notifications.
pub type StateListener = Arc<dyn Fn(StateChange) + Send + Sync>;

/// Callback for roster notifications; receives the full new roster.
pub type ParticipantsListener = Arc<dyn Fn(Vec<Participant>) + Send + Sync>;

/// Callback for the environment-ready signal.
pub type ReadyListener = Arc<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

type CancelFn = Box<dyn FnOnce() + Send>;

struct SubscriptionInner {
    active: AtomicBool,
    on_cancel: Mutex<Option<CancelFn>>,
}

/// Handle to a registered listener.
///
/// Cloning shares the registration. `cancel` runs the deregistration at most
/// once and is safe to call from inside the listener it controls.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                active: AtomicBool::new(true),
                on_cancel: Mutex::new(Some(Box::new(on_cancel))),
            }),
        }
    }

    /// A subscription with nothing to deregister.
    pub fn detached() -> Self {
        Self::new(|| {})
    }

    /// Deregister the listener. Returns `true` only for the call that
    /// actually cancelled it.
    pub fn cancel(&self) -> bool {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        let on_cancel = self
            .inner
            .on_cancel
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(f) = on_cancel {
            f();
        }
        true
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Host-provided collaborators
// ---------------------------------------------------------------------------

/// Replicated key/value store with change notifications.
pub trait SharedStateStore: Send + Sync {
    /// Current shared state, or `None` when the host has none yet.
    fn state(&self) -> Option<SharedState>;

    /// Current per-key metadata, or `None` when the host has none yet.
    fn state_metadata(&self) -> Option<SharedMetadata>;

    fn add_state_change_listener(&self, listener: StateListener) -> Subscription;
}

/// The live participant list of the session.
pub trait ParticipantRoster: Send + Sync {
    /// Identifier of the session this roster belongs to.
    fn session_id(&self) -> Option<String>;

    fn participants(&self) -> Option<Vec<Participant>>;

    /// Session-scoped id of the local participant.
    fn local_participant_id(&self) -> Option<String>;

    fn participant_by_id(&self, id: &str) -> Option<Participant>;

    fn add_participants_listener(&self, listener: ParticipantsListener) -> Subscription;

    /// Resolve the session id and the local participant's person id.
    ///
    /// # Errors
    /// [`WidgetError::IdentityResolution`] when any step of the lookup comes
    /// back empty.
    fn resolve_identity(&self) -> Result<LocalIdentity, WidgetError> {
        let session_id = self.session_id().ok_or_else(|| WidgetError::IdentityResolution {
            reason: "host reports no session id".to_string(),
        })?;
        let local_id =
            self.local_participant_id()
                .ok_or_else(|| WidgetError::IdentityResolution {
                    reason: "host reports no local participant id".to_string(),
                })?;
        let participant =
            self.participant_by_id(&local_id)
                .ok_or_else(|| WidgetError::IdentityResolution {
                    reason: format!("participant {local_id} not found in roster"),
                })?;
        let person = participant
            .person
            .filter(|p| !p.id.is_empty())
            .ok_or_else(|| WidgetError::IdentityResolution {
                reason: format!("participant {local_id} has no person id"),
            })?;
        Ok(LocalIdentity {
            session_id,
            participant_id: person.id,
        })
    }
}

/// Who we are, as far as the join service is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub session_id: String,
    pub participant_id: String,
}

/// Fires once the host API can be used.
pub trait ReadySignal: Send + Sync {
    fn add_ready_listener(&self, listener: ReadyListener) -> Subscription;
}

/// Rendering collaborator.
///
/// `render` is called with the mirror borrowed; implementations must not call
/// back into the sequencer from inside it.
pub trait Renderer: Send + Sync {
    fn render(&self, mirror: &LocalMirror);

    /// Display text extracted from an inbound channel message.
    fn show_message(&self, content: &str);
}

/// Observability hooks for the join flow. All methods default to no-ops.
pub trait FlowObserver: Send + Sync {
    fn state_changed(&self, _state: FlowState) {}

    /// The channel reported `open`.
    fn connected(&self) {}

    fn closed(&self) {}

    /// The flow moved to `Failed` with this error.
    fn failed(&self, _error: &WidgetError) {}

    /// A malformed inbound message was dropped.
    fn message_discarded(&self, _error: &WidgetError) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl FlowObserver for NoopObserver {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::Person;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_runs_deregistration_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let sub = Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(sub.is_active());
        assert!(sub.cancel());
        assert!(!sub.cancel());
        assert!(!sub.clone().cancel());
        assert!(!sub.is_active());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detached_subscription_cancels_cleanly() {
        let sub = Subscription::detached();
        assert!(sub.cancel());
        assert!(!sub.is_active());
    }

    struct FixedRoster {
        session: Option<String>,
        local: Option<String>,
        roster: Vec<Participant>,
    }

    impl ParticipantRoster for FixedRoster {
        fn session_id(&self) -> Option<String> {
            self.session.clone()
        }
        fn participants(&self) -> Option<Vec<Participant>> {
            Some(self.roster.clone())
        }
        fn local_participant_id(&self) -> Option<String> {
            self.local.clone()
        }
        fn participant_by_id(&self, id: &str) -> Option<Participant> {
            self.roster.iter().find(|p| p.id == id).cloned()
        }
        fn add_participants_listener(&self, _listener: ParticipantsListener) -> Subscription {
            Subscription::detached()
        }
    }

    fn bob() -> Participant {
        Participant {
            id: "hp-1".into(),
            display_index: 0,
            person: Some(Person {
                id: "plus-42".into(),
                display_name: "Bob".into(),
            }),
        }
    }

    #[test]
    fn resolve_identity_uses_person_id() {
        let roster = FixedRoster {
            session: Some("hangout-9".into()),
            local: Some("hp-1".into()),
            roster: vec![bob()],
        };
        let identity = roster.resolve_identity().unwrap();
        assert_eq!(identity.session_id, "hangout-9");
        assert_eq!(identity.participant_id, "plus-42");
    }

    #[test]
    fn resolve_identity_fails_for_unknown_local_participant() {
        let roster = FixedRoster {
            session: Some("hangout-9".into()),
            local: Some("hp-2".into()),
            roster: vec![bob()],
        };
        let err = roster.resolve_identity().unwrap_err();
        assert!(matches!(err, WidgetError::IdentityResolution { .. }));
        assert!(err.to_string().contains("hp-2"));
    }

    #[test]
    fn resolve_identity_fails_without_person() {
        let mut p = bob();
        p.person = None;
        let roster = FixedRoster {
            session: Some("hangout-9".into()),
            local: Some("hp-1".into()),
            roster: vec![p],
        };
        assert!(matches!(
            roster.resolve_identity(),
            Err(WidgetError::IdentityResolution { .. })
        ));
    }

    #[test]
    fn resolve_identity_fails_without_session() {
        let roster = FixedRoster {
            session: None,
            local: Some("hp-1".into()),
            roster: vec![bob()],
        };
        assert!(matches!(
            roster.resolve_identity(),
            Err(WidgetError::IdentityResolution { .. })
        ));
    }
}
