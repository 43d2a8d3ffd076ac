//! Shared-state data model and the local mirror of it.
//!
//! ## Design
//! - The host replicates a small string→string map across the session. Each
//!   key carries a metadata record (provenance, timestamps) the host owns.
//! - [`LocalMirror`] holds the last observed snapshot and roster. Every state
//!   notification replaces the snapshot wholesale; `removed` keys are carried
//!   on the delta for observers but never merged.
//! - Nothing here originates state: the mirror is only mutated by applying
//!   host notifications.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata describing one shared-state key, as the host reports it.
///
/// The host conventionally includes `key`, `value` and `timestamp` fields, but
/// the record is opaque to this crate.
pub type MetadataRecord = serde_json::Map<String, serde_json::Value>;

/// Shared state snapshot: key → value.
pub type SharedState = BTreeMap<String, String>;

/// Per-key metadata snapshot: key → record.
pub type SharedMetadata = BTreeMap<String, MetadataRecord>;

/// One key of the shared state together with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedStateEntry {
    pub key: String,
    pub value: String,
    pub metadata: MetadataRecord,
}

/// What changed in a single state notification.
///
/// Callers must keep `removed` disjoint from the keys in `added`; see
/// [`StateDelta::is_disjoint`]. A delta violating this is a contract error and
/// is not repaired.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub added: Vec<MetadataRecord>,
    pub removed: Vec<String>,
}

impl StateDelta {
    pub fn new(added: Vec<MetadataRecord>, removed: Vec<String>) -> Self {
        Self { added, removed }
    }

    /// Delta that adds every record of `metadata`, in key order, and removes nothing.
    pub fn replay_of(metadata: &SharedMetadata) -> Self {
        Self {
            added: metadata.values().cloned().collect(),
            removed: Vec::new(),
        }
    }

    /// Keys named by the `key` field of the added records.
    pub fn added_keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.added
            .iter()
            .filter_map(|record| record.get("key").and_then(|k| k.as_str()))
    }

    /// True when no removed key also appears among the added records.
    pub fn is_disjoint(&self) -> bool {
        self.added_keys()
            .all(|added| !self.removed.iter().any(|removed| removed == added))
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A full state notification: the delta plus the authoritative snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub delta: StateDelta,
    pub state: SharedState,
    pub metadata: SharedMetadata,
}

/// The person behind a roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    /// Stable account identifier, sent to the join service.
    pub id: String,
    #[serde(default, rename = "displayName")]
    pub display_name: String,
}

/// A roster entry. Identity and display attributes are owned by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Session-scoped participant id.
    pub id: String,
    #[serde(default, rename = "displayIndex")]
    pub display_index: usize,
    #[serde(default)]
    pub person: Option<Person>,
}

impl Participant {
    pub fn display_name(&self) -> &str {
        self.person
            .as_ref()
            .map(|p| p.display_name.as_str())
            .unwrap_or("")
    }
}

/// Opaque token issued by the join service; opens exactly one channel.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelToken(String);

impl ChannelToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens are credentials; keep them out of Debug output and logs.
impl std::fmt::Debug for ChannelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelToken(<{} bytes>)", self.0.len())
    }
}

// ---------------------------------------------------------------------------
// LocalMirror
// ---------------------------------------------------------------------------

/// Most recently observed shared state, metadata and roster.
///
/// All three fields start absent and are only filled by host notifications
/// (or the one-time replay of what the host already holds).
#[derive(Debug, Clone, Default)]
pub struct LocalMirror {
    state: Option<SharedState>,
    metadata: Option<SharedMetadata>,
    participants: Option<Vec<Participant>>,
}

impl LocalMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace state and metadata with the snapshot carried by `change`.
    pub fn apply_state_change(&mut self, change: StateChange) {
        debug_assert!(
            change.delta.is_disjoint(),
            "state delta removes a key it also adds"
        );
        self.state = Some(change.state);
        self.metadata = Some(change.metadata);
    }

    /// Replace the roster wholesale.
    pub fn apply_participants(&mut self, participants: Vec<Participant>) {
        self.participants = Some(participants);
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    pub fn has_participants(&self) -> bool {
        self.participants.is_some()
    }

    pub fn state(&self) -> Option<&SharedState> {
        self.state.as_ref()
    }

    pub fn metadata(&self) -> Option<&SharedMetadata> {
        self.metadata.as_ref()
    }

    pub fn participants(&self) -> Option<&[Participant]> {
        self.participants.as_deref()
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.state.as_ref()?.get(key).map(String::as_str)
    }

    /// The entry for `key`, with empty metadata when the host sent none for it.
    pub fn entry(&self, key: &str) -> Option<SharedStateEntry> {
        let value = self.value(key)?;
        let metadata = self
            .metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .cloned()
            .unwrap_or_default();
        Some(SharedStateEntry {
            key: key.to_string(),
            value: value.to_string(),
            metadata,
        })
    }

    /// All entries of the current snapshot in key order.
    pub fn entries(&self) -> Vec<SharedStateEntry> {
        self.state
            .iter()
            .flat_map(|s| s.keys())
            .filter_map(|k| self.entry(k))
            .collect()
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.as_ref()?.iter().find(|p| p.id == id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
