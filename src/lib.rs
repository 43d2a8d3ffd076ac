//! Session client for a hangout card game.
//!
//! A widget embedded in a hangout waits for the host's ready signal, mirrors
//! the hangout's shared state and roster locally, joins the game over HTTP,
//! and opens a messaging channel with the token it gets back.
//!
//! - [`sequencer`]: the bootstrap sequence tying everything together.
//! - [`mirror`]: the local copy of shared state and participants.
//! - [`host`]: the traits a hosting environment implements.
//! - [`flow`]: the join-then-open-channel state machine.
//! - [`api`] / [`channel`]: HTTP and WebSocket transports.

pub mod api;
pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod flow;
pub mod host;
pub mod memory_host;
pub mod mirror;
pub mod sequencer;

pub use api::{GameApiClient, JoinRequest, JoinResponse, JoinService};
pub use channel::{ChannelEvent, ChannelOpener, WsChannelOpener};
pub use config::WidgetConfig;
pub use error::WidgetError;
pub use flow::{FlowHandle, FlowSettings, FlowState, JoinFlow};
pub use host::{FlowObserver, ParticipantRoster, ReadySignal, Renderer, SharedStateStore};
pub use memory_host::MemoryHost;
pub use mirror::{LocalMirror, Participant, StateChange, StateDelta};
pub use sequencer::BootstrapSequencer;
