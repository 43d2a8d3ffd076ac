//! Client configuration loaded from TOML.
//!
//! ```toml
//! api_base_url = "http://127.0.0.1:8080"
//! channel_url = "ws://127.0.0.1:8080/channel"
//! join_timeout_ms = 5000
//! log_filter = "hangout_cards=debug"
//! ```
//!
//! Every key is optional; unknown keys are rejected.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::{GameApiClient, GameApiClientBuilder};
use crate::channel::WsChannelOpener;
use crate::error::WidgetError;
use crate::flow::FlowSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WidgetConfig {
    /// Base of the game HTTP API (`/api/join_game` and friends).
    pub api_base_url: String,
    /// WebSocket endpoint; the channel token is passed as the `token` query parameter.
    pub channel_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Cap on the token request. Unset waits as long as the HTTP timeout allows.
    pub join_timeout_ms: Option<u64>,
    /// Cap on waiting for the channel's `open` event.
    pub open_timeout_ms: Option<u64>,
    /// Default tracing filter when `RUST_LOG` is not set.
    pub log_filter: String,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            channel_url: "ws://localhost:8080/channel".to_string(),
            connect_timeout_ms: 3_000,
            request_timeout_ms: 10_000,
            join_timeout_ms: None,
            open_timeout_ms: None,
            log_filter: "info".to_string(),
        }
    }
}

impl WidgetConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, WidgetError> {
        toml::from_str(text).map_err(|e| WidgetError::Config {
            detail: e.to_string(),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, WidgetError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| WidgetError::Config {
            detail: format!("{}: {e}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn flow_settings(&self) -> FlowSettings {
        FlowSettings {
            join_timeout: self.join_timeout_ms.map(Duration::from_millis),
            open_timeout: self.open_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn api_client_builder(&self) -> GameApiClientBuilder {
        GameApiClient::builder(self.api_base_url.as_str())
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .request_timeout(Duration::from_millis(self.request_timeout_ms))
    }

    pub fn channel_opener(&self) -> WsChannelOpener {
        WsChannelOpener::new(self.channel_url.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
