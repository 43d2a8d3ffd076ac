//! HTTP client for the game API, including the join service.
//!
//! The game server answers every endpoint with JSONP, `callback(<json>);`,
//! and rejects requests that carry no `callback` query parameter. The client
//! always sends an empty one and accepts both the envelope and plain JSON.
//!
//! ## Endpoints
//! | method          | path               | reply                                  |
//! |-----------------|--------------------|----------------------------------------|
//! | `join`          | `/api/join_game`   | `{channel_token, game_id?, cards?}`    |
//! | `select_card`   | `/api/select_card` | `{status, message?}`                   |
//! | `vote`          | `/api/vote`        | `{status, message?}`                   |
//! | `send_message`  | `/api/send_message`| `{status}`                             |
//! | `card_deck`     | `/api/cards`       | `[card text, ...]` or `{status: ERROR}`|

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::WidgetError;
use crate::host::LocalIdentity;
use crate::mirror::ChannelToken;

pub const JOIN_GAME_PATH: &str = "/api/join_game";
pub const SELECT_CARD_PATH: &str = "/api/select_card";
pub const VOTE_PATH: &str = "/api/vote";
pub const SEND_MESSAGE_PATH: &str = "/api/send_message";
pub const CARDS_PATH: &str = "/api/cards";

/// Query parameter naming the JSONP wrapper; required on every request.
pub const CALLBACK_PARAM: &str = "callback";

// ---------------------------------------------------------------------------
// Join service
// ---------------------------------------------------------------------------

/// Query sent to the join service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "hangout_id")]
    pub session_id: String,
    #[serde(rename = "plus_id")]
    pub participant_id: String,
}

impl From<LocalIdentity> for JoinRequest {
    fn from(identity: LocalIdentity) -> Self {
        Self {
            session_id: identity.session_id,
            participant_id: identity.participant_id,
        }
    }
}

/// Successful join reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub channel_token: ChannelToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<serde_json::Value>,
    /// The hand dealt on joining, as card numbers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cards: Vec<u32>,
}

impl JoinResponse {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            channel_token: ChannelToken::new(token),
            game_id: None,
            cards: Vec::new(),
        }
    }
}

/// Exchanges a participant identity for a channel token.
pub trait JoinService: Send + Sync {
    fn join(
        &self,
        request: &JoinRequest,
    ) -> impl Future<Output = Result<JoinResponse, WidgetError>> + Send;
}

/// Strip a JSONP envelope (`name(<json>);`) if present.
///
/// Bodies that already start with `{` or `[` are returned trimmed.
pub fn strip_jsonp(body: &str) -> &str {
    let trimmed = body.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return trimmed;
    }
    let Some(open) = trimmed.find('(') else {
        return trimmed;
    };
    let callback = &trimmed[..open];
    let is_callback = callback
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.');
    let tail = trimmed.trim_end_matches(';').trim_end();
    if !is_callback || !tail.ends_with(')') || tail.len() <= open {
        return trimmed;
    }
    tail[open + 1..tail.len() - 1].trim()
}

/// Decode a join reply body, JSONP or plain.
pub fn parse_join_body(url: &str, body: &str) -> Result<JoinResponse, WidgetError> {
    let response: JoinResponse =
        serde_json::from_str(strip_jsonp(body)).map_err(|e| WidgetError::JoinRequest {
            url: url.to_string(),
            detail: format!("unexpected reply shape: {e}"),
        })?;
    if response.channel_token.as_str().is_empty() {
        return Err(WidgetError::JoinRequest {
            url: url.to_string(),
            detail: "reply carries an empty channel_token".to_string(),
        });
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// Game API client
// ---------------------------------------------------------------------------

/// Which card deck to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deck {
    Answers,
    Questions,
}

impl std::fmt::Display for Deck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Deck::Answers => write!(f, "answers"),
            Deck::Questions => write!(f, "questions"),
        }
    }
}

/// `{status, message}` reply shared by the non-join endpoints.
#[derive(Debug, Clone, Deserialize)]
struct StatusReply {
    status: String,
    #[serde(default)]
    message: Option<serde_json::Value>,
}

impl StatusReply {
    fn into_result(self, endpoint: &str) -> Result<Option<serde_json::Value>, WidgetError> {
        if self.status.eq_ignore_ascii_case("ok") {
            return Ok(self.message);
        }
        let message = match self.message {
            Some(serde_json::Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => format!("status {}", self.status),
        };
        Err(WidgetError::Api {
            endpoint: endpoint.to_string(),
            message,
        })
    }
}

/// Transport-level failure before a body could be read.
enum FetchError {
    Transport { url: String, detail: String },
    Status { url: String, status: u16 },
}

impl FetchError {
    fn into_join_error(self) -> WidgetError {
        match self {
            FetchError::Transport { url, detail } => WidgetError::JoinRequest { url, detail },
            FetchError::Status { url, status } => WidgetError::JoinStatus { url, status },
        }
    }

    fn into_api_error(self, endpoint: &str) -> WidgetError {
        let message = match self {
            FetchError::Transport { url, detail } => format!("{url}: {detail}"),
            FetchError::Status { url, status } => format!("{url}: HTTP {status}"),
        };
        WidgetError::Api {
            endpoint: endpoint.to_string(),
            message,
        }
    }
}

/// Connection settings for [`GameApiClient`].
#[derive(Debug, Clone)]
pub struct GameApiConfig {
    /// Base URL of the game server (e.g. `http://127.0.0.1:8080`).
    pub base_url: String,
    /// TCP connection timeout.
    pub connect_timeout: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl GameApiConfig {
    /// Defaults: connect_timeout 3 s, request_timeout 10 s.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP client for the game server. Implements [`JoinService`].
#[derive(Debug, Clone)]
pub struct GameApiClient {
    config: GameApiConfig,
    client: reqwest::Client,
}

impl GameApiClient {
    pub fn builder(base_url: impl Into<String>) -> GameApiClientBuilder {
        GameApiClientBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    pub fn config(&self) -> &GameApiConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn fetch<Q: Serialize + ?Sized>(&self, path: &str, query: &Q) -> Result<String, FetchError> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .query(&[(CALLBACK_PARAM, "")])
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                url: url.clone(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(FetchError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }

        resp.text().await.map_err(|e| FetchError::Transport {
            url,
            detail: e.to_string(),
        })
    }

    async fn call_status<Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<Option<serde_json::Value>, WidgetError> {
        let body = self
            .fetch(path, query)
            .await
            .map_err(|e| e.into_api_error(path))?;
        let reply: StatusReply =
            serde_json::from_str(strip_jsonp(&body)).map_err(|e| WidgetError::Api {
                endpoint: path.to_string(),
                message: format!("unexpected reply shape: {e}"),
            })?;
        reply.into_result(path)
    }

    /// Play `card_num` from the local hand for the current round.
    pub async fn select_card(&self, request: &JoinRequest, card_num: u32) -> Result<(), WidgetError> {
        let card = card_num.to_string();
        let query = [
            ("hangout_id", request.session_id.as_str()),
            ("plus_id", request.participant_id.as_str()),
            ("card_num", card.as_str()),
        ];
        self.call_status(SELECT_CARD_PATH, &query).await.map(|_| ())
    }

    /// Vote for the answer card `card_num`.
    pub async fn vote(&self, request: &JoinRequest, card_num: u32) -> Result<(), WidgetError> {
        let card = card_num.to_string();
        let query = [
            ("hangout_id", request.session_id.as_str()),
            ("plus_id", request.participant_id.as_str()),
            ("card_num", card.as_str()),
        ];
        self.call_status(VOTE_PATH, &query).await.map(|_| ())
    }

    /// Ask the server to relay `message` to every playing participant's channel.
    pub async fn send_message(&self, session_id: &str, message: &str) -> Result<(), WidgetError> {
        let query = [("hangout_id", session_id), ("message", message)];
        self.call_status(SEND_MESSAGE_PATH, &query).await.map(|_| ())
    }

    /// Fetch the card texts of a deck, indexed by card number.
    pub async fn card_deck(&self, deck: Deck) -> Result<Vec<String>, WidgetError> {
        let deck_name = deck.to_string();
        let body = self
            .fetch(CARDS_PATH, &[("deck", deck_name.as_str())])
            .await
            .map_err(|e| e.into_api_error(CARDS_PATH))?;
        parse_deck_body(&body)
    }
}

fn parse_deck_body(body: &str) -> Result<Vec<String>, WidgetError> {
    let value: serde_json::Value =
        serde_json::from_str(strip_jsonp(body)).map_err(|e| WidgetError::Api {
            endpoint: CARDS_PATH.to_string(),
            message: format!("unexpected reply shape: {e}"),
        })?;
    if value.is_object() {
        let reply: StatusReply = serde_json::from_value(value).map_err(|e| WidgetError::Api {
            endpoint: CARDS_PATH.to_string(),
            message: format!("unexpected reply shape: {e}"),
        })?;
        reply.into_result(CARDS_PATH)?;
        return Err(WidgetError::Api {
            endpoint: CARDS_PATH.to_string(),
            message: "status reply without a deck".to_string(),
        });
    }
    serde_json::from_value(value).map_err(|e| WidgetError::Api {
        endpoint: CARDS_PATH.to_string(),
        message: format!("deck is not a list of strings: {e}"),
    })
}

impl JoinService for GameApiClient {
    async fn join(&self, request: &JoinRequest) -> Result<JoinResponse, WidgetError> {
        let url = self.url(JOIN_GAME_PATH);
        debug!(session = %request.session_id, url = %url, "requesting channel token");
        let body = self
            .fetch(JOIN_GAME_PATH, request)
            .await
            .map_err(FetchError::into_join_error)?;
        parse_join_body(&url, &body).inspect_err(|e| {
            warn!(error = %e, "join reply rejected");
        })
    }
}

/// Builder for [`GameApiClient`].
pub struct GameApiClientBuilder {
    config: GameApiConfig,
}

impl GameApiClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: GameApiConfig::new(base_url),
        }
    }

    /// Override the TCP connect timeout (default 3 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Override the per-request timeout (default 10 s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn build(self) -> GameApiClient {
        // reqwest::Client::builder() can fail in extreme environments; fall
        // back to a default client instead of panicking.
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .build()
            .unwrap_or_default();

        GameApiClient {
            config: self.config,
            client,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
