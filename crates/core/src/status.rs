//! Per-account connection state and the read-only status snapshot.
//!
//! The state machine itself lives in the connection driver; this module
//! only names the states and the snapshot shape that status queries and
//! the dashboard see.

use serde::{Deserialize, Serialize};

use crate::types::{AccountId, Timestamp};

/// Lifecycle state of one account's link to the chat service.
///
/// `Ready` is the only state in which sends are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket held. Initial state, and terminal after shutdown or
    /// after the reconnect bound is exhausted.
    Disconnected,
    /// Transport handshake in progress.
    Connecting,
    /// Acquiring a token and performing the login handshake.
    Authenticating,
    /// Logged in; heartbeats running, frames flowing.
    Ready,
    /// Socket released, waiting out the reconnect delay.
    Reconnecting,
}

impl ConnectionState {
    /// Token refresh only has an effect in these states.
    pub fn accepts_token_refresh(self) -> bool {
        matches!(self, Self::Authenticating | Self::Ready)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a connection, published on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub account_id: AccountId,
    pub state: ConnectionState,
    /// Consecutive failed connection cycles since the last `Ready`.
    pub reconnect_attempts: u32,
    pub last_heartbeat_sent: Option<Timestamp>,
    pub last_heartbeat_ack: Option<Timestamp>,
    /// When the current (or most recent) session reached `Ready`.
    pub connected_at: Option<Timestamp>,
    pub last_error: Option<String>,
    /// Set once the reconnect bound is exhausted. The account needs
    /// manual intervention (re-registration) after this.
    pub fatal: bool,
}

impl ConnectionStatus {
    pub fn new(account_id: impl Into<AccountId>) -> Self {
        Self {
            account_id: account_id.into(),
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            last_heartbeat_sent: None,
            last_heartbeat_ack: None,
            connected_at: None,
            last_error: None,
            fatal: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Gave up after exhausting the reconnect bound. Only re-registration
    /// brings the account back.
    pub fn is_terminated(&self) -> bool {
        self.fatal && self.state == ConnectionState::Disconnected
    }
}
