//! Goofish IM connection lifecycle.
//!
//! One persistent WebSocket per seller account, kept alive and
//! authenticated indefinitely:
//!
//! - [`token`] acquires and periodically refreshes the access token.
//! - [`heartbeat`] tracks ping/ack liveness on a `Ready` session.
//! - [`connection`] runs the per-account state machine and exposes a
//!   cloneable handle for sends and status.
//! - [`manager`] is the registry of connections keyed by account id,
//!   with inbound fan-out through the event bus.
//!
//! [`transport`] and [`token::TokenSource`] are the seams to the
//! outside world; [`protocol`] owns the wire format.

pub mod api;
pub mod config;
pub mod connection;
pub mod credential;
pub mod heartbeat;
pub mod manager;
pub mod protocol;
pub mod reconnect;
pub mod token;
pub mod transport;

pub use config::ConnectionConfig;
pub use connection::{AccountConnection, AccountConnectionHandle, OutboundRequest, SendError};
pub use credential::AccountCredential;
pub use manager::{ClientManager, ManagerError};
