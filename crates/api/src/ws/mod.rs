//! Dashboard WebSocket push.
//!
//! Browsers connect to `/ws` and receive every relay event (inbound
//! messages and connection status changes) as JSON text frames.

mod handler;
mod heartbeat;
pub mod manager;

pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
