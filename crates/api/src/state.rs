use std::sync::Arc;

use relay_goofish::ClientManager;

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Dashboard WebSocket connections (browser clients).
    pub ws_manager: Arc<WsManager>,
    /// Seller account connections to the IM gateway.
    pub clients: Arc<ClientManager>,
}
