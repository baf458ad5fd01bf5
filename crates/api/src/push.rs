//! Dashboard push sink.
//!
//! Forwards every [`RelayEvent`] to all connected dashboard WebSockets as
//! a JSON text frame (`{"type": "inbound" | "status", "data": ...}`).

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::Message;
use relay_events::{EventSink, RelayEvent};

use crate::ws::WsManager;

pub struct DashboardPush {
    ws_manager: Arc<WsManager>,
}

impl DashboardPush {
    pub fn new(ws_manager: Arc<WsManager>) -> Self {
        Self { ws_manager }
    }
}

#[async_trait]
impl EventSink for DashboardPush {
    fn name(&self) -> &str {
        "dashboard_push"
    }

    async fn deliver(&self, event: RelayEvent) {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(account_id = %event.account_id(), error = %e, "Failed to encode relay event");
                return;
            }
        };

        let delivered = self.ws_manager.broadcast(Message::Text(text.into())).await;
        tracing::trace!(account_id = %event.account_id(), delivered, "Relay event pushed");
    }
}

#[cfg(test)]
mod tests {
    use relay_core::status::ConnectionStatus;

    use super::*;

    #[tokio::test]
    async fn events_reach_dashboards_as_tagged_json() {
        let ws_manager = Arc::new(WsManager::new());
        let mut rx = ws_manager.add("dash".into()).await;
        let push = DashboardPush::new(Arc::clone(&ws_manager));

        push.deliver(RelayEvent::Status(ConnectionStatus::new("seller-a")))
            .await;

        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("Expected a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["data"]["account_id"], "seller-a");
        assert_eq!(value["data"]["state"], "disconnected");
    }
}
