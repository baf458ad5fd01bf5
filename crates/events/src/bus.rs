//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the central publish/subscribe hub for [`RelayEvent`]s.
//! It is designed to be shared via `Arc<EventBus>` across the application.

use serde::Serialize;
use tokio::sync::broadcast;

use relay_core::event::InboundEvent;
use relay_core::status::ConnectionStatus;

// ---------------------------------------------------------------------------
// RelayEvent
// ---------------------------------------------------------------------------

/// Everything the connection layer reports to the rest of the process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RelayEvent {
    /// A decoded chat/order/notification push.
    Inbound(InboundEvent),

    /// A connection changed state.
    Status(ConnectionStatus),
}

impl RelayEvent {
    pub fn account_id(&self) -> &str {
        match self {
            Self::Inbound(event) => &event.account_id,
            Self::Status(status) => &status.account_id,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`RelayEvent`].
///
/// # Usage
///
/// ```rust
/// use relay_core::status::ConnectionStatus;
/// use relay_events::bus::{EventBus, RelayEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(RelayEvent::Status(ConnectionStatus::new("2201234567")));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    /// Create a bus with a specific per-subscriber capacity.
    ///
    /// When a subscriber's buffer is full, its oldest un-consumed events
    /// are dropped and it observes a `RecvError::Lagged` on the next
    /// receive. Publishing never waits.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: RelayEvent) {
        // A SendError only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
