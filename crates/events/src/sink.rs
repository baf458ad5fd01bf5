//! Downstream consumers of relay events.
//!
//! An [`EventSink`] is anything that wants every [`RelayEvent`]: the
//! dashboard push channel, the auto-reply engine, an audit log. Each sink
//! is driven by its own [`SinkDispatcher`] task reading from its own bus
//! subscription, so a stalled sink only ever lags itself.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::bus::RelayEvent;

/// Receives relay events. Fire-and-forget: there is no return channel.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Handle one event.
    async fn deliver(&self, event: RelayEvent);
}

/// Background loop feeding one sink from one bus subscription.
pub struct SinkDispatcher;

impl SinkDispatcher {
    /// Run the dispatch loop until the bus is dropped.
    ///
    /// Lagging is lossy and non-fatal: the skipped count is logged and
    /// the loop carries on with the oldest event still buffered. Returns
    /// the total number of events this sink missed.
    pub async fn run<S: EventSink + ?Sized>(
        sink: &S,
        mut receiver: broadcast::Receiver<RelayEvent>,
    ) -> u64 {
        let mut dropped = 0u64;
        loop {
            match receiver.recv().await {
                Ok(event) => sink.deliver(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    dropped += n;
                    tracing::warn!(
                        sink = sink.name(),
                        skipped = n,
                        "Event sink lagged, oldest pending events were dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!(sink = sink.name(), "Event bus closed, sink shutting down");
                    break;
                }
            }
        }
        dropped
    }

    /// Spawn [`run`](Self::run) for a shared sink.
    pub fn spawn<S: EventSink>(
        sink: std::sync::Arc<S>,
        receiver: broadcast::Receiver<RelayEvent>,
    ) -> tokio::task::JoinHandle<u64> {
        tokio::spawn(async move { Self::run(sink.as_ref(), receiver).await })
    }
}
