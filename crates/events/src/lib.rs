//! In-process fan-out for relay events.
//!
//! - [`EventBus`] - publish/subscribe hub backed by
//!   `tokio::sync::broadcast`. Every subscriber gets its own bounded
//!   view of the stream; a subscriber that falls behind loses the oldest
//!   pending events instead of stalling the publisher.
//! - [`RelayEvent`] - the envelope carried on the bus.
//! - [`EventSink`] / [`SinkDispatcher`] - the seam for downstream
//!   consumers (dashboard push, reply engine).

pub mod bus;
pub mod sink;

pub use bus::{EventBus, RelayEvent};
pub use sink::{EventSink, SinkDispatcher};
