//! Lifecycle event emission.
//!
//! [`EventSink`] is the boundary the scheduler emits through;
//! [`BroadcastEventSink`] fans envelopes out to subscribers and
//! [`ChannelEventSink`] feeds a single bounded consumer.

pub mod bus;
pub mod sink;

pub use bus::BroadcastEventSink;
pub use sink::{ChannelEventSink, EventSink};
