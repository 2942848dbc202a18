//! Application Ports (Driven)
//!
//! Ports define interfaces for the external systems the pipeline depends on:
//! batched market data, the live stream, durable state, and alert delivery.

mod alert_sink_port;
mod market_feed_port;
mod state_store_port;
mod stream_control_port;

pub use alert_sink_port::{AlertSink, SinkError, TracingAlertSink};
pub use market_feed_port::{FeedError, MarketFeed};
pub use state_store_port::{InMemoryStateStore, StateStore, StoreError};
pub use stream_control_port::{ControlError, StreamControl};
