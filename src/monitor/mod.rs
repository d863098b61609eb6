//! Live log monitor.
//!
//! Subscribes to the log topic, accumulates every delivered line, and serves
//! the accumulated text on demand.
//!
//! ## Architecture
//! ```text
//! [broker topic] --> Subscriber --> ingest --> LogAggregator <-- rest (GET /)
//! ```

pub mod aggregator;
pub mod ingest;
pub mod rest;

pub use aggregator::LogAggregator;
