//! logbus - live log pipeline over a topic broker
//!
//! Services publish plain-text progress lines onto a broker topic; a monitor
//! subscribes, accumulates every delivered line in memory and serves the
//! accumulated text over HTTP.
//!
//! - [`bus`]: broker connection with retry, publisher, subscriber
//! - [`monitor`]: aggregator, ingest loop, read endpoint
//! - [`emitter`], [`receiver`]: the demo pair producing lines

pub mod bus;
pub mod config;
pub mod emitter;
pub mod monitor;
pub mod receiver;
pub mod utils;
