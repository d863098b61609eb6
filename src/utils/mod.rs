//! Shared helpers for the binaries and the bus.

pub mod bootstrap;
pub mod retry;
