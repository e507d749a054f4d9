//! Client-side session runtime for a distributed database driver.
//!
//! The crate owns the resource lifecycle and resilience layer: a bounded pool
//! of server-side sessions with keep-alive monitoring, and a failure
//! classification and backoff-retry engine shared by higher-level clients.

pub mod config;
pub mod error;
pub mod logging;

pub mod retry;
pub mod rpc;
pub mod session;
pub mod sim;

pub use error::DriverError;
