//! botherd - multi-network IRC bot supervisor.
//!
//! One bot connection per configured network, a registry of pluggable
//! command handlers, a dispatcher that routes inbound messages to the
//! matching handler, and a scheduler that runs per-handler background
//! polls on a fixed cadence.
//!
//! Exposed as a library so integration tests can drive the supervisor
//! and dispatcher in-process with a test transport.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod worker;
