//! The distribution layer: orchestrator/worker coordination over a
//! long-lived bidirectional channel.
//!
//! The transport itself (gRPC in production) lives outside this crate;
//! everything here is written against the [`transport::Channel`] contract:
//! the call policy with bounded retries and trailer short-circuits, the
//! worker slot state machine, the connection monitor with reconnection
//! backoff, and the forwarded-event demotion rules.

pub mod call;
pub mod config;
pub mod events;
pub mod monitor;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use config::DistributionConfig;
pub use worker::{HelloOutcome, Orchestrator, WorkerFailure, WorkerStatus};
