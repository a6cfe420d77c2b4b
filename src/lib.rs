//! roost - session fleet coordinator.
//!
//! Coordinates a fleet of ephemeral worker processes, each holding live
//! stateful messaging-protocol sessions, against a durable registry that
//! tracks which session is owned by which worker. The backend ingests
//! heartbeats, reconciles reported session state, and demotes workers
//! whose heartbeats lapse; the worker runtime registers, recovers its
//! previously owned sessions on startup, and heartbeats for as long as it
//! lives. No two workers can believe they own the same session: ownership
//! only moves through an explicit release.

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod worker;
