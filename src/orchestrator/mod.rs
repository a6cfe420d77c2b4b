//! Backend wiring: the worker-facing HTTP API.

pub mod api;

pub use api::{ApiState, RegistryApi};
