//! The reconciler dispatcher and the Instance/Job/Run/Fleet state machines
//! that drive declared configuration against cloud backends.
//!
//! This crate has the only I/O-orchestrating loops in the workspace: it pulls
//! leased batches from `meridian-store`, calls out through
//! `meridian-backends`, and writes the results back. Everything here is a
//! plain `async fn` over injected `Clock`/`Store`/`ComputeBackend`
//! dependencies so tests can run it without a clock, a database, or a
//! network.

mod context;
pub mod dispatcher;
mod error;
pub mod healthcheck;
pub mod ports;
pub mod reconcilers;

pub use context::ReconcileContext;
pub use error::ReconcileError;
pub use healthcheck::{HealthCheck, HealthCheckResult};
