//! One module per reconciled entity kind. Each exposes a `reconcile` (plus
//! whatever extra dependencies that entity's transitions need beyond the
//! ambient [`crate::ReconcileContext`]) wired up by the `meridian` daemon
//! into a [`crate::dispatcher::Dispatcher`] registration.

pub mod fleet;
pub mod instance;
pub mod job;
pub mod run;
