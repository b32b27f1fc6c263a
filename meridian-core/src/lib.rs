//! Data model, state machines and error taxonomy for the meridian control
//! plane.
//!
//! This crate has no I/O of its own: it is the set of types the reconcilers
//! in `meridian-runtime` read and write, and the [`Clock`] abstraction that
//! keeps their tests hermetic. Persistence lives in `meridian-store`, cloud
//! I/O lives in `meridian-backends`.

mod clock;
pub mod defaults;
pub mod entities;
mod error;
pub mod ids;
pub mod offer;
pub mod requirements;

pub use clock::{Clock, SystemClock, TestClock};
pub use error::{Error, Result, StoreErrorProxy};
