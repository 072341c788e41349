//! Shared primitives and traits for the Cyanea MCMC engine.
//!
//! `cyanea-core` provides the foundation that the other Cyanea crates build on:
//!
//! - **Error types** — [`CyaneaError`] and [`Result`] for structured error handling
//! - **Traits** — capability interfaces [`Versioned`], [`Dirtyable`] and [`Summarizable`]

pub mod error;
pub mod traits;

pub use error::{CyaneaError, Result};
pub use traits::*;
