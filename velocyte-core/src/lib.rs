//! Shared primitives for the velocyte RNA velocity workspace.
//!
//! `velocyte-core` provides the foundation that the other crates build on:
//!
//! - **Error types** — [`VelocyteError`] and [`Result`] for structured error handling
//! - **Traits** — [`Summarizable`] for one-line reports, [`Scored`] for fit quality

pub mod error;
pub mod traits;

pub use error::{Result, VelocyteError};
pub use traits::*;
