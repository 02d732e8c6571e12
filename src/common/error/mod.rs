//! Unified error types for olestore.
//!
//! Every public operation returns [`Result`]; failures are one of the
//! [`Error`] kinds (format, not-found, duplicate, disposed, capacity, ...).

// Submodule declarations
pub mod conversions;
pub mod types;

// Re-exports
pub use types::{Error, Result};
