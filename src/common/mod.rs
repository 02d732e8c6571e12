//! Common types and utilities shared by the compound file engine.

// Submodule declarations
pub mod binary;
pub mod error;

// Re-exports for convenience
pub use error::{Error, Result};
