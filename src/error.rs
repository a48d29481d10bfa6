//! Error types for the collection core.
//!
//! Runtime invariant violations in this crate are fatal assertions, not
//! recoverable errors; `GcError` only covers the configuration surface,
//! where a caller can still fix its input.

use std::fmt;

/// Errors reported while validating a [`crate::config::GcConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    /// A recognized configuration option that this build does not
    /// implement yet.
    UnsupportedConfig(&'static str),
    /// A configuration value outside its valid range.
    InvalidConfig(&'static str),
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcError::UnsupportedConfig(what) => write!(f, "unsupported configuration: {}", what),
            GcError::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
        }
    }
}

impl std::error::Error for GcError {}

/// Result type for configuration-level operations.
pub type GcResult<T> = Result<T, GcError>;
