//! Controller-specific error types.

use thiserror::Error;

/// Errors reading the process configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable holds an unusable value
    #[error("Invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        /// Variable name
        name: &'static str,
        /// Raw value
        value: String,
        /// What was expected
        reason: String,
    },
}
