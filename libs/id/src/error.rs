//! Error types for name parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating object names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The name string is empty.
    #[error("name cannot be empty")]
    Empty,

    /// The name has no `-<index>` suffix.
    #[error("name '{0}' has no ordinal suffix")]
    MissingOrdinal(String),

    /// The ordinal suffix is not a non-negative 32-bit integer.
    #[error("invalid ordinal '{ordinal}' in name '{name}'")]
    InvalidOrdinal { name: String, ordinal: String },

    /// The group prefix is not usable as a name prefix.
    #[error("invalid group name '{0}'")]
    InvalidGroup(String),
}

impl NameError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, NameError::Empty)
    }

    /// Returns true if this error concerns the ordinal suffix.
    pub fn is_ordinal_error(&self) -> bool {
        matches!(
            self,
            NameError::MissingOrdinal(_) | NameError::InvalidOrdinal { .. }
        )
    }
}
