//! Error types for object model parsing.

use thiserror::Error;

/// Errors that can occur when deriving an ordinal index from an instance name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// The name has no `-` separating the group name from the ordinal.
    #[error("instance name has no ordinal separator: {0}")]
    MissingSeparator(String),

    /// The suffix after the last `-` is not a number.
    #[error("instance name {name} has non-numeric ordinal '{suffix}'")]
    NotANumber { name: String, suffix: String },
}
