//! Error model shared by the engine crates.

use thiserror::Error;

/// Result type used for identifier and token validation.
pub type CoreResult<T> = Result<T, CoreError>;

/// Validation failures for the engine's value types.
///
/// These are deterministic input problems. Runtime failures of jobs live in
/// `forgegen-jobs`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A family token was empty or malformed.
    #[error("invalid family token: {0}")]
    InvalidFamily(String),

    /// A scheduling rule cannot conflict with itself and would never serialize anything.
    #[error("invalid scheduling rule: {0}")]
    InvalidRule(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_family(msg: impl Into<String>) -> Self {
        Self::InvalidFamily(msg.into())
    }

    pub fn invalid_rule(msg: impl Into<String>) -> Self {
        Self::InvalidRule(msg.into())
    }
}
