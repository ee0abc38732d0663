//! Error types for the background control plane

use thiserror::Error;

/// Result type alias for control plane operations
pub type ExtensionResult<T> = Result<T, ExtensionError>;

/// Errors surfaced to message-bus callers.
#[derive(Error, Debug)]
pub enum ExtensionError {
    /// Bad input: empty or mismatched password, invalid mnemonic, ...
    #[error("{0}")]
    Validation(String),

    /// Operation blocked by an unmet precondition
    #[error("{0}")]
    Policy(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Request(#[from] crate::requests::RequestError),

    /// Error raised on behalf of an injected provider; carries an RPC code
    #[error("{message}")]
    ProviderRpc { message: String, code: i64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExtensionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

/// Fail with a validation error unless `cond` holds.
pub(crate) fn ensure_valid(cond: bool, msg: &str) -> ExtensionResult<()> {
    if cond {
        Ok(())
    } else {
        Err(ExtensionError::validation(msg))
    }
}
