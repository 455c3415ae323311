// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the ConOps control plane.

use thiserror::Error;

/// The primary error type used across the ConOps workspace.
#[derive(Debug, Error)]
pub enum ConopsError {
    /// Configuration errors (invalid key material, missing required settings,
    /// encryption requested but disabled).
    #[error("configuration error: {0}")]
    Config(String),

    /// Input rejected at a boundary before any state change.
    #[error("{0}")]
    Validation(String),

    /// The referenced entity does not exist (also returned when a mutating
    /// store operation affects zero rows).
    #[error("{0}")]
    NotFound(String),

    /// The operation conflicts with current state (duplicate id, sync
    /// already in progress).
    #[error("{0}")]
    Conflict(String),

    /// State store errors (connection, query failure, migration failure).
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Credential vault errors (sealing, opening, key bootstrap).
    #[error("vault error: {0}")]
    Vault(String),

    /// Git errors from the watcher or the executor's repository preparation.
    #[error("git error: {message}")]
    Git {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Container runtime and toolchain errors (preflight, subprocess failure).
    #[error("runtime error: {message}")]
    Runtime {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation cancelled or timed out.
    #[error("operation timed out or was cancelled after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConopsError {
    /// Shorthand for a runtime error without an underlying source.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for a git error without an underlying source.
    pub fn git(message: impl Into<String>) -> Self {
        Self::Git {
            message: message.into(),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_render_their_messages() {
        let err = ConopsError::Validation("repo URL is required".into());
        assert_eq!(err.to_string(), "repo URL is required");

        let err = ConopsError::NotFound("app not found".into());
        assert_eq!(err.to_string(), "app not found");

        let err = ConopsError::Config("bad key".into());
        assert!(err.to_string().contains("configuration error"));
    }

    #[test]
    fn runtime_shorthand_has_no_source() {
        let err = ConopsError::runtime("pull failed");
        match err {
            ConopsError::Runtime { message, source } => {
                assert_eq!(message, "pull failed");
                assert!(source.is_none());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
