// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contracts between the control plane and the local container runtime.
//!
//! The reconciler and the HTTP surface drive the runtime exclusively through
//! these traits so the executor can be swapped or stubbed in tests. Apply and
//! destroy both accumulate a human-readable transcript; on failure the
//! transcript captured so far travels with the error so it can still be
//! persisted to `last_sync_output`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::error::ConopsError;

/// Callback receiving the monotonically growing transcript of an apply.
///
/// Invoked at least once per command and after every non-empty output chunk.
/// Implementations must not block beyond a cheap persistence write.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything an apply needs to materialize one app's desired state.
#[derive(Clone)]
pub struct ApplyRequest {
    pub app_id: String,
    /// When non-empty, overwrites the compose file on disk before running.
    pub inline_content: String,
    /// Extra environment for the compose subprocesses.
    pub env_vars: HashMap<String, String>,
    pub repo_url: String,
    pub branch: String,
    pub compose_path: String,
    /// Pin the checkout to this commit; empty means latest on `branch`.
    pub commit_hash: String,
    /// Decrypted deploy-key material; zeroed on drop.
    pub deploy_key: Option<Zeroizing<Vec<u8>>>,
}

impl std::fmt::Debug for ApplyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyRequest")
            .field("app_id", &self.app_id)
            .field("repo_url", &self.repo_url)
            .field("branch", &self.branch)
            .field("compose_path", &self.compose_path)
            .field("commit_hash", &self.commit_hash)
            .field("deploy_key", &self.deploy_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// An apply or destroy failure carrying the partial transcript.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct ApplyError {
    /// Transcript accumulated up to the failing step.
    pub transcript: String,
    #[source]
    pub source: ConopsError,
}

impl ApplyError {
    pub fn new(transcript: impl Into<String>, source: ConopsError) -> Self {
        Self {
            transcript: transcript.into(),
            source,
        }
    }
}

/// Applies desired app state to the local runtime.
#[async_trait]
pub trait RuntimeApplier: Send + Sync {
    /// Checkout + pull + up for one app. Returns the full transcript on
    /// success. Cancelling `cancel` kills in-flight subprocesses; the
    /// transcript-to-that-point is preserved in the returned [`ApplyError`].
    async fn apply(
        &self,
        request: ApplyRequest,
        cancel: CancellationToken,
        on_progress: Option<ProgressFn>,
    ) -> Result<String, ApplyError>;
}

/// Best-effort teardown of an app's runtime resources.
#[async_trait]
pub trait RuntimeCleaner: Send + Sync {
    /// Compose down, remove lingering containers, remove the app runtime
    /// directory. Returns accumulated command output.
    async fn destroy(
        &self,
        app_id: &str,
        compose_path: &str,
        env_vars: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<String, ApplyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_error_carries_transcript_and_message() {
        let err = ApplyError::new(
            "=== Sync started ===\n",
            ConopsError::runtime("pull failed"),
        );
        assert!(err.transcript.contains("Sync started"));
        assert!(err.to_string().contains("pull failed"));
    }

    #[test]
    fn apply_request_is_clone_and_debug_without_leaking_key_bytes() {
        let request = ApplyRequest {
            app_id: "a-1".into(),
            inline_content: String::new(),
            env_vars: HashMap::new(),
            repo_url: "git@github.com:acme/site.git".into(),
            branch: "main".into(),
            compose_path: "compose.yaml".into(),
            commit_hash: "abc123".into(),
            deploy_key: Some(Zeroizing::new(b"-----BEGIN KEY-----".to_vec())),
        };
        let cloned = request.clone();
        assert_eq!(cloned.app_id, "a-1");
        assert!(cloned.deploy_key.is_some());

        let rendered = format!("{cloned:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("BEGIN KEY"));
    }
}
