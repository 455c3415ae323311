// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Domain types shared across the ConOps workspace.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Lifecycle status of an app in the reconciliation state machine.
///
/// Stored in the database and rendered on the wire as lowercase strings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    /// Waiting for the reconciler to pick the app up.
    Pending,
    /// Exactly one actor is executing this app's apply.
    Syncing,
    /// Desired state was applied successfully.
    Synced,
    /// The last apply failed; `last_sync_error` carries the reason.
    Error,
}

/// How the tracked repository is authenticated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
pub enum RepoAuthMethod {
    #[strum(serialize = "public")]
    #[serde(rename = "public")]
    Public,
    #[strum(serialize = "deploy_key")]
    #[serde(rename = "deploy_key")]
    DeployKey,
}

/// A tracked application: one Git repo + branch + compose file reconciled as
/// a whole.
///
/// Timestamps are RFC 3339 strings; an empty `last_sync_at` means the app has
/// never been synced. Read paths coalesce NULL columns to empty strings so
/// callers never branch on NULL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    /// Opaque stable identifier (UUID), assigned on create if absent.
    pub id: String,
    /// Human label.
    pub name: String,
    /// HTTPS or SSH repository URL.
    pub repo_url: String,
    /// Repo authentication mode.
    pub repo_auth_method: RepoAuthMethod,
    /// Tracked branch; defaults to `main`.
    pub branch: String,
    /// Compose file path relative to the repo root; defaults to `compose.yaml`.
    pub compose_path: String,
    /// Poll interval as a duration string, e.g. `"30s"`.
    pub poll_interval: String,
    /// Desired state: latest commit observed on `branch`.
    pub last_seen_commit: String,
    /// Subject line of the desired commit.
    pub last_seen_commit_message: String,
    /// Applied state: commit of the last successful apply.
    pub last_synced_commit: String,
    /// Subject line of the applied commit.
    pub last_synced_commit_message: String,
    /// Last (possibly in-progress) captured transcript.
    pub last_sync_output: String,
    /// Empty unless `status` is `error`.
    pub last_sync_error: String,
    /// RFC 3339 timestamp of the last status/progress write; empty if never.
    pub last_sync_at: String,
    /// Current state-machine position.
    pub status: AppStatus,
}

/// Encrypted deploy-key material for one app.
///
/// Lifetime is coupled 1:1 with the app row (cascade delete); present only
/// for `deploy_key` auth.
#[derive(Debug, Clone)]
pub struct AppCredential {
    pub app_id: String,
    pub deploy_key_ciphertext: Vec<u8>,
    pub deploy_key_nonce: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn app_status_round_trips_through_strings() {
        for status in [
            AppStatus::Pending,
            AppStatus::Syncing,
            AppStatus::Synced,
            AppStatus::Error,
        ] {
            let rendered = status.to_string();
            let parsed = AppStatus::from_str(&rendered).expect("should parse back");
            assert_eq!(status, parsed);
        }
        assert_eq!(AppStatus::Pending.to_string(), "pending");
        assert_eq!(AppStatus::Syncing.to_string(), "syncing");
    }

    #[test]
    fn repo_auth_method_renders_snake_case() {
        assert_eq!(RepoAuthMethod::Public.to_string(), "public");
        assert_eq!(RepoAuthMethod::DeployKey.to_string(), "deploy_key");
        assert_eq!(
            RepoAuthMethod::from_str("deploy_key").unwrap(),
            RepoAuthMethod::DeployKey
        );
    }

    #[test]
    fn app_serializes_status_lowercase() {
        let app = App {
            id: "a-1".into(),
            name: "demo".into(),
            repo_url: "https://example.com/x/y".into(),
            repo_auth_method: RepoAuthMethod::Public,
            branch: "main".into(),
            compose_path: "compose.yaml".into(),
            poll_interval: "30s".into(),
            last_seen_commit: String::new(),
            last_seen_commit_message: String::new(),
            last_synced_commit: String::new(),
            last_synced_commit_message: String::new(),
            last_sync_output: String::new(),
            last_sync_error: String::new(),
            last_sync_at: String::new(),
            status: AppStatus::Pending,
        };
        let json = serde_json::to_string(&app).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("\"repo_auth_method\":\"public\""));
    }
}
