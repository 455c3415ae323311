// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the ConOps control plane.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup. Durations are kept as strings (`"30s"`, `"5m"`)
//! and parsed at the point of use so invalid values degrade per-component
//! instead of failing the whole load.

use serde::{Deserialize, Serialize};

/// Top-level ConOps configuration.
///
/// Loaded from TOML files with `CONOPS_*` environment variable overrides.
/// All sections are optional and default to sensible values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConopsConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// State store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Deploy-key encryption settings.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Repository authentication / host-key trust settings.
    #[serde(default)]
    pub repo_auth: RepoAuthConfig,

    /// Container runtime and managed toolchain settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Git watcher settings.
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Reconciler loop settings.
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

/// State store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Backend selector: "sqlite" (default) or "postgres".
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// PostgreSQL connection string (postgres backend only).
    #[serde(default)]
    pub connection_string: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_path: default_database_path(),
            connection_string: None,
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}

fn default_database_path() -> String {
    "conops.db".to_string()
}

/// Deploy-key encryption configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfig {
    /// Explicit encryption key: 32 raw bytes or base64 of 32 bytes.
    /// Takes priority over the key file.
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Path of the persisted key file, auto-generated on first run.
    #[serde(default = "default_key_file")]
    pub encryption_key_file: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            encryption_key: None,
            encryption_key_file: default_key_file(),
        }
    }
}

fn default_key_file() -> String {
    "/data/conops-encryption.key".to_string()
}

/// Repository authentication configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RepoAuthConfig {
    /// Explicit known-hosts file for strict SSH host verification.
    /// When unset the user's file, the system file, and finally a
    /// bootstrapped file are tried in that order.
    #[serde(default)]
    pub known_hosts_file: Option<String>,
}

/// Container runtime configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Root of the per-app checkouts used for apply.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: String,

    /// Managed toolchain cache directory.
    #[serde(default = "default_tools_dir")]
    pub tools_dir: String,

    /// Pin the docker CLI to an existing binary instead of installing one.
    #[serde(default)]
    pub docker_cli_path: Option<String>,

    /// Pin the managed docker CLI version instead of probing the index.
    #[serde(default)]
    pub docker_cli_version: Option<String>,

    /// Pin the compose plugin release tag instead of the latest release.
    #[serde(default)]
    pub compose_plugin_version: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            tools_dir: default_tools_dir(),
            docker_cli_path: None,
            docker_cli_version: None,
            compose_plugin_version: None,
        }
    }
}

fn default_runtime_dir() -> String {
    "./.conops-runtime".to_string()
}

fn default_tools_dir() -> String {
    "./.conops-tools".to_string()
}

/// Git watcher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WatcherConfig {
    /// Root of the watcher's per-app change-detection checkouts.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> String {
    "./.conops-cache".to_string()
}

/// Reconciler loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcilerConfig {
    /// Tick period of the reconcile loop.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: String,

    /// Per-apply timeout for reconciler-driven syncs.
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout: String,

    /// When true, apps in `error` are redispatched on every tick.
    #[serde(default)]
    pub retry_errors: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: default_reconcile_interval(),
            sync_timeout: default_sync_timeout(),
            retry_errors: false,
        }
    }
}

fn default_reconcile_interval() -> String {
    "10s".to_string()
}

fn default_sync_timeout() -> String {
    "5m".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ConopsConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.backend, "sqlite");
        assert_eq!(config.runtime.runtime_dir, "./.conops-runtime");
        assert_eq!(config.runtime.tools_dir, "./.conops-tools");
        assert_eq!(config.watcher.cache_dir, "./.conops-cache");
        assert_eq!(config.reconciler.reconcile_interval, "10s");
        assert_eq!(config.reconciler.sync_timeout, "5m");
        assert!(!config.reconciler.retry_errors);
        assert_eq!(
            config.credentials.encryption_key_file,
            "/data/conops-encryption.key"
        );
        assert!(config.repo_auth.known_hosts_file.is_none());
    }
}
