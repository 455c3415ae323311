// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered config merging.
//!
//! Merge order: compiled defaults, `/etc/conops/conops.toml`, the XDG user
//! config, `./conops.toml`, then `CONOPS_*` environment variables. The env
//! provider uses an explicit key table rather than `Env::split("_")` because
//! most option names contain underscores (`CONOPS_SYNC_TIMEOUT` must map to
//! `reconciler.sync_timeout`, not `reconciler.sync.timeout`).

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

use crate::model::ConopsConfig;

/// Load configuration from the standard hierarchy with env var overrides.
pub fn load_config() -> Result<ConopsConfig, figment::Error> {
    base_figment().extract()
}

/// Load configuration from a specific TOML string only (no file lookup).
pub fn load_config_from_str(toml_content: &str) -> Result<ConopsConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(ConopsConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<ConopsConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(ConopsConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

fn base_figment() -> Figment {
    Figment::new()
        .merge(Serialized::defaults(ConopsConfig::default()))
        .merge(Toml::file("/etc/conops/conops.toml"))
        .merge(Toml::file(
            dirs::config_dir()
                .map(|d| d.join("conops/conops.toml"))
                .unwrap_or_default(),
        ))
        .merge(Toml::file("conops.toml"))
        .merge(env_provider())
}

/// Map flat `CONOPS_*` option names onto their config sections.
///
/// Unknown names are passed through unchanged so `deny_unknown_fields`
/// rejects them with an actionable message.
fn map_env_key(key: &str) -> String {
    match key {
        "host" => "server.host".into(),
        "port" => "server.port".into(),
        "log_level" => "server.log_level".into(),
        "database_backend" => "storage.backend".into(),
        "database_path" => "storage.database_path".into(),
        "database_connection_string" => "storage.connection_string".into(),
        "encryption_key" => "credentials.encryption_key".into(),
        "encryption_key_file" => "credentials.encryption_key_file".into(),
        "known_hosts_file" => "repo_auth.known_hosts_file".into(),
        "runtime_dir" => "runtime.runtime_dir".into(),
        "tools_dir" => "runtime.tools_dir".into(),
        "docker_cli_path" => "runtime.docker_cli_path".into(),
        "docker_cli_version" => "runtime.docker_cli_version".into(),
        "compose_plugin_version" => "runtime.compose_plugin_version".into(),
        "cache_dir" => "watcher.cache_dir".into(),
        "reconcile_interval" => "reconciler.reconcile_interval".into(),
        "sync_timeout" => "reconciler.sync_timeout".into(),
        "retry_errors" => "reconciler.retry_errors".into(),
        other => other.into(),
    }
}

fn env_provider() -> Env {
    Env::prefixed("CONOPS_").map(|key| map_env_key(key.as_str().to_lowercase().as_str()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_values_override_defaults() {
        let config = load_config_from_str(
            r#"
            [reconciler]
            reconcile_interval = "30s"
            retry_errors = true

            [runtime]
            runtime_dir = "/var/lib/conops/runtime"
            "#,
        )
        .unwrap();
        assert_eq!(config.reconciler.reconcile_interval, "30s");
        assert!(config.reconciler.retry_errors);
        assert_eq!(config.runtime.runtime_dir, "/var/lib/conops/runtime");
        // Untouched sections keep their defaults.
        assert_eq!(config.storage.backend, "sqlite");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = load_config_from_str(
            r#"
            [reconciler]
            reconcile_intervall = "30s"
            "#,
        );
        assert!(result.is_err(), "typoed keys must be rejected");
    }

    #[test]
    fn env_key_table_covers_the_documented_options() {
        assert_eq!(map_env_key("reconcile_interval"), "reconciler.reconcile_interval");
        assert_eq!(map_env_key("sync_timeout"), "reconciler.sync_timeout");
        assert_eq!(map_env_key("retry_errors"), "reconciler.retry_errors");
        assert_eq!(map_env_key("runtime_dir"), "runtime.runtime_dir");
        assert_eq!(map_env_key("tools_dir"), "runtime.tools_dir");
        assert_eq!(map_env_key("encryption_key"), "credentials.encryption_key");
        assert_eq!(
            map_env_key("encryption_key_file"),
            "credentials.encryption_key_file"
        );
        assert_eq!(map_env_key("known_hosts_file"), "repo_auth.known_hosts_file");
        assert_eq!(map_env_key("docker_cli_path"), "runtime.docker_cli_path");
        assert_eq!(
            map_env_key("compose_plugin_version"),
            "runtime.compose_plugin_version"
        );
        assert_eq!(map_env_key("cache_dir"), "watcher.cache_dir");
    }

    #[test]
    fn env_vars_override_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "conops.toml",
                r#"
                [reconciler]
                sync_timeout = "2m"
                "#,
            )?;
            jail.set_env("CONOPS_SYNC_TIMEOUT", "9m");
            jail.set_env("CONOPS_RETRY_ERRORS", "true");
            let config: ConopsConfig = Figment::new()
                .merge(Serialized::defaults(ConopsConfig::default()))
                .merge(Toml::file("conops.toml"))
                .merge(env_provider())
                .extract()?;
            assert_eq!(config.reconciler.sync_timeout, "9m");
            assert!(config.reconciler.retry_errors);
            Ok(())
        });
    }
}
