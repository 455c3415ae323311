// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Docker toolchain preflight and managed fallback.
//!
//! Before any compose command runs, the executor resolves a docker CLI whose
//! client API satisfies the local daemon's minimum, installing a managed
//! client from the vendor's static downloads when the system one is too old,
//! and ensures a compose plugin that actually talks to the daemon. The
//! resolution is cached for five minutes.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use conops_core::ConopsError;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::command::run_command_capture;

const DOCKER_RESOLUTION_TTL: Duration = Duration::from_secs(300);
const DOCKER_STATIC_DOWNLOAD_HOST: &str = "https://download.docker.com";
const DOCKER_COMPOSE_RELEASES_API: &str =
    "https://api.github.com/repos/docker/compose/releases/latest";

/// A resolved docker command: which binary to run, the extra environment it
/// needs, and everything the preflight learned about client and daemon.
#[derive(Debug, Clone, Default)]
pub struct DockerResolution {
    pub path: String,
    pub env: HashMap<String, String>,
    /// `system`, `managed:<version>`, or `custom`.
    pub source: String,
    pub client_version: String,
    pub client_api_version: String,
    pub daemon_version: String,
    pub daemon_api_version: String,
    pub daemon_min_api_version: String,
    pub compose_version: String,
}

impl DockerResolution {
    /// Transcript lines summarizing the resolution.
    pub fn log_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("docker_command: {}", self.path),
            format!("docker_source: {}", self.source),
            format!("docker_client_version: {}", fallback_value(&self.client_version)),
            format!("docker_client_api: {}", fallback_value(&self.client_api_version)),
            format!("docker_daemon_version: {}", fallback_value(&self.daemon_version)),
            format!("docker_daemon_api: {}", fallback_value(&self.daemon_api_version)),
            format!(
                "docker_daemon_min_api: {}",
                fallback_value(&self.daemon_min_api_version)
            ),
            format!(
                "docker_compose_version: {}",
                fallback_value(&self.compose_version)
            ),
        ];
        if let Some(config) = self.env.get("DOCKER_CONFIG").map(|v| v.trim()) {
            if !config.is_empty() {
                lines.push(format!("docker_config: {config}"));
            }
        }
        lines
    }
}

/// Parsed `docker version --format '{{json .}}'` output.
#[derive(Debug, Clone, Default)]
pub struct VersionProbe {
    pub client_version: String,
    pub client_api_version: String,
    pub server_version: String,
    pub server_api_version: String,
    pub server_min_api_version: String,
}

#[derive(Debug, Default, Deserialize)]
struct DockerVersionJson {
    #[serde(rename = "Client", default)]
    client: VersionSection,
    #[serde(rename = "Server", default)]
    server: VersionSection,
}

#[derive(Debug, Default, Deserialize)]
struct VersionSection {
    #[serde(rename = "Version", default)]
    version: String,
    // Older daemons spell the field APIVersion.
    #[serde(rename = "ApiVersion", alias = "APIVersion", default)]
    api_version: String,
    #[serde(rename = "MinAPIVersion", alias = "MinAPIVERSION", default)]
    min_api_version: String,
}

#[derive(Debug, Deserialize)]
struct ComposeRelease {
    #[serde(default)]
    tag_name: String,
    #[serde(default)]
    assets: Vec<ComposeAsset>,
}

#[derive(Debug, Deserialize)]
struct ComposeAsset {
    #[serde(default)]
    name: String,
    #[serde(default)]
    browser_download_url: String,
}

/// Parse the JSON version probe output.
pub fn parse_version_probe(output: &str) -> Result<VersionProbe, ConopsError> {
    let parsed: DockerVersionJson = serde_json::from_str(output.trim())
        .map_err(|e| ConopsError::runtime(format!("parse docker version output failed: {e}")))?;
    Ok(VersionProbe {
        client_version: parsed.client.version.trim().to_string(),
        client_api_version: parsed.client.api_version.trim().to_string(),
        server_version: parsed.server.version.trim().to_string(),
        server_api_version: parsed.server.api_version.trim().to_string(),
        server_min_api_version: parsed.server.min_api_version.trim().to_string(),
    })
}

/// Dotted-component numeric comparison (`1.44` vs `1.24`, `v` prefix and
/// pre-release suffixes tolerated).
pub fn compare_numeric_versions(a: &str, b: &str) -> Result<Ordering, ConopsError> {
    let a_parts = parse_numeric_version_parts(a)?;
    let b_parts = parse_numeric_version_parts(b)?;
    let len = a_parts.len().max(b_parts.len());
    for i in 0..len {
        let a_value = a_parts.get(i).copied().unwrap_or(0);
        let b_value = b_parts.get(i).copied().unwrap_or(0);
        match a_value.cmp(&b_value) {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(Ordering::Equal)
}

fn parse_numeric_version_parts(value: &str) -> Result<Vec<u64>, ConopsError> {
    let trimmed = value.trim().trim_start_matches('v');
    if trimmed.is_empty() {
        return Err(ConopsError::runtime(format!("invalid version {value:?}")));
    }
    trimmed
        .split('.')
        .map(|part| {
            let part = part.trim();
            let part = part.split('-').next().unwrap_or("");
            part.parse::<u64>()
                .map_err(|_| ConopsError::runtime(format!("invalid version {value:?}")))
        })
        .collect()
}

/// Client API ≥ daemon minimum API. An empty minimum is compatible; an empty
/// client version with a non-empty minimum is an error.
pub fn docker_api_compatible(client_api: &str, min_server_api: &str) -> Result<bool, ConopsError> {
    let client_api = client_api.trim();
    let min_server_api = min_server_api.trim();
    if min_server_api.is_empty() {
        return Ok(true);
    }
    if client_api.is_empty() {
        return Err(ConopsError::runtime(format!(
            "client API version is empty while daemon minimum API is {min_server_api}"
        )));
    }
    Ok(compare_numeric_versions(client_api, min_server_api)? != Ordering::Less)
}

/// Scrape `docker-<version>.tgz` links from the static download index,
/// deduplicated and sorted ascending by numeric version.
pub fn parse_static_versions(body: &str) -> Vec<String> {
    let re = Regex::new(r"docker-([0-9]+\.[0-9]+\.[0-9]+)\.tgz").expect("static version regex");
    let mut seen = std::collections::HashSet::new();
    let mut versions = Vec::new();
    for capture in re.captures_iter(body) {
        let version = capture[1].to_string();
        if seen.insert(version.clone()) {
            versions.push(version);
        }
    }
    versions.sort_by(|a, b| compare_numeric_versions(a, b).unwrap_or_else(|_| a.cmp(b)));
    versions
}

/// Some compose versions exit 0 but print API mismatch warnings to combined
/// output. Catch those so a plugin upgrade is triggered anyway.
pub fn output_looks_like_api_mismatch(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("client version") && lower.contains("minimum supported api version")
}

/// Compose release asset name for this platform.
pub fn compose_asset_name(os: &str, arch: &str) -> Result<String, ConopsError> {
    let arch = match arch {
        "x86_64" => "x86_64",
        "aarch64" => "aarch64",
        other => {
            return Err(ConopsError::runtime(format!(
                "unsupported compose plugin architecture: {other}"
            )));
        }
    };
    let os = match os {
        "linux" => "linux",
        "macos" => "darwin",
        other => {
            return Err(ConopsError::runtime(format!(
                "unsupported compose plugin os: {other}"
            )));
        }
    };
    Ok(format!("docker-compose-{os}-{arch}"))
}

/// Static-download index path for this platform.
pub fn docker_static_platform_path(os: &str, arch: &str) -> Result<String, ConopsError> {
    let arch = match arch {
        "x86_64" => "x86_64",
        "aarch64" => "aarch64",
        other => {
            return Err(ConopsError::runtime(format!(
                "unsupported docker static architecture: {other}"
            )));
        }
    };
    match os {
        "linux" => Ok(format!("linux/static/stable/{arch}")),
        "macos" => Ok(format!("mac/static/stable/{arch}")),
        other => Err(ConopsError::runtime(format!(
            "unsupported docker static os: {other}"
        ))),
    }
}

/// Find the sha256 recorded for `asset_name` in a `checksums.txt` body.
pub fn expected_checksum(checksums: &str, asset_name: &str) -> Option<String> {
    for line in checksums.lines() {
        let mut fields = line.split_whitespace();
        let (Some(sha), Some(name)) = (fields.next(), fields.next()) else {
            continue;
        };
        if name.trim_start_matches('*') == asset_name {
            return Some(sha.to_string());
        }
    }
    None
}

fn fallback_value(value: &str) -> &str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        "unknown"
    } else {
        trimmed
    }
}

/// Pinning knobs for the managed toolchain.
#[derive(Debug, Clone, Default)]
pub struct ToolchainConfig {
    pub tools_dir: PathBuf,
    pub docker_cli_path: Option<String>,
    pub docker_cli_version: Option<String>,
    pub compose_plugin_version: Option<String>,
}

struct CachedResolution {
    resolution: DockerResolution,
    at: Instant,
}

/// Resolves and caches the docker command used for all runtime operations.
pub struct Toolchain {
    config: ToolchainConfig,
    cache: tokio::sync::Mutex<Option<CachedResolution>>,
    http: reqwest::Client,
}

impl Toolchain {
    pub fn new(config: ToolchainConfig) -> Self {
        Self {
            config,
            cache: tokio::sync::Mutex::new(None),
            http: reqwest::Client::builder()
                .user_agent("conops")
                .build()
                .unwrap_or_default(),
        }
    }

    /// Resolve the docker command, consulting the TTL cache first. The
    /// cached copy is cloned on read so callers cannot mutate the cached
    /// env map.
    pub async fn resolve(&self, cancel: &CancellationToken) -> Result<DockerResolution, ConopsError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.at.elapsed() < DOCKER_RESOLUTION_TTL {
                return Ok(cached.resolution.clone());
            }
        }

        let resolution = self.build_resolution(cancel).await?;
        *cache = Some(CachedResolution {
            resolution: resolution.clone(),
            at: Instant::now(),
        });
        Ok(resolution)
    }

    /// Install the latest compose plugin and invalidate the cached
    /// resolution so the next command picks it up.
    pub async fn force_refresh_compose_plugin(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), ConopsError> {
        {
            let mut cache = self.cache.lock().await;
            *cache = None;
        }
        self.install_compose_plugin(cancel, true).await.map(|_| ())
    }

    async fn build_resolution(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DockerResolution, ConopsError> {
        let system_probe = probe_docker_version("docker", &HashMap::new(), cancel).await;
        if let Ok(probe) = &system_probe {
            if docker_api_compatible(&probe.client_api_version, &probe.server_min_api_version)? {
                let (compose_version, compose_env) =
                    self.ensure_compose_available(cancel, "docker").await?;
                return Ok(DockerResolution {
                    path: "docker".to_string(),
                    env: compose_env,
                    source: "system".to_string(),
                    client_version: probe.client_version.clone(),
                    client_api_version: probe.client_api_version.clone(),
                    daemon_version: probe.server_version.clone(),
                    daemon_api_version: probe.server_api_version.clone(),
                    daemon_min_api_version: probe.server_min_api_version.clone(),
                    compose_version,
                });
            }
        }

        let (managed_path, managed_version) = match self.ensure_managed_docker_cli(cancel).await {
            Ok(managed) => managed,
            Err(install_err) => {
                return Err(match system_probe {
                    Err(probe_err) => ConopsError::runtime(format!(
                        "system docker probe failed ({probe_err}) and managed docker install failed: {install_err}"
                    )),
                    Ok(probe) => ConopsError::runtime(format!(
                        "system docker client api {} is below daemon minimum {} and managed docker install failed: {install_err}",
                        fallback_value(&probe.client_api_version),
                        fallback_value(&probe.server_min_api_version),
                    )),
                });
            }
        };

        let managed_probe =
            probe_docker_version(&managed_path, &HashMap::new(), cancel)
                .await
                .map_err(|err| {
                    ConopsError::runtime(format!("managed docker probe failed: {err}"))
                })?;

        if !docker_api_compatible(
            &managed_probe.client_api_version,
            &managed_probe.server_min_api_version,
        )? {
            return Err(ConopsError::runtime(format!(
                "managed docker client api {} is older than daemon minimum {} (managed_cli={managed_version})",
                fallback_value(&managed_probe.client_api_version),
                fallback_value(&managed_probe.server_min_api_version),
            )));
        }

        let (compose_version, compose_env) =
            self.ensure_compose_available(cancel, &managed_path).await?;

        Ok(DockerResolution {
            path: managed_path,
            env: compose_env,
            source: format!("managed:{managed_version}"),
            client_version: managed_probe.client_version,
            client_api_version: managed_probe.client_api_version,
            daemon_version: managed_probe.server_version,
            daemon_api_version: managed_probe.server_api_version,
            daemon_min_api_version: managed_probe.server_min_api_version,
            compose_version,
        })
    }

    async fn ensure_compose_available(
        &self,
        cancel: &CancellationToken,
        docker_path: &str,
    ) -> Result<(String, HashMap<String, String>), ConopsError> {
        let no_env = HashMap::new();
        let version_result = probe_compose_version(docker_path, &no_env, cancel).await;
        if let Ok(version) = &version_result {
            match probe_compose_daemon_compatibility(docker_path, &no_env, cancel).await {
                Ok(()) => return Ok((version.clone(), HashMap::new())),
                Err(daemon_err) => {
                    if !output_looks_like_api_mismatch(&daemon_err.to_string()) {
                        return Err(ConopsError::runtime(format!(
                            "docker compose daemon compatibility check failed: {daemon_err}"
                        )));
                    }
                }
            }
        }

        let install_env = match self.install_compose_plugin(cancel, true).await {
            Ok(env) => env,
            Err(install_err) => {
                return Err(match version_result {
                    Err(version_err) => ConopsError::runtime(format!(
                        "docker compose plugin unavailable ({version_err}) and install failed: {install_err}"
                    )),
                    Ok(_) => ConopsError::runtime(format!(
                        "docker compose plugin is incompatible with daemon and refresh failed: {install_err}"
                    )),
                });
            }
        };

        let version = probe_compose_version(docker_path, &install_env, cancel)
            .await
            .map_err(|err| {
                ConopsError::runtime(format!(
                    "docker compose plugin check failed after install: {err}"
                ))
            })?;
        probe_compose_daemon_compatibility(docker_path, &install_env, cancel)
            .await
            .map_err(|err| {
                ConopsError::runtime(format!(
                    "docker compose daemon compatibility check failed after install: {err}"
                ))
            })?;
        Ok((version, install_env))
    }

    async fn ensure_managed_docker_cli(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(String, String), ConopsError> {
        if let Some(path) = self
            .config
            .docker_cli_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            if !Path::new(path).exists() {
                return Err(ConopsError::runtime(format!(
                    "configured docker_cli_path does not exist: {path}"
                )));
            }
            return Ok((path.to_string(), "custom".to_string()));
        }

        let platform_path =
            docker_static_platform_path(std::env::consts::OS, std::env::consts::ARCH)?;
        let base_url = format!("{DOCKER_STATIC_DOWNLOAD_HOST}/{platform_path}/");

        let candidate_versions: Vec<String> = if let Some(pinned) = self
            .config
            .docker_cli_version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            vec![pinned.to_string()]
        } else {
            let body = fetch_text(&self.http, &base_url).await.map_err(|err| {
                ConopsError::runtime(format!(
                    "failed to fetch docker static versions from {base_url}: {err}"
                ))
            })?;
            let versions = parse_static_versions(&body);
            if versions.is_empty() {
                return Err(ConopsError::runtime(format!(
                    "no docker static versions found at {base_url}"
                )));
            }
            // Newest five, newest first.
            versions.into_iter().rev().take(5).collect()
        };

        let tools_root = self.tools_root_dir()?;
        let mut install_errors = Vec::new();
        for version in &candidate_versions {
            match install_docker_binary_version(&self.http, &base_url, version, &tools_root, cancel)
                .await
            {
                Ok(binary_path) => {
                    info!(version = %version, path = %binary_path.display(), "managed docker cli installed");
                    return Ok((binary_path.to_string_lossy().into_owned(), version.clone()));
                }
                Err(err) => install_errors.push(format!("{version}: {err}")),
            }
        }

        Err(ConopsError::runtime(format!(
            "failed to install managed docker cli ({})",
            install_errors.join("; ")
        )))
    }

    async fn install_compose_plugin(
        &self,
        cancel: &CancellationToken,
        force: bool,
    ) -> Result<HashMap<String, String>, ConopsError> {
        if cancel.is_cancelled() {
            return Err(ConopsError::runtime("compose plugin install cancelled"));
        }
        let (plugin_dir, env_vars) = self.resolve_compose_plugin_directory()?;
        tokio::fs::create_dir_all(&plugin_dir).await.map_err(|err| {
            ConopsError::runtime(format!("create compose plugin directory failed: {err}"))
        })?;

        let plugin_path = plugin_dir.join("docker-compose");
        if plugin_path.is_file() && !force {
            return Ok(env_vars);
        }
        if force {
            let _ = tokio::fs::remove_file(&plugin_path).await;
        }

        let asset_name = compose_asset_name(std::env::consts::OS, std::env::consts::ARCH)?;
        let (binary_url, checksums_url) = match self
            .config
            .compose_plugin_version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            Some(tag) => {
                let tag = if tag.starts_with('v') {
                    tag.to_string()
                } else {
                    format!("v{tag}")
                };
                (
                    format!(
                        "https://github.com/docker/compose/releases/download/{tag}/{asset_name}"
                    ),
                    format!(
                        "https://github.com/docker/compose/releases/download/{tag}/checksums.txt"
                    ),
                )
            }
            None => {
                let release = fetch_latest_compose_release(&self.http).await?;
                if release.tag_name.trim().is_empty() {
                    return Err(ConopsError::runtime(
                        "latest compose release did not include a tag",
                    ));
                }
                let mut binary_url = String::new();
                let mut checksums_url = String::new();
                for asset in &release.assets {
                    if asset.name == asset_name {
                        binary_url = asset.browser_download_url.clone();
                    } else if asset.name == "checksums.txt" {
                        checksums_url = asset.browser_download_url.clone();
                    }
                }
                if binary_url.is_empty() {
                    binary_url = format!(
                        "https://github.com/docker/compose/releases/download/{}/{asset_name}",
                        release.tag_name
                    );
                }
                if checksums_url.is_empty() {
                    checksums_url = format!(
                        "https://github.com/docker/compose/releases/download/{}/checksums.txt",
                        release.tag_name
                    );
                }
                (binary_url, checksums_url)
            }
        };

        let temp_path = plugin_path.with_extension("tmp");
        let sha_hex = download_file(&self.http, &binary_url, &temp_path, 0o755)
            .await
            .map_err(|err| {
                ConopsError::runtime(format!("download compose plugin failed: {err}"))
            })?;

        let checksums = fetch_text(&self.http, &checksums_url).await.map_err(|err| {
            ConopsError::runtime(format!("fetch compose checksums failed: {err}"))
        })?;
        match expected_checksum(&checksums, &asset_name) {
            Some(expected) if expected.eq_ignore_ascii_case(&sha_hex) => {}
            Some(_) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(ConopsError::runtime(format!(
                    "compose checksum mismatch for {asset_name}"
                )));
            }
            None => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(ConopsError::runtime(format!(
                    "compose checksum for {asset_name} not found"
                )));
            }
        }

        tokio::fs::rename(&temp_path, &plugin_path)
            .await
            .map_err(|err| {
                ConopsError::runtime(format!("install compose plugin failed: {err}"))
            })?;
        set_executable(&plugin_path).await?;

        info!(path = %plugin_path.display(), "compose plugin installed");
        Ok(env_vars)
    }

    fn resolve_compose_plugin_directory(
        &self,
    ) -> Result<(PathBuf, HashMap<String, String>), ConopsError> {
        if let Ok(config_dir) = std::env::var("DOCKER_CONFIG") {
            let config_dir = config_dir.trim();
            if !config_dir.is_empty() {
                return Ok((PathBuf::from(config_dir).join("cli-plugins"), HashMap::new()));
            }
        }

        if let Some(home) = dirs_home() {
            let default_dir = home.join(".docker/cli-plugins");
            if std::fs::create_dir_all(&default_dir).is_ok() {
                return Ok((default_dir, HashMap::new()));
            }
        }

        let tools_root = self.tools_root_dir()?;
        let config_dir = tools_root.join("docker-config");
        std::fs::create_dir_all(&config_dir).map_err(|err| {
            ConopsError::runtime(format!("create docker config fallback failed: {err}"))
        })?;
        let mut env = HashMap::new();
        env.insert(
            "DOCKER_CONFIG".to_string(),
            config_dir.to_string_lossy().into_owned(),
        );
        Ok((config_dir.join("cli-plugins"), env))
    }

    fn tools_root_dir(&self) -> Result<PathBuf, ConopsError> {
        let root = if self.config.tools_dir.as_os_str().is_empty() {
            PathBuf::from("./.conops-tools")
        } else {
            self.config.tools_dir.clone()
        };
        let absolute = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map_err(|err| ConopsError::runtime(format!("resolve tools dir failed: {err}")))?
                .join(root)
        };
        std::fs::create_dir_all(&absolute)
            .map_err(|err| ConopsError::runtime(format!("create tools dir failed: {err}")))?;
        Ok(absolute)
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Probe a docker binary's client/daemon versions.
pub async fn probe_docker_version(
    docker_path: &str,
    env: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<VersionProbe, ConopsError> {
    let args = vec![
        "version".to_string(),
        "--format".to_string(),
        "{{json .}}".to_string(),
    ];
    let output = run_command_capture(docker_path, &args, env, cancel)
        .await
        .map_err(|(output, err)| {
            ConopsError::runtime(format!("{err}: {}", output.trim()))
        })?;
    parse_version_probe(&output)
}

/// Probe the compose plugin version, preferring `--short` output.
pub async fn probe_compose_version(
    docker_path: &str,
    env: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<String, ConopsError> {
    let short_args = vec![
        "compose".to_string(),
        "version".to_string(),
        "--short".to_string(),
    ];
    if let Ok(output) = run_command_capture(docker_path, &short_args, env, cancel).await {
        let version = output.trim().to_string();
        if !version.is_empty() {
            return Ok(version);
        }
    }

    let args = vec!["compose".to_string(), "version".to_string()];
    let output = run_command_capture(docker_path, &args, env, cancel)
        .await
        .map_err(|(output, err)| ConopsError::runtime(format!("{err}: {}", output.trim())))?;
    let line = output.trim();
    if line.is_empty() {
        return Err(ConopsError::runtime(
            "docker compose version returned empty output",
        ));
    }
    Ok(line
        .split_whitespace()
        .last()
        .unwrap_or(line)
        .to_string())
}

/// Run a lightweight compose listing that surfaces client/daemon API
/// mismatches even when the plugin exits 0.
pub async fn probe_compose_daemon_compatibility(
    docker_path: &str,
    env: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<(), ConopsError> {
    let args = vec!["compose".to_string(), "ls".to_string(), "--all".to_string()];
    let output = run_command_capture(docker_path, &args, env, cancel)
        .await
        .map_err(|(output, err)| ConopsError::runtime(format!("{err}: {}", output.trim())))?;
    if output_looks_like_api_mismatch(&output) {
        return Err(ConopsError::runtime(format!(
            "compose plugin reported API mismatch: {}",
            output.trim()
        )));
    }
    Ok(())
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String, ConopsError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| ConopsError::runtime(format!("request to {url} failed: {err}")))?;
    if !response.status().is_success() {
        return Err(ConopsError::runtime(format!(
            "request to {url} failed with status {}",
            response.status()
        )));
    }
    response
        .text()
        .await
        .map_err(|err| ConopsError::runtime(format!("reading {url} failed: {err}")))
}

async fn fetch_latest_compose_release(
    client: &reqwest::Client,
) -> Result<ComposeRelease, ConopsError> {
    let response = client
        .get(DOCKER_COMPOSE_RELEASES_API)
        .header("Accept", "application/vnd.github+json")
        .send()
        .await
        .map_err(|err| ConopsError::runtime(format!("compose release lookup failed: {err}")))?;
    if !response.status().is_success() {
        return Err(ConopsError::runtime(format!(
            "compose release lookup failed with status {}",
            response.status()
        )));
    }
    response
        .json()
        .await
        .map_err(|err| ConopsError::runtime(format!("compose release decode failed: {err}")))
}

/// Stream a download to `dest` with the given mode, returning its sha256.
async fn download_file(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    mode: u32,
) -> Result<String, ConopsError> {
    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|err| ConopsError::runtime(format!("download {url} failed: {err}")))?;
    if !response.status().is_success() {
        return Err(ConopsError::runtime(format!(
            "download {url} failed with status {}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|err| ConopsError::runtime(format!("create {} failed: {err}", dest.display())))?;
    let mut hasher = Sha256::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| ConopsError::runtime(format!("download {url} failed: {err}")))?
    {
        hasher.update(&chunk);
        file.write_all(&chunk).await.map_err(|err| {
            ConopsError::runtime(format!("write {} failed: {err}", dest.display()))
        })?;
    }
    file.flush()
        .await
        .map_err(|err| ConopsError::runtime(format!("flush {} failed: {err}", dest.display())))?;
    drop(file);

    tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|err| ConopsError::runtime(format!("chmod {} failed: {err}", dest.display())))?;

    Ok(format!("{:x}", hasher.finalize()))
}

/// Download `docker-<version>.tgz` and extract the client binary to
/// `<tools_root>/<version>/docker`. Reuses an existing install.
async fn install_docker_binary_version(
    client: &reqwest::Client,
    base_url: &str,
    version: &str,
    tools_root: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, ConopsError> {
    let install_dir = tools_root.join(version);
    let binary_path = install_dir.join("docker");
    if binary_path.is_file() {
        return Ok(binary_path);
    }

    if cancel.is_cancelled() {
        return Err(ConopsError::runtime("toolchain install cancelled"));
    }

    tokio::fs::create_dir_all(&install_dir).await.map_err(|err| {
        ConopsError::runtime(format!("create managed docker directory failed: {err}"))
    })?;

    let archive_url = format!("{base_url}docker-{version}.tgz");
    let archive_path = install_dir.join("docker.tgz.partial");
    download_file(client, &archive_url, &archive_path, 0o644).await?;

    let extract_archive = archive_path.clone();
    let extract_target = binary_path.clone();
    tokio::task::spawn_blocking(move || extract_docker_binary(&extract_archive, &extract_target))
        .await
        .map_err(|err| ConopsError::Internal(format!("extract task panicked: {err}")))??;

    let _ = tokio::fs::remove_file(&archive_path).await;
    Ok(binary_path)
}

/// Pull the `docker` entry out of the release archive, writing it
/// tmp-then-rename with the executable bit set.
fn extract_docker_binary(archive_path: &Path, binary_path: &Path) -> Result<(), ConopsError> {
    let file = std::fs::File::open(archive_path)
        .map_err(|err| ConopsError::runtime(format!("open docker archive failed: {err}")))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    let temp_path = binary_path.with_extension("tmp");
    let _ = std::fs::remove_file(&temp_path);

    let mut found = false;
    for entry in archive
        .entries()
        .map_err(|err| ConopsError::runtime(format!("read docker archive failed: {err}")))?
    {
        let mut entry = entry
            .map_err(|err| ConopsError::runtime(format!("read docker archive failed: {err}")))?;
        let path = entry
            .path()
            .map_err(|err| ConopsError::runtime(format!("read docker archive failed: {err}")))?
            .into_owned();
        if path.file_name().and_then(|n| n.to_str()) != Some("docker") {
            continue;
        }

        let mut out = std::fs::File::create(&temp_path).map_err(|err| {
            ConopsError::runtime(format!("create docker binary temp file failed: {err}"))
        })?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|err| ConopsError::runtime(format!("extract docker binary failed: {err}")))?;
        found = true;
        break;
    }

    if !found {
        let _ = std::fs::remove_file(&temp_path);
        return Err(ConopsError::runtime(
            "docker archive did not include docker binary",
        ));
    }

    std::fs::rename(&temp_path, binary_path)
        .map_err(|err| ConopsError::runtime(format!("install docker binary failed: {err}")))?;
    std::fs::set_permissions(binary_path, std::fs::Permissions::from_mode(0o755))
        .map_err(|err| {
            ConopsError::runtime(format!("set docker binary executable bit failed: {err}"))
        })?;
    Ok(())
}

async fn set_executable(path: &Path) -> Result<(), ConopsError> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|err| {
            ConopsError::runtime(format!("set compose plugin executable bit failed: {err}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_probe_parses_modern_and_legacy_field_names() {
        let modern = r#"{
            "Client": {"Version": "27.3.1", "ApiVersion": "1.47"},
            "Server": {"Version": "24.0.7", "ApiVersion": "1.43", "MinAPIVersion": "1.12"}
        }"#;
        let probe = parse_version_probe(modern).unwrap();
        assert_eq!(probe.client_version, "27.3.1");
        assert_eq!(probe.client_api_version, "1.47");
        assert_eq!(probe.server_min_api_version, "1.12");

        let legacy = r#"{
            "Client": {"Version": "20.10.5", "APIVersion": "1.41"},
            "Server": {"Version": "20.10.5", "APIVersion": "1.41", "MinAPIVERSION": "1.12"}
        }"#;
        let probe = parse_version_probe(legacy).unwrap();
        assert_eq!(probe.client_api_version, "1.41");
        assert_eq!(probe.server_min_api_version, "1.12");
    }

    #[test]
    fn version_probe_tolerates_missing_server_section() {
        let probe = parse_version_probe(r#"{"Client": {"Version": "27.0.1"}}"#).unwrap();
        assert_eq!(probe.client_version, "27.0.1");
        assert_eq!(probe.server_min_api_version, "");
    }

    #[test]
    fn numeric_version_comparison() {
        assert_eq!(
            compare_numeric_versions("1.47", "1.12").unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            compare_numeric_versions("1.12", "1.12").unwrap(),
            Ordering::Equal
        );
        // Component-wise, not lexicographic: 1.9 < 1.12.
        assert_eq!(
            compare_numeric_versions("1.9", "1.12").unwrap(),
            Ordering::Less
        );
        // Missing components count as zero.
        assert_eq!(
            compare_numeric_versions("1.2", "1.2.0").unwrap(),
            Ordering::Equal
        );
        // v prefix and pre-release suffixes are tolerated.
        assert_eq!(
            compare_numeric_versions("v2.0.0", "2.0.0-rc1").unwrap(),
            Ordering::Equal
        );
        assert!(compare_numeric_versions("", "1.0").is_err());
        assert!(compare_numeric_versions("abc", "1.0").is_err());
    }

    #[test]
    fn api_compatibility_rules() {
        assert!(docker_api_compatible("1.47", "1.12").unwrap());
        assert!(docker_api_compatible("1.12", "1.12").unwrap());
        assert!(!docker_api_compatible("1.11", "1.12").unwrap());
        // Empty minimum is treated as compatible.
        assert!(docker_api_compatible("", "").unwrap());
        assert!(docker_api_compatible("1.0", "").unwrap());
        // Empty client with a real minimum is an error.
        assert!(docker_api_compatible("", "1.12").is_err());
    }

    #[test]
    fn static_versions_are_deduped_and_numerically_sorted() {
        let html = r#"
            <a href="docker-27.3.1.tgz">docker-27.3.1.tgz</a>
            <a href="docker-27.10.0.tgz">docker-27.10.0.tgz</a>
            <a href="docker-27.3.1.tgz">docker-27.3.1.tgz</a>
            <a href="docker-27.9.2.tgz">docker-27.9.2.tgz</a>
        "#;
        let versions = parse_static_versions(html);
        assert_eq!(versions, vec!["27.3.1", "27.9.2", "27.10.0"]);
    }

    #[test]
    fn api_mismatch_detection_scans_combined_output() {
        let output = "Error response from daemon: client version 1.52 is too new. \
                      Minimum supported API version is 1.24";
        assert!(output_looks_like_api_mismatch(output));
        assert!(!output_looks_like_api_mismatch("NAME STATUS CONFIG FILES"));
    }

    #[test]
    fn asset_and_platform_names() {
        assert_eq!(
            compose_asset_name("linux", "x86_64").unwrap(),
            "docker-compose-linux-x86_64"
        );
        assert_eq!(
            compose_asset_name("macos", "aarch64").unwrap(),
            "docker-compose-darwin-aarch64"
        );
        assert!(compose_asset_name("windows", "x86_64").is_err());

        assert_eq!(
            docker_static_platform_path("linux", "aarch64").unwrap(),
            "linux/static/stable/aarch64"
        );
        assert_eq!(
            docker_static_platform_path("macos", "x86_64").unwrap(),
            "mac/static/stable/x86_64"
        );
    }

    #[test]
    fn checksum_lookup_handles_binary_markers() {
        let checksums = "\
abc123  docker-compose-linux-x86_64
def456 *docker-compose-darwin-aarch64
";
        assert_eq!(
            expected_checksum(checksums, "docker-compose-linux-x86_64").unwrap(),
            "abc123"
        );
        assert_eq!(
            expected_checksum(checksums, "docker-compose-darwin-aarch64").unwrap(),
            "def456"
        );
        assert!(expected_checksum(checksums, "missing").is_none());
    }

    #[test]
    fn resolution_log_lines_report_unknowns_and_docker_config() {
        let mut resolution = DockerResolution {
            path: "docker".into(),
            source: "system".into(),
            client_version: "27.3.1".into(),
            ..Default::default()
        };
        let lines = resolution.log_lines();
        assert!(lines.contains(&"docker_command: docker".to_string()));
        assert!(lines.contains(&"docker_daemon_min_api: unknown".to_string()));
        assert!(!lines.iter().any(|l| l.starts_with("docker_config:")));

        resolution
            .env
            .insert("DOCKER_CONFIG".into(), "/tools/docker-config".into());
        let lines = resolution.log_lines();
        assert!(lines.contains(&"docker_config: /tools/docker-config".to_string()));
    }
}
