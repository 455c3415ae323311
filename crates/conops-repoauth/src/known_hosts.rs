// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host-key trust resolution.
//!
//! The known-hosts file used for strict SSH verification is picked in order:
//! an explicit path from configuration, the user's `~/.ssh/known_hosts`, the
//! system `/etc/ssh/ssh_known_hosts`, and finally a file bootstrapped from
//! GitHub's metadata endpoint. Fetching live keys is a convenience; on any
//! network failure the vendored key set below is used instead. The generated
//! file is written `.tmp`-then-rename for atomic replacement.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use conops_core::ConopsError;
use serde::Deserialize;
use ssh_key::PublicKey;
use tracing::{debug, warn};

const GITHUB_META_URL: &str = "https://api.github.com/meta";
const GITHUB_META_TIMEOUT: Duration = Duration::from_secs(10);

/// GitHub's published SSH host keys, vendored as the offline fallback.
const GITHUB_FALLBACK_SSH_KEYS: &[&str] = &[
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl",
    "ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBEmKSENjQEezOmxkZMy7opKgwFB9nkt5YRrYMjNuG5N87uRgg6CLrbo5wAdT/y6v0mKV0U2w0WZ2YB/++Tpockg=",
    "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABgQCj7ndNxQowgcQnjshcLrqPEiiphnt+VTTvDP6mHBL9j1aNUkY4Ue1gvwnGLVlOhGeYrnZaMgRK6+PKCUXaDbC7qtbW8gIkhL7aGCsOr/C56SJMy/BCZfxd1nWzAOxSDPgVsmerOBYfNqltV9/hWCqBywINIR+5dIg6JTJ72pcEpEjcYgXkE2YEFXV1JHnsKgbLWNlhScqb2UmyRkQyytRLtL+38TGxkxCflmO+5Z8CSSNY7GidjMIZ7Q4zMjA2n1nGrlTDkzwDCsw+wqFPGQA179cnfGWOWRVruj16z6XyvxvjJwbz0wQZ75XK5tKSb7FNyeIEs4TT4jk+S4dhPeAUC5y+bDYirYgM4GC7uEnztnZyaVWQ7B381AK4Qdrwt51ZqExKbQpTUNn+EjqoTwvqNj4kqx5QUCI0ThS/YkOxJCXmPUWZbhjpCg56i+2aB6CmK2JGhn57K5mj0MNdBXA4/WnwH6XoPWJzK5Nyu2zB3nAZp+S5hpQs+p1vN1/wsjk=",
];

static GENERATED_KNOWN_HOSTS: Mutex<Option<PathBuf>> = Mutex::new(None);

#[derive(Debug, Deserialize)]
struct GithubMeta {
    #[serde(default)]
    ssh_keys: Vec<String>,
}

/// Resolve the known-hosts file used for strict host verification.
pub async fn resolve_known_hosts_path(
    configured: Option<&str>,
) -> Result<PathBuf, ConopsError> {
    if let Some(path) = configured.map(str::trim).filter(|p| !p.is_empty()) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
        return Err(ConopsError::Config(format!(
            "configured known_hosts file is invalid: {}",
            path.display()
        )));
    }

    if let Some(home) = dirs::home_dir() {
        let user_path = home.join(".ssh/known_hosts");
        if user_path.is_file() {
            return Ok(user_path);
        }
    }

    let system_path = PathBuf::from("/etc/ssh/ssh_known_hosts");
    if system_path.is_file() {
        return Ok(system_path);
    }

    {
        let generated = GENERATED_KNOWN_HOSTS.lock().expect("known-hosts lock poisoned");
        if let Some(path) = generated.as_ref() {
            if path.is_file() {
                return Ok(path.clone());
            }
        }
    }

    let keys = match fetch_github_ssh_keys().await {
        Ok(keys) if !keys.is_empty() => keys,
        Ok(_) | Err(_) => {
            warn!("falling back to vendored GitHub host keys");
            GITHUB_FALLBACK_SSH_KEYS
                .iter()
                .map(|k| k.to_string())
                .collect()
        }
    };

    let path = write_known_hosts_file(&keys)?;
    let mut generated = GENERATED_KNOWN_HOSTS.lock().expect("known-hosts lock poisoned");
    *generated = Some(path.clone());
    Ok(path)
}

async fn fetch_github_ssh_keys() -> Result<Vec<String>, ConopsError> {
    let client = reqwest::Client::builder()
        .timeout(GITHUB_META_TIMEOUT)
        .user_agent("conops")
        .build()
        .map_err(|err| ConopsError::Internal(format!("http client build failed: {err}")))?;

    let response = client
        .get(GITHUB_META_URL)
        .header("Accept", "application/vnd.github+json")
        .send()
        .await
        .map_err(|err| ConopsError::git(format!("github metadata request failed: {err}")))?;

    if !response.status().is_success() {
        return Err(ConopsError::git(format!(
            "github metadata request failed with status {}",
            response.status()
        )));
    }

    let meta: GithubMeta = response
        .json()
        .await
        .map_err(|err| ConopsError::git(format!("failed decoding github metadata: {err}")))?;
    debug!(keys = meta.ssh_keys.len(), "fetched github host keys");
    Ok(meta.ssh_keys)
}

/// Write `github.com <key>` lines to a 0600 file in a 0700 process-local
/// directory, atomically.
fn write_known_hosts_file(keys: &[String]) -> Result<PathBuf, ConopsError> {
    for key in keys {
        PublicKey::from_openssh(key).map_err(|err| {
            ConopsError::Config(format!(
                "invalid ssh key material for known_hosts generation: {err}"
            ))
        })?;
    }

    let dir = std::env::temp_dir().join("conops-known-hosts");
    fs::create_dir_all(&dir).map_err(|err| {
        ConopsError::Config(format!("failed creating known_hosts dir: {err}"))
    })?;
    let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700));

    let mut contents = String::new();
    for key in keys {
        contents.push_str("github.com ");
        contents.push_str(key.trim());
        contents.push('\n');
    }

    let path = dir.join("known_hosts");
    let temp_path = dir.join("known_hosts.tmp");
    fs::write(&temp_path, contents).map_err(|err| {
        ConopsError::Config(format!("failed writing known_hosts file: {err}"))
    })?;
    fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600)).map_err(|err| {
        ConopsError::Config(format!("failed setting known_hosts mode: {err}"))
    })?;
    fs::rename(&temp_path, &path).map_err(|err| {
        ConopsError::Config(format!("failed finalizing known_hosts file: {err}"))
    })?;

    Ok(path)
}

/// Decode the raw key blobs recorded for `host` in a known-hosts file.
///
/// Hashed entries are skipped; the files ConOps generates use plain host
/// names. Used by the watcher's certificate check to compare the server's
/// presented host key byte-for-byte.
pub fn known_host_keys(path: &Path, host: &str) -> Result<Vec<Vec<u8>>, ConopsError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        ConopsError::Config(format!(
            "failed reading known_hosts {}: {err}",
            path.display()
        ))
    })?;

    let mut keys = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('|') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(hosts), Some(_key_type), Some(key_b64)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !hosts.split(',').any(|h| h.eq_ignore_ascii_case(host)) {
            continue;
        }
        if let Ok(blob) = BASE64.decode(key_b64) {
            keys.push(blob);
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn vendored_keys_are_valid_openssh_public_keys() {
        for key in GITHUB_FALLBACK_SSH_KEYS {
            PublicKey::from_openssh(key).expect("vendored key must parse");
        }
    }

    #[test]
    fn generated_file_has_plain_github_entries_and_strict_mode() {
        let keys: Vec<String> = GITHUB_FALLBACK_SSH_KEYS
            .iter()
            .map(|k| k.to_string())
            .collect();
        let path = write_known_hosts_file(&keys).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.lines().all(|l| l.starts_with("github.com ")));

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn invalid_key_material_is_rejected_before_writing() {
        let keys = vec!["ssh-ed25519 not-base64!!".to_string()];
        assert!(write_known_hosts_file(&keys).is_err());
    }

    #[test]
    fn known_host_keys_filters_by_host() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let mut contents = String::new();
        contents.push_str(&format!("github.com {}\n", GITHUB_FALLBACK_SSH_KEYS[0]));
        contents.push_str(&format!("example.com {}\n", GITHUB_FALLBACK_SSH_KEYS[1]));
        contents.push_str("# comment line\n");
        fs::write(&path, contents).unwrap();

        let keys = known_host_keys(&path, "github.com").unwrap();
        assert_eq!(keys.len(), 1);

        let expected = GITHUB_FALLBACK_SSH_KEYS[0]
            .split_whitespace()
            .nth(1)
            .unwrap();
        assert_eq!(keys[0], BASE64.decode(expected).unwrap());

        assert!(known_host_keys(&path, "nowhere.test").unwrap().is_empty());
    }

    #[tokio::test]
    async fn configured_path_must_exist() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");
        let result = resolve_known_hosts_path(Some(missing.to_str().unwrap())).await;
        assert!(result.is_err());

        let present = dir.path().join("known_hosts");
        fs::write(&present, "github.com ssh-ed25519 AAAA\n").unwrap();
        let resolved = resolve_known_hosts_path(Some(present.to_str().unwrap()))
            .await
            .unwrap();
        assert_eq!(resolved, present);
    }
}
