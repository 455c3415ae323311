// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Git watcher: per-app pollers that advance desired state.
//!
//! A supervisor wakes every ten seconds, reads the registry, starts a poller
//! task for every new app, and cancels pollers for removed apps. Each poller
//! fetches its repo into a cache checkout and, when the branch tip moves,
//! records the new desired commit -- which atomically requeues the app to
//! `pending`. Deploy keys are used in memory only; host keys are verified
//! strictly against the resolved known-hosts file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use conops_core::{App, ConopsError, RepoAuthMethod};
use conops_registry::Registry;
use conops_repoauth::known_host_keys;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{CertificateCheckStatus, Cred, FetchOptions, RemoteCallbacks, Repository};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// How often the supervisor re-reads the registry for added/removed apps.
const REGISTRY_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Poll interval applied when an app's own value fails to parse.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Monitors registered apps for new commits.
pub struct GitWatcher {
    registry: Arc<Registry>,
    cache_dir: PathBuf,
    known_hosts_file: Option<String>,
}

impl GitWatcher {
    pub fn new(
        registry: Arc<Registry>,
        cache_dir: impl Into<PathBuf>,
        known_hosts_file: Option<String>,
    ) -> Self {
        Self {
            registry,
            cache_dir: cache_dir.into(),
            known_hosts_file,
        }
    }

    /// Supervisor loop. Cancelling the token stops the supervisor and every
    /// child poller.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(REGISTRY_POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pollers: HashMap<String, CancellationToken> = HashMap::new();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    for (id, poller) in pollers.drain() {
                        poller.cancel();
                        debug!(app_id = %id, "poller cancelled on shutdown");
                    }
                    info!("git watcher stopped");
                    return;
                }
                _ = interval.tick() => {
                    let apps = match self.registry.list().await {
                        Ok(apps) => apps,
                        Err(err) => {
                            warn!(error = %err, "registry poll failed");
                            continue;
                        }
                    };
                    debug!(app_count = apps.len(), "registry poll tick");

                    let mut active: std::collections::HashSet<String> =
                        std::collections::HashSet::new();
                    for app in apps {
                        active.insert(app.id.clone());
                        if pollers.contains_key(&app.id) {
                            continue;
                        }
                        let poll_cancel = cancel.child_token();
                        pollers.insert(app.id.clone(), poll_cancel.clone());
                        info!(app_id = %app.id, interval = %app.poll_interval, "starting app poller");
                        let watcher = self.clone();
                        tokio::spawn(async move {
                            watcher.poll_app(app, poll_cancel).await;
                        });
                    }

                    pollers.retain(|id, poller| {
                        if active.contains(id) {
                            true
                        } else {
                            poller.cancel();
                            info!(app_id = %id, "stopped app poller");
                            false
                        }
                    });
                }
            }
        }
    }

    async fn poll_app(self: Arc<Self>, mut app: App, cancel: CancellationToken) {
        let interval = match humantime::parse_duration(&app.poll_interval) {
            Ok(parsed) if !parsed.is_zero() => parsed,
            _ => {
                warn!(
                    app_id = %app.id,
                    interval = %app.poll_interval,
                    "invalid poll interval, using default"
                );
                DEFAULT_POLL_INTERVAL
            }
        };

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate first tick.
        ticker.tick().await;

        info!(app_id = %app.id, repo = %app.repo_url, "started polling app");
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    debug!(app_id = %app.id, repo = %app.repo_url, branch = %app.branch, "polling repo");
                    if let Err(err) = self.check_repo(&mut app).await {
                        error!(app_id = %app.id, error = %err, "failed to check repo");
                    }
                }
            }
        }
    }

    /// One poll: fetch, resolve the branch tip, record a new desired commit.
    pub async fn check_repo(&self, app: &mut App) -> Result<(), ConopsError> {
        let repo_path = self.cache_dir.join(&app.id);

        let deploy_key = if app.repo_auth_method == RepoAuthMethod::DeployKey {
            let key = self.registry.get_deploy_key(&app.id).await?;
            if key.is_none() {
                return Err(ConopsError::Config(
                    "missing deploy key for app".to_string(),
                ));
            }
            key
        } else {
            None
        };

        let known_hosts = if deploy_key.is_some() {
            Some(
                conops_repoauth::resolve_known_hosts_path(self.known_hosts_file.as_deref())
                    .await?,
            )
        } else {
            None
        };

        let repo_url = app.repo_url.clone();
        let branch = app.branch.clone();
        let (commit_hash, commit_message) = tokio::task::spawn_blocking(move || {
            check_repo_blocking(&repo_path, &repo_url, &branch, deploy_key, known_hosts)
        })
        .await
        .map_err(|err| ConopsError::Internal(format!("watcher task panicked: {err}")))??;

        if commit_hash == app.last_seen_commit {
            debug!(app_id = %app.id, commit = %commit_hash, "no new commit detected");
            return Ok(());
        }

        info!(app_id = %app.id, commit = %commit_hash, "new commit detected");
        self.registry
            .update_commit_with_message(&app.id, &commit_hash, &commit_message)
            .await?;
        app.last_seen_commit = commit_hash;
        app.last_seen_commit_message = commit_message;
        Ok(())
    }
}

/// Blocking libgit2 work: clone-or-open the cache checkout, fetch all heads,
/// check out the remote branch tip, and report `(hash, subject)`.
fn check_repo_blocking(
    repo_path: &Path,
    repo_url: &str,
    branch: &str,
    deploy_key: Option<Zeroizing<Vec<u8>>>,
    known_hosts: Option<PathBuf>,
) -> Result<(String, String), ConopsError> {
    let repo = if repo_path.exists() {
        Repository::open(repo_path).map_err(git_err("open repository"))?
    } else {
        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch_options(&deploy_key, &known_hosts));
        builder
            .clone(repo_url, repo_path)
            .map_err(git_err("clone repository"))?
    };

    {
        let mut remote = repo
            .find_remote("origin")
            .map_err(git_err("find origin remote"))?;
        let mut options = fetch_options(&deploy_key, &known_hosts);
        remote
            .fetch(
                &["+refs/heads/*:refs/remotes/origin/*"],
                Some(&mut options),
                None,
            )
            .map_err(git_err("fetch origin"))?;
    }

    let reference = repo
        .find_reference(&format!("refs/remotes/origin/{branch}"))
        .map_err(git_err("remote branch not found"))?;
    let commit = reference
        .peel_to_commit()
        .map_err(git_err("resolve remote commit"))?;
    let oid = commit.id();

    let object = repo
        .find_object(oid, None)
        .map_err(git_err("lookup remote commit"))?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.checkout_tree(&object, Some(&mut checkout))
        .map_err(git_err("checkout remote commit"))?;
    repo.set_head_detached(oid)
        .map_err(git_err("detach head"))?;

    let head = repo
        .head()
        .map_err(git_err("resolve head"))?
        .peel_to_commit()
        .map_err(git_err("resolve head commit"))?;

    let hash = head.id().to_string();
    let subject = commit_subject(head.message().unwrap_or(""));
    Ok((hash, subject))
}

/// Fetch options with in-memory deploy-key credentials and a strict host-key
/// check backed by the known-hosts file.
fn fetch_options<'cb>(
    deploy_key: &'cb Option<Zeroizing<Vec<u8>>>,
    known_hosts: &'cb Option<PathBuf>,
) -> FetchOptions<'cb> {
    let mut callbacks = RemoteCallbacks::new();

    if let Some(key) = deploy_key {
        callbacks.credentials(move |_url, username_from_url, _allowed| {
            let key = std::str::from_utf8(key)
                .map_err(|_| git2::Error::from_str("deploy key is not valid UTF-8"))?;
            Cred::ssh_key_from_memory(username_from_url.unwrap_or("git"), None, key, None)
        });
    }

    if let Some(known_hosts_path) = known_hosts {
        callbacks.certificate_check(move |cert, host| {
            let Some(presented) = cert.as_hostkey().and_then(|hk| hk.hostkey()) else {
                // Not an SSH host key (e.g. TLS); leave default validation on.
                return Ok(CertificateCheckStatus::CertificatePassthrough);
            };
            let trusted = known_host_keys(known_hosts_path, host)
                .map_err(|err| git2::Error::from_str(&err.to_string()))?;
            if trusted.iter().any(|key| key.as_slice() == presented) {
                Ok(CertificateCheckStatus::CertificateOk)
            } else {
                Err(git2::Error::from_str(&format!(
                    "host key verification failed for {host}"
                )))
            }
        });
    }

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options
}

/// First non-empty line of a commit message, trimmed.
pub fn commit_subject(message: &str) -> String {
    message
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
        .to_string()
}

fn git_err(context: &'static str) -> impl Fn(git2::Error) -> ConopsError {
    move |err| ConopsError::Git {
        message: format!("{context}: {}", err.message()),
        source: Some(Box::new(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::tempdir;

    fn commit_file(
        repo: &Repository,
        name: &str,
        contents: &str,
        message: &str,
    ) -> git2::Oid {
        let workdir = repo.workdir().unwrap();
        std::fs::write(workdir.join(name), contents).unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();

        let signature = Signature::now("conops-test", "conops@example.com").unwrap();
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();

        repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parent_refs,
        )
        .unwrap()
    }

    fn init_origin(path: &Path) -> Repository {
        let mut options = git2::RepositoryInitOptions::new();
        options.initial_head("main");
        Repository::init_opts(path, &options).unwrap()
    }

    #[test]
    fn commit_subject_takes_first_non_empty_line() {
        assert_eq!(commit_subject("feat: add thing\n\nbody here"), "feat: add thing");
        assert_eq!(commit_subject("\n\n  second line first\nrest"), "second line first");
        assert_eq!(commit_subject("\r\nwindows subject\r\nbody"), "windows subject");
        assert_eq!(commit_subject(""), "");
    }

    #[test]
    fn check_repo_clones_and_resolves_the_branch_tip() {
        let dir = tempdir().unwrap();
        let origin_path = dir.path().join("origin");
        let origin = init_origin(&origin_path);
        let first = commit_file(&origin, "compose.yaml", "services: {}\n", "initial stack\n");

        let cache = dir.path().join("cache/app-1");
        let (hash, subject) = check_repo_blocking(
            &cache,
            origin_path.to_str().unwrap(),
            "main",
            None,
            None,
        )
        .unwrap();
        assert_eq!(hash, first.to_string());
        assert_eq!(subject, "initial stack");
        assert!(cache.join(".git").exists());
    }

    #[test]
    fn check_repo_detects_new_commits_on_refetch() {
        let dir = tempdir().unwrap();
        let origin_path = dir.path().join("origin");
        let origin = init_origin(&origin_path);
        commit_file(&origin, "compose.yaml", "services: {}\n", "initial stack\n");

        let cache = dir.path().join("cache/app-1");
        let (first_hash, _) = check_repo_blocking(
            &cache,
            origin_path.to_str().unwrap(),
            "main",
            None,
            None,
        )
        .unwrap();

        let second = commit_file(
            &origin,
            "compose.yaml",
            "services:\n  web: {}\n",
            "feat: add web service\n\ndetails\n",
        );
        let (second_hash, subject) = check_repo_blocking(
            &cache,
            origin_path.to_str().unwrap(),
            "main",
            None,
            None,
        )
        .unwrap();

        assert_ne!(first_hash, second_hash);
        assert_eq!(second_hash, second.to_string());
        assert_eq!(subject, "feat: add web service");
    }

    #[test]
    fn check_repo_fails_for_missing_branch() {
        let dir = tempdir().unwrap();
        let origin_path = dir.path().join("origin");
        let origin = init_origin(&origin_path);
        commit_file(&origin, "compose.yaml", "services: {}\n", "initial stack\n");

        let cache = dir.path().join("cache/app-1");
        let err = check_repo_blocking(
            &cache,
            origin_path.to_str().unwrap(),
            "release",
            None,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("remote branch not found"));
    }
}
