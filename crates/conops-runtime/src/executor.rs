// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The compose executor: materializes an app's desired commit onto the local
//! runtime and introspects what is currently running.
//!
//! Apply produces a single transcript streamed through the progress callback
//! after each section and output chunk. Repo preparation shells out to git so
//! the transcript reads like the commands an operator would run by hand.

use std::collections::HashMap;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use conops_core::{ApplyError, ApplyRequest, ConopsError, ProgressFn, RuntimeApplier, RuntimeCleaner};
use conops_config::model::{RepoAuthConfig, RuntimeConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{merge_command_env, run_command, run_command_with_transcript};
use crate::project::project_name;
use crate::state::{parse_project_containers, parse_project_snapshot, ProjectRuntimeState, ServiceContainer};
use crate::toolchain::{Toolchain, ToolchainConfig};
use crate::transcript::Transcript;

/// Executes compose operations for all apps under a shared runtime directory.
pub struct ComposeExecutor {
    work_dir: PathBuf,
    known_hosts_file: Option<String>,
    toolchain: Toolchain,
}

impl ComposeExecutor {
    pub fn new(runtime: &RuntimeConfig, repo_auth: &RepoAuthConfig) -> Self {
        Self {
            work_dir: PathBuf::from(&runtime.runtime_dir),
            known_hosts_file: repo_auth.known_hosts_file.clone(),
            toolchain: Toolchain::new(ToolchainConfig {
                tools_dir: PathBuf::from(&runtime.tools_dir),
                docker_cli_path: runtime.docker_cli_path.clone(),
                docker_cli_version: runtime.docker_cli_version.clone(),
                compose_plugin_version: runtime.compose_plugin_version.clone(),
            }),
        }
    }

    /// Apply one app's desired state: checkout, pull, up.
    pub async fn apply(
        &self,
        request: ApplyRequest,
        cancel: CancellationToken,
        on_progress: Option<ProgressFn>,
    ) -> Result<String, ApplyError> {
        let transcript = Arc::new(Transcript::new());
        let emit = |transcript: &Arc<Transcript>| {
            if let Some(progress) = &on_progress {
                progress(&transcript.snapshot());
            }
        };
        let fail = |transcript: &Arc<Transcript>, err: ConopsError| {
            ApplyError::new(transcript.snapshot(), err)
        };

        let app_dir = match self.ensure_app_dir(&request.app_id) {
            Ok(dir) => dir,
            Err(err) => {
                transcript.section("Sync setup");
                transcript.line("failed to create runtime directory");
                transcript.line(&err.to_string());
                emit(&transcript);
                return Err(fail(&transcript, err));
            }
        };

        if request.repo_url.trim().is_empty() {
            transcript.section("Validation");
            transcript.line("repo url is empty");
            emit(&transcript);
            return Err(fail(
                &transcript,
                ConopsError::Validation("repo url is empty".to_string()),
            ));
        }
        if request.compose_path.trim().is_empty() {
            transcript.section("Validation");
            transcript.line("compose path is empty");
            emit(&transcript);
            return Err(fail(
                &transcript,
                ConopsError::Validation("compose path is empty".to_string()),
            ));
        }
        let branch = if request.branch.trim().is_empty() {
            "main".to_string()
        } else {
            request.branch.trim().to_string()
        };

        transcript.section("Sync started");
        transcript.line(&format!("app_id: {}", request.app_id));
        transcript.line(&format!("repository: {}", request.repo_url));
        transcript.line(&format!("branch: {branch}"));
        if request.commit_hash.trim().is_empty() {
            transcript.line("target_commit: latest on branch");
        } else {
            transcript.line(&format!("target_commit: {}", request.commit_hash));
        }
        emit(&transcript);

        transcript.section("Docker preflight");
        let resolution = match self.toolchain.resolve(&cancel).await {
            Ok(resolution) => resolution,
            Err(err) => {
                transcript.line("failed");
                transcript.line(&err.to_string());
                emit(&transcript);
                return Err(fail(
                    &transcript,
                    ConopsError::runtime(format!("docker preflight failed: {err}")),
                ));
            }
        };
        for line in resolution.log_lines() {
            transcript.line(&line);
        }
        emit(&transcript);

        let repo_dir = app_dir.join("repo");
        info!(
            app_id = %request.app_id,
            repo = %request.repo_url,
            branch = %branch,
            commit = %request.commit_hash,
            dir = %repo_dir.display(),
            "preparing repo"
        );
        if let Err(err) = self
            .prepare_repo(
                &transcript,
                &app_dir,
                &repo_dir,
                &request.repo_url,
                &branch,
                &request.commit_hash,
                request.deploy_key.as_deref().map(|k| k.as_slice()),
                &cancel,
                on_progress.clone(),
            )
            .await
        {
            emit(&transcript);
            return Err(fail(
                &transcript,
                ConopsError::Git {
                    message: "prepare repo failed".to_string(),
                    source: Some(Box::new(err)),
                },
            ));
        }
        emit(&transcript);

        let compose_full_path = repo_dir.join(&request.compose_path);
        let compose_dir = compose_full_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_dir.clone());
        if !compose_dir.is_dir() {
            transcript.section("Compose file");
            transcript.line(&format!(
                "compose directory does not exist: {}",
                compose_dir.display()
            ));
            emit(&transcript);
            return Err(fail(
                &transcript,
                ConopsError::runtime(format!(
                    "compose dir not found: {}",
                    compose_dir.display()
                )),
            ));
        }

        let mut wrote_compose = false;
        if !request.inline_content.trim().is_empty() {
            if let Err(err) = write_mode_0644(&compose_full_path, &request.inline_content) {
                transcript.section("Compose file");
                transcript.line(&format!(
                    "failed to write compose file: {}",
                    compose_full_path.display()
                ));
                transcript.line(&err.to_string());
                emit(&transcript);
                return Err(fail(&transcript, err));
            }
            wrote_compose = true;
        } else if !compose_full_path.is_file() {
            transcript.section("Compose file");
            transcript.line(&format!(
                "compose file not found: {}",
                compose_full_path.display()
            ));
            emit(&transcript);
            return Err(fail(
                &transcript,
                ConopsError::runtime(format!(
                    "compose file not found: {}",
                    compose_full_path.display()
                )),
            ));
        }

        let compose_file_name = compose_full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| request.compose_path.clone());
        let project = project_name(&request.app_id);

        transcript.section("Compose file");
        transcript.line(&format!("path: {}", compose_full_path.display()));
        transcript.line(&format!("written_from_request: {wrote_compose}"));
        emit(&transcript);

        let docker_env = merge_command_env(&request.env_vars, &resolution.env);

        transcript.section("Docker image pull");
        info!(app_id = %request.app_id, "pulling images");
        let pull_args = compose_args(&project, &compose_file_name, &["pull"]);
        if let Err(err) = run_command_with_transcript(
            &transcript,
            &resolution.path,
            &pull_args,
            &compose_dir,
            &docker_env,
            &cancel,
            on_progress.clone(),
        )
        .await
        {
            return Err(fail(
                &transcript,
                ConopsError::Runtime {
                    message: "pull failed".to_string(),
                    source: Some(Box::new(err)),
                },
            ));
        }

        transcript.section("Compose apply");
        transcript.line("build output appears below when services require a build");
        info!(app_id = %request.app_id, "applying configuration");
        let up_args = compose_args(&project, &compose_file_name, &["up", "-d", "--remove-orphans"]);
        if let Err(err) = run_command_with_transcript(
            &transcript,
            &resolution.path,
            &up_args,
            &compose_dir,
            &docker_env,
            &cancel,
            on_progress.clone(),
        )
        .await
        {
            return Err(fail(
                &transcript,
                ConopsError::Runtime {
                    message: "up failed".to_string(),
                    source: Some(Box::new(err)),
                },
            ));
        }

        transcript.section("Sync completed");
        transcript.line("application reconciled successfully");
        emit(&transcript);
        Ok(transcript.snapshot())
    }

    /// Tear down an app's containers and networks without removing volumes,
    /// then remove its runtime directory.
    pub async fn destroy(
        &self,
        app_id: &str,
        compose_path: &str,
        env_vars: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<String, ApplyError> {
        let project = project_name(app_id);
        let app_dir = self
            .ensure_app_dir(app_id)
            .map_err(|err| ApplyError::new(String::new(), err))?;
        let repo_dir = app_dir.join("repo");
        let compose_path = if compose_path.trim().is_empty() {
            "compose.yaml"
        } else {
            compose_path.trim()
        };
        let compose_full_path = repo_dir.join(compose_path);
        let compose_dir = compose_full_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_dir.clone());
        let compose_file_name = compose_full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| compose_path.to_string());

        let resolution = self
            .toolchain
            .resolve(&cancel)
            .await
            .map_err(|err| ApplyError::new(String::new(), err))?;
        let docker_env = merge_command_env(&env_vars, &resolution.env);

        let mut outputs: Vec<String> = Vec::new();
        let mut down_attempted = false;

        if compose_full_path.is_file() {
            down_attempted = true;
            info!(
                app_id = %app_id,
                project = %project,
                compose_file = %compose_full_path.display(),
                "stopping app stack"
            );
            let down_args =
                compose_args(&project, &compose_file_name, &["down", "--remove-orphans"]);
            match run_command(
                &resolution.path,
                &down_args,
                &compose_dir,
                &docker_env,
                &cancel,
                None,
            )
            .await
            {
                Ok(output) => push_output(&mut outputs, output),
                Err((output, err)) => {
                    push_output(&mut outputs, output);
                    return Err(ApplyError::new(
                        outputs.join("\n"),
                        ConopsError::Runtime {
                            message: "compose down failed".to_string(),
                            source: Some(Box::new(err)),
                        },
                    ));
                }
            }
        }

        // Fallback cleanup for lingering containers, including legacy runs
        // from before project naming.
        let container_ids = self
            .list_container_ids_for_cleanup(&resolution.path, &project, &compose_dir, &cancel)
            .await
            .map_err(|err| ApplyError::new(outputs.join("\n"), err))?;
        if !container_ids.is_empty() {
            info!(
                app_id = %app_id,
                containers = container_ids.len(),
                "removing lingering containers"
            );
            let mut rm_args = vec!["rm".to_string(), "-f".to_string()];
            rm_args.extend(container_ids.iter().cloned());
            match run_command(
                &resolution.path,
                &rm_args,
                &app_dir,
                &HashMap::new(),
                &cancel,
                None,
            )
            .await
            {
                Ok(output) => push_output(&mut outputs, output),
                Err((output, err)) => {
                    push_output(&mut outputs, output);
                    return Err(ApplyError::new(
                        outputs.join("\n"),
                        ConopsError::Runtime {
                            message: "docker rm failed".to_string(),
                            source: Some(Box::new(err)),
                        },
                    ));
                }
            }
        }

        if !down_attempted && container_ids.is_empty() {
            info!(app_id = %app_id, project = %project, "no running resources found for app");
        }

        if let Err(err) = std::fs::remove_dir_all(&app_dir) {
            warn!(
                app_id = %app_id,
                dir = %app_dir.display(),
                error = %err,
                "failed to remove app runtime directory"
            );
        }

        Ok(outputs.join("\n"))
    }

    /// Aggregate compose runtime status for all projects on this host.
    pub async fn snapshot_projects(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, ProjectRuntimeState>, ConopsError> {
        let resolution = self.toolchain.resolve(cancel).await?;
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--format".to_string(),
            r#"{{.Label "com.docker.compose.project"}}|{{.Label "com.docker.compose.oneoff"}}|{{.Status}}"#
                .to_string(),
        ];
        let output = run_command(
            &resolution.path,
            &args,
            &self.runtime_work_dir(),
            &resolution.env,
            cancel,
            None,
        )
        .await
        .map_err(|(_, err)| ConopsError::Runtime {
            message: "docker ps failed".to_string(),
            source: Some(Box::new(err)),
        })?;

        Ok(parse_project_snapshot(&output))
    }

    /// Detailed container listing for one compose project.
    pub async fn inspect_project_containers(
        &self,
        project: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ServiceContainer>, ConopsError> {
        if project.trim().is_empty() {
            return Ok(Vec::new());
        }

        let resolution = self.toolchain.resolve(cancel).await?;
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("label=com.docker.compose.project={project}"),
            "--filter".to_string(),
            "label=com.docker.compose.oneoff=False".to_string(),
            "--format".to_string(),
            r#"{{.Label "com.docker.compose.service"}}|{{.Image}}|{{.Status}}|{{.Ports}}|{{.Names}}"#
                .to_string(),
        ];
        let output = run_command(
            &resolution.path,
            &args,
            &self.runtime_work_dir(),
            &resolution.env,
            cancel,
            None,
        )
        .await
        .map_err(|(_, err)| ConopsError::Runtime {
            message: "docker ps failed".to_string(),
            source: Some(Box::new(err)),
        })?;

        Ok(parse_project_containers(&output))
    }

    /// Install the latest compose plugin and drop the cached resolution.
    pub async fn force_refresh_compose_plugin(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), ConopsError> {
        self.toolchain.force_refresh_compose_plugin(cancel).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn prepare_repo(
        &self,
        transcript: &Arc<Transcript>,
        app_dir: &Path,
        repo_dir: &Path,
        repo_url: &str,
        branch: &str,
        commit_hash: &str,
        deploy_key: Option<&[u8]>,
        cancel: &CancellationToken,
        on_progress: Option<ProgressFn>,
    ) -> Result<(), ConopsError> {
        transcript.section("Repository sync");

        let (git_env, _key_guard) = match self.build_git_env(app_dir, deploy_key).await {
            Ok(built) => built,
            Err(err) => {
                transcript.line("failed to configure git auth environment");
                transcript.line(&err.to_string());
                return Err(err);
            }
        };

        let commit_hash = commit_hash.trim();
        let git = |args: Vec<String>, dir: PathBuf| {
            let env = git_env.clone();
            let on_progress = on_progress.clone();
            let transcript = transcript.clone();
            let cancel = cancel.clone();
            async move {
                run_command_with_transcript(
                    &transcript,
                    "git",
                    &args,
                    &dir,
                    &env,
                    &cancel,
                    on_progress,
                )
                .await
                .map(|_| ())
            }
        };

        if !repo_dir.join(".git").exists() {
            transcript.line("repository cache missing; cloning fresh copy");
            let mut clone_args = vec![
                "clone".to_string(),
                "--branch".to_string(),
                branch.to_string(),
            ];
            if commit_hash.is_empty() {
                clone_args.push("--depth".to_string());
                clone_args.push("1".to_string());
            }
            clone_args.push(repo_url.to_string());
            clone_args.push(repo_dir.to_string_lossy().into_owned());
            git(clone_args, app_dir.to_path_buf()).await?;

            if !commit_hash.is_empty() {
                git(
                    vec!["checkout".to_string(), commit_hash.to_string()],
                    repo_dir.to_path_buf(),
                )
                .await?;
            }
            return Ok(());
        }

        transcript.line("repository cache found; fetching latest refs");
        git(
            vec!["fetch".to_string(), "origin".to_string()],
            repo_dir.to_path_buf(),
        )
        .await?;

        if !commit_hash.is_empty() {
            git(
                vec![
                    "fetch".to_string(),
                    "origin".to_string(),
                    commit_hash.to_string(),
                ],
                repo_dir.to_path_buf(),
            )
            .await?;
            git(
                vec!["checkout".to_string(), commit_hash.to_string()],
                repo_dir.to_path_buf(),
            )
            .await?;
            git(
                vec![
                    "reset".to_string(),
                    "--hard".to_string(),
                    commit_hash.to_string(),
                ],
                repo_dir.to_path_buf(),
            )
            .await?;
        } else {
            git(
                vec!["checkout".to_string(), branch.to_string()],
                repo_dir.to_path_buf(),
            )
            .await?;
            git(
                vec![
                    "reset".to_string(),
                    "--hard".to_string(),
                    format!("origin/{branch}"),
                ],
                repo_dir.to_path_buf(),
            )
            .await?;
        }

        git(
            vec!["clean".to_string(), "-fd".to_string()],
            repo_dir.to_path_buf(),
        )
        .await?;
        Ok(())
    }

    /// Build the git environment for a deploy-key checkout: write the key
    /// 0600 under `<app_dir>/.ssh` and point `GIT_SSH_COMMAND` at it. The
    /// returned guard deletes the key file when dropped.
    async fn build_git_env(
        &self,
        app_dir: &Path,
        deploy_key: Option<&[u8]>,
    ) -> Result<(HashMap<String, String>, Option<KeyFileGuard>), ConopsError> {
        let Some(deploy_key) = deploy_key.filter(|k| !k.is_empty()) else {
            return Ok((HashMap::new(), None));
        };

        let known_hosts_path =
            conops_repoauth::resolve_known_hosts_path(self.known_hosts_file.as_deref()).await?;

        let ssh_dir = app_dir.join(".ssh");
        std::fs::create_dir_all(&ssh_dir)
            .map_err(|err| ConopsError::runtime(format!("failed to create ssh dir: {err}")))?;
        let _ = std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700));

        let key_path = ssh_dir.join("deploy_key");
        write_key_file(&key_path, deploy_key)?;
        let guard = KeyFileGuard {
            path: key_path.clone(),
        };

        let mut env = HashMap::new();
        env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
        env.insert(
            "GIT_SSH_COMMAND".to_string(),
            conops_repoauth::build_ssh_command(&key_path, &known_hosts_path),
        );
        Ok((env, Some(guard)))
    }

    async fn list_container_ids_for_cleanup(
        &self,
        docker_path: &str,
        project: &str,
        legacy_working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ConopsError> {
        let mut ids = std::collections::BTreeSet::new();
        let work_dir = self.runtime_work_dir();

        let by_project = self
            .list_container_ids_by_filter(
                docker_path,
                &[format!("label=com.docker.compose.project={project}")],
                &work_dir,
                cancel,
            )
            .await?;
        ids.extend(by_project);

        let legacy = legacy_working_dir.to_string_lossy();
        if !legacy.trim().is_empty() {
            let by_working_dir = self
                .list_container_ids_by_filter(
                    docker_path,
                    &[format!(
                        "label=com.docker.compose.project.working_dir={legacy}"
                    )],
                    &work_dir,
                    cancel,
                )
                .await?;
            ids.extend(by_working_dir);
        }

        Ok(ids.into_iter().collect())
    }

    async fn list_container_ids_by_filter(
        &self,
        docker_path: &str,
        filters: &[String],
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ConopsError> {
        let mut args = vec!["ps".to_string(), "-aq".to_string()];
        for filter in filters {
            args.push("--filter".to_string());
            args.push(filter.clone());
        }

        let output = run_command(docker_path, &args, work_dir, &HashMap::new(), cancel, None)
            .await
            .map_err(|(_, err)| ConopsError::Runtime {
                message: "docker ps failed".to_string(),
                source: Some(Box::new(err)),
            })?;

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn ensure_app_dir(&self, app_id: &str) -> Result<PathBuf, ConopsError> {
        let app_dir = self.work_dir.join(app_id);
        let absolute = if app_dir.is_absolute() {
            app_dir
        } else {
            std::env::current_dir()
                .map_err(|err| {
                    ConopsError::runtime(format!("resolve app dir failed: {err}"))
                })?
                .join(app_dir)
        };
        std::fs::create_dir_all(&absolute)
            .map_err(|err| ConopsError::runtime(format!("failed to create app dir: {err}")))?;
        let _ = std::fs::set_permissions(&absolute, std::fs::Permissions::from_mode(0o755));
        Ok(absolute)
    }

    fn runtime_work_dir(&self) -> PathBuf {
        if self.work_dir.as_os_str().is_empty() || !self.work_dir.exists() {
            PathBuf::from(".")
        } else {
            self.work_dir.clone()
        }
    }
}

#[async_trait]
impl RuntimeApplier for ComposeExecutor {
    async fn apply(
        &self,
        request: ApplyRequest,
        cancel: CancellationToken,
        on_progress: Option<ProgressFn>,
    ) -> Result<String, ApplyError> {
        ComposeExecutor::apply(self, request, cancel, on_progress).await
    }
}

#[async_trait]
impl RuntimeCleaner for ComposeExecutor {
    async fn destroy(
        &self,
        app_id: &str,
        compose_path: &str,
        env_vars: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<String, ApplyError> {
        ComposeExecutor::destroy(self, app_id, compose_path, env_vars, cancel).await
    }
}

/// Removes the on-disk deploy key when the repo preparation scope ends.
struct KeyFileGuard {
    path: PathBuf,
}

impl Drop for KeyFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn compose_args(project: &str, compose_file: &str, tail: &[&str]) -> Vec<String> {
    let mut args = vec![
        "compose".to_string(),
        "-p".to_string(),
        project.to_string(),
        "-f".to_string(),
        compose_file.to_string(),
    ];
    args.extend(tail.iter().map(|s| s.to_string()));
    args
}

fn write_key_file(path: &Path, contents: &[u8]) -> Result<(), ConopsError> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|err| ConopsError::runtime(format!("failed to write deploy key file: {err}")))?;
    file.write_all(contents)
        .map_err(|err| ConopsError::runtime(format!("failed to write deploy key file: {err}")))?;
    Ok(())
}

fn write_mode_0644(path: &Path, contents: &str) -> Result<(), ConopsError> {
    std::fs::write(path, contents)
        .map_err(|err| ConopsError::runtime(format!("failed to write compose file: {err}")))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
        .map_err(|err| ConopsError::runtime(format!("failed to set compose file mode: {err}")))?;
    Ok(())
}

fn push_output(outputs: &mut Vec<String>, output: String) {
    let trimmed = output.trim();
    if !trimmed.is_empty() {
        outputs.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_executor(dir: &Path) -> ComposeExecutor {
        let runtime = RuntimeConfig {
            runtime_dir: dir.join("runtime").to_string_lossy().into_owned(),
            tools_dir: dir.join("tools").to_string_lossy().into_owned(),
            docker_cli_path: None,
            docker_cli_version: None,
            compose_plugin_version: None,
        };
        ComposeExecutor::new(&runtime, &RepoAuthConfig::default())
    }

    fn request(app_id: &str, repo_url: &str, compose_path: &str) -> ApplyRequest {
        ApplyRequest {
            app_id: app_id.to_string(),
            inline_content: String::new(),
            env_vars: HashMap::new(),
            repo_url: repo_url.to_string(),
            branch: "main".to_string(),
            compose_path: compose_path.to_string(),
            commit_hash: String::new(),
            deploy_key: None,
        }
    }

    #[tokio::test]
    async fn apply_rejects_empty_repo_url_with_transcript() {
        let dir = tempdir().unwrap();
        let executor = make_executor(dir.path());
        let err = executor
            .apply(
                request("app-1", "", "compose.yaml"),
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.transcript.contains("=== Validation ==="));
        assert!(err.transcript.contains("repo url is empty"));
        assert!(matches!(err.source, ConopsError::Validation(_)));
    }

    #[tokio::test]
    async fn apply_rejects_empty_compose_path() {
        let dir = tempdir().unwrap();
        let executor = make_executor(dir.path());
        let err = executor
            .apply(
                request("app-1", "https://example.com/x.git", ""),
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.transcript.contains("compose path is empty"));
    }

    #[tokio::test]
    async fn apply_creates_the_app_runtime_directory() {
        let dir = tempdir().unwrap();
        let executor = make_executor(dir.path());
        let _ = executor
            .apply(
                request("app-xyz", "", "compose.yaml"),
                CancellationToken::new(),
                None,
            )
            .await;
        assert!(dir.path().join("runtime/app-xyz").is_dir());
    }

    #[tokio::test]
    async fn progress_is_emitted_for_validation_failures() {
        let dir = tempdir().unwrap();
        let executor = make_executor(dir.path());
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let progress: ProgressFn = {
            let seen = seen.clone();
            Arc::new(move |value: &str| seen.lock().unwrap().push(value.to_string()))
        };
        let _ = executor
            .apply(
                request("app-1", "", "compose.yaml"),
                CancellationToken::new(),
                Some(progress),
            )
            .await;
        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.last().unwrap().contains("repo url is empty"));
    }

    #[test]
    fn key_file_guard_removes_the_key_on_drop() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("deploy_key");
        write_key_file(&key_path, b"key material").unwrap();
        assert!(key_path.exists());
        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(KeyFileGuard {
            path: key_path.clone(),
        });
        assert!(!key_path.exists());
    }

    #[test]
    fn compose_args_shape() {
        let args = compose_args("proj", "compose.yaml", &["up", "-d", "--remove-orphans"]);
        assert_eq!(
            args,
            vec![
                "compose",
                "-p",
                "proj",
                "-f",
                "compose.yaml",
                "up",
                "-d",
                "--remove-orphans"
            ]
        );
    }
}
