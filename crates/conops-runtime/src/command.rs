// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subprocess execution with merged, streamed output and cancellation.
//!
//! Stdout and stderr are piped separately but feed the same accumulator, so
//! the transcript interleaves them roughly the way a terminal would.
//! Cancelling the token kills the child; the output captured so far is still
//! returned alongside the error.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use conops_core::{ConopsError, ProgressFn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::transcript::{format_command, truncate_output, Transcript};

/// Callback receiving each non-empty output chunk as it arrives.
pub type OnChunk = Arc<dyn Fn(&str) + Send + Sync>;

/// Run a subprocess to completion, streaming merged stdout+stderr.
///
/// Returns the captured output. A non-zero exit, spawn failure, or
/// cancellation yields `Err((output_so_far, error))`.
pub async fn run_command(
    program: &str,
    args: &[String],
    work_dir: &Path,
    env: &HashMap<String, String>,
    cancel: &CancellationToken,
    on_chunk: Option<OnChunk>,
) -> Result<String, (String, ConopsError)> {
    let rendered = format_command(program, args);
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        command.env(key, value);
    }

    info!(
        cmd = %rendered,
        dir = %work_dir.display(),
        env_keys = ?sorted_keys(env),
        "executing command"
    );

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return Err((
                String::new(),
                ConopsError::Runtime {
                    message: format!("command start failed: {rendered}"),
                    source: Some(Box::new(err)),
                },
            ));
        }
    };

    let collected = Arc::new(Mutex::new(String::new()));
    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, collected.clone(), on_chunk.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, collected.clone(), on_chunk.clone()));
    }

    let wait_result = tokio::select! {
        status = child.wait() => Some(status),
        () = cancel.cancelled() => None,
    };

    let Some(status) = wait_result else {
        let _ = child.start_kill();
        let _ = child.wait().await;
        for reader in readers {
            let _ = reader.await;
        }
        let output = take_output(&collected);
        error!(cmd = %rendered, "command cancelled");
        return Err((
            output,
            ConopsError::runtime(format!("command cancelled: {rendered}")),
        ));
    };

    for reader in readers {
        let _ = reader.await;
    }
    let output = take_output(&collected);

    let trimmed = output.trim();
    if !trimmed.is_empty() {
        info!(cmd = %rendered, output = %truncate_output(trimmed), "command output");
    }

    match status {
        Ok(status) if status.success() => {
            info!(
                cmd = %rendered,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "command succeeded"
            );
            Ok(output)
        }
        Ok(status) => {
            let exit_code = status.code().unwrap_or(-1);
            error!(
                cmd = %rendered,
                dir = %work_dir.display(),
                exit_code,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "command failed"
            );
            Err((
                output,
                ConopsError::runtime(format!(
                    "command failed with exit code {exit_code}: {rendered}"
                )),
            ))
        }
        Err(err) => Err((
            output,
            ConopsError::Runtime {
                message: format!("command wait failed: {rendered}"),
                source: Some(Box::new(err)),
            },
        )),
    }
}

/// Run a command while appending `$ command`, its output, a `(no output)`
/// placeholder, and any error to the transcript, invoking the progress
/// callback after each addition.
pub async fn run_command_with_transcript(
    transcript: &Arc<Transcript>,
    program: &str,
    args: &[String],
    work_dir: &Path,
    env: &HashMap<String, String>,
    cancel: &CancellationToken,
    on_progress: Option<ProgressFn>,
) -> Result<String, ConopsError> {
    transcript.command(&format_command(program, args));
    emit(transcript, &on_progress);

    let saw_output = Arc::new(AtomicBool::new(false));
    let on_chunk: OnChunk = {
        let transcript = transcript.clone();
        let on_progress = on_progress.clone();
        let saw_output = saw_output.clone();
        Arc::new(move |chunk: &str| {
            if chunk.is_empty() {
                return;
            }
            transcript.raw(chunk);
            saw_output.store(true, Ordering::SeqCst);
            if let Some(progress) = &on_progress {
                progress(&transcript.snapshot());
            }
        })
    };

    let result = run_command(program, args, work_dir, env, cancel, Some(on_chunk)).await;

    if !saw_output.load(Ordering::SeqCst) {
        transcript.raw("(no output)\n");
        emit(transcript, &on_progress);
    }

    match result {
        Ok(output) => Ok(output),
        Err((_, err)) => {
            transcript.raw(&format!("ERROR: {err}\n"));
            emit(transcript, &on_progress);
            Err(err)
        }
    }
}

/// Capture combined output without streaming; used for version probes.
pub async fn run_command_capture(
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<String, (String, ConopsError)> {
    run_command(program, args, Path::new("."), env, cancel, None).await
}

fn emit(transcript: &Arc<Transcript>, on_progress: &Option<ProgressFn>) {
    if let Some(progress) = on_progress {
        progress(&transcript.snapshot());
    }
}

fn spawn_reader<R>(
    mut reader: R,
    collected: Arc<Mutex<String>>,
    on_chunk: Option<OnChunk>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
            collected
                .lock()
                .expect("output lock poisoned")
                .push_str(&chunk);
            if let Some(callback) = &on_chunk {
                callback(&chunk);
            }
        }
    })
}

fn take_output(collected: &Arc<Mutex<String>>) -> String {
    collected.lock().expect("output lock poisoned").clone()
}

fn sorted_keys(values: &HashMap<String, String>) -> Vec<String> {
    let mut keys: Vec<String> = values.keys().cloned().collect();
    keys.sort();
    keys
}

/// Merge resolution env with caller env; caller env wins on key conflicts.
pub fn merge_command_env(
    caller: &HashMap<String, String>,
    resolution: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = resolution.clone();
    for (key, value) in caller {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn captures_merged_output_and_succeeds() {
        let cancel = CancellationToken::new();
        let output = run_command(
            "sh",
            &["-c".to_string(), "echo out; echo err 1>&2".to_string()],
            Path::new("."),
            &HashMap::new(),
            &cancel,
            None,
        )
        .await
        .unwrap();
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[tokio::test]
    async fn nonzero_exit_returns_output_and_error() {
        let cancel = CancellationToken::new();
        let (output, err) = run_command(
            "sh",
            &["-c".to_string(), "echo partial; exit 3".to_string()],
            Path::new("."),
            &HashMap::new(),
            &cancel,
            None,
        )
        .await
        .unwrap_err();
        assert!(output.contains("partial"));
        assert!(err.to_string().contains("exit code 3"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child_and_keeps_partial_output() {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel_clone.cancel();
        });

        let started = Instant::now();
        let (output, err) = run_command(
            "sh",
            &["-c".to_string(), "echo early; sleep 30".to_string()],
            Path::new("."),
            &HashMap::new(),
            &cancel,
            None,
        )
        .await
        .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(output.contains("early"));
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn env_is_passed_to_the_child() {
        let cancel = CancellationToken::new();
        let mut env = HashMap::new();
        env.insert("CONOPS_TEST_VALUE".to_string(), "forty-two".to_string());
        let output = run_command(
            "sh",
            &["-c".to_string(), "echo $CONOPS_TEST_VALUE".to_string()],
            Path::new("."),
            &env,
            &cancel,
            None,
        )
        .await
        .unwrap();
        assert!(output.contains("forty-two"));
    }

    #[tokio::test]
    async fn transcript_records_command_output_and_placeholder() {
        let cancel = CancellationToken::new();
        let transcript = Arc::new(Transcript::new());
        run_command_with_transcript(
            &transcript,
            "sh",
            &["-c".to_string(), "echo hello".to_string()],
            Path::new("."),
            &HashMap::new(),
            &cancel,
            None,
        )
        .await
        .unwrap();

        run_command_with_transcript(
            &transcript,
            "true",
            &[],
            Path::new("."),
            &HashMap::new(),
            &cancel,
            None,
        )
        .await
        .unwrap();

        let rendered = transcript.snapshot();
        assert!(rendered.contains("$ sh -c \"echo hello\""));
        assert!(rendered.contains("hello"));
        assert!(rendered.contains("$ true\n(no output)"));
    }

    #[tokio::test]
    async fn transcript_records_errors() {
        let cancel = CancellationToken::new();
        let transcript = Arc::new(Transcript::new());
        let err = run_command_with_transcript(
            &transcript,
            "sh",
            &["-c".to_string(), "exit 7".to_string()],
            Path::new("."),
            &HashMap::new(),
            &cancel,
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("exit code 7"));
        assert!(transcript.snapshot().contains("ERROR:"));
    }

    #[tokio::test]
    async fn progress_sees_growing_transcript() {
        let cancel = CancellationToken::new();
        let transcript = Arc::new(Transcript::new());
        let snapshots: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let progress: ProgressFn = {
            let snapshots = snapshots.clone();
            Arc::new(move |value: &str| {
                snapshots.lock().unwrap().push(value.to_string());
            })
        };

        run_command_with_transcript(
            &transcript,
            "sh",
            &["-c".to_string(), "echo streamed".to_string()],
            Path::new("."),
            &HashMap::new(),
            &cancel,
            Some(progress),
        )
        .await
        .unwrap();

        let snapshots = snapshots.lock().unwrap();
        // At least once for the command line and once for the output chunk.
        assert!(snapshots.len() >= 2);
        assert!(snapshots.last().unwrap().contains("streamed"));
    }

    #[test]
    fn caller_env_wins_on_merge_conflicts() {
        let mut caller = HashMap::new();
        caller.insert("DOCKER_CONFIG".to_string(), "/caller".to_string());
        let mut resolution = HashMap::new();
        resolution.insert("DOCKER_CONFIG".to_string(), "/resolution".to_string());
        resolution.insert("EXTRA".to_string(), "1".to_string());

        let merged = merge_command_env(&caller, &resolution);
        assert_eq!(merged.get("DOCKER_CONFIG").unwrap(), "/caller");
        assert_eq!(merged.get("EXTRA").unwrap(), "1");
    }

    #[test]
    fn command_format_quotes_spaces() {
        assert_eq!(
            format_command("git", &["clone".into(), "my repo".into()]),
            "git clone \"my repo\""
        );
    }
}
