// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SSH command assembly for git subprocesses.

use std::path::Path;

/// Build the single-string `GIT_SSH_COMMAND` for a deploy-key checkout.
///
/// `IdentitiesOnly` pins authentication to the written key file,
/// `StrictHostKeyChecking` plus the explicit `UserKnownHostsFile` pins the
/// remote identity, and `-F /dev/null` ignores the user's SSH config.
pub fn build_ssh_command(key_path: &Path, known_hosts_path: &Path) -> String {
    format!(
        "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=yes -o UserKnownHostsFile={} -F /dev/null",
        shell_quote(&key_path.to_string_lossy()),
        shell_quote(&known_hosts_path.to_string_lossy()),
    )
}

/// Single-quote a value for inclusion in a shell command line.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}
