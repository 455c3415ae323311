// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Repository authentication policy.
//!
//! Normalizes auth modes and pasted deploy keys, validates create-time input,
//! resolves the trusted known-hosts file, and assembles the strict SSH
//! command used by git subprocesses.

pub mod key;
pub mod known_hosts;
pub mod method;
pub mod ssh;

pub use key::{
    host_from_repo_url, is_ssh_repo_url, normalize_deploy_key, require_method,
    validate_create_input, APPROVED_DEPLOY_KEY_HOST,
};
pub use known_hosts::{known_host_keys, resolve_known_hosts_path};
pub use method::normalize_method;
pub use ssh::{build_ssh_command, shell_quote};
