// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Auth-method normalization.

use conops_core::RepoAuthMethod;

/// Canonicalize a repo auth method string.
///
/// Empty and `public` map to [`RepoAuthMethod::Public`]; the `deploy_key`
/// spellings seen from forms and JSON payloads map to
/// [`RepoAuthMethod::DeployKey`]; anything else is invalid.
pub fn normalize_method(value: &str) -> Option<RepoAuthMethod> {
    match value.trim().to_lowercase().as_str() {
        "" | "public" => Some(RepoAuthMethod::Public),
        "deploy_key" | "deploy-key" | "deploykey" => Some(RepoAuthMethod::DeployKey),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_public_normalize_to_public() {
        assert_eq!(normalize_method(""), Some(RepoAuthMethod::Public));
        assert_eq!(normalize_method("  "), Some(RepoAuthMethod::Public));
        assert_eq!(normalize_method("public"), Some(RepoAuthMethod::Public));
        assert_eq!(normalize_method("Public"), Some(RepoAuthMethod::Public));
    }

    #[test]
    fn deploy_key_spellings_normalize() {
        for spelling in ["deploy_key", "deploy-key", "deploykey", "Deploy-Key"] {
            assert_eq!(
                normalize_method(spelling),
                Some(RepoAuthMethod::DeployKey),
                "{spelling}"
            );
        }
    }

    #[test]
    fn unknown_methods_are_invalid() {
        assert_eq!(normalize_method("token"), None);
        assert_eq!(normalize_method("ssh"), None);
    }
}
