// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic compose project names.
//!
//! Docker constrains project names to `[a-z0-9][a-z0-9_-]*`; this mapping is
//! stable across process restarts so containers started by one ConOps run
//! are found by the next.

const FALLBACK_PROJECT: &str = "conops-app";

/// Derive the compose project name for an app id.
///
/// Lowercase; `[a-z0-9-_]` kept, other runs collapsed to a single `-`;
/// leading/trailing `-_` trimmed; prefixed with `app-` when the first char
/// is not alphanumeric; truncated to 63 chars with a post-trim; falls back
/// to `conops-app` when empty.
pub fn project_name(app_id: &str) -> String {
    let raw = app_id.trim().to_lowercase();
    if raw.is_empty() {
        return FALLBACK_PROJECT.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.chars() {
        match c {
            'a'..='z' | '0'..='9' | '-' | '_' => {
                out.push(c);
                last_dash = false;
            }
            _ => {
                if !last_dash {
                    out.push('-');
                    last_dash = true;
                }
            }
        }
    }

    let mut project = out.trim_matches(['-', '_']).to_string();
    if project.is_empty() {
        project = FALLBACK_PROJECT.to_string();
    }
    if !project.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        project = format!("app-{project}");
    }
    if project.len() > 63 {
        project.truncate(63);
        project = project.trim_matches(['-', '_']).to_string();
    }
    if project.is_empty() {
        return FALLBACK_PROJECT.to_string();
    }
    project
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_map_to_themselves() {
        assert_eq!(
            project_name("0b8f9c1e-8d2a-4c37-9a4f-1f2e3d4c5b6a"),
            "0b8f9c1e-8d2a-4c37-9a4f-1f2e3d4c5b6a"
        );
    }

    #[test]
    fn uppercase_and_punctuation_are_normalized() {
        assert_eq!(project_name("My App!!v2"), "my-app-v2");
        assert_eq!(project_name("a..b"), "a-b");
    }

    #[test]
    fn runs_of_invalid_chars_collapse_to_one_dash() {
        assert_eq!(project_name("a###b"), "a-b");
    }

    #[test]
    fn leading_and_trailing_separators_are_trimmed() {
        assert_eq!(project_name("--app--"), "app");
        assert_eq!(project_name("__x__"), "x");
    }

    #[test]
    fn empty_and_symbol_only_ids_fall_back() {
        assert_eq!(project_name(""), "conops-app");
        assert_eq!(project_name("   "), "conops-app");
        assert_eq!(project_name("###"), "conops-app");
    }

    #[test]
    fn result_is_at_most_63_chars_and_stable() {
        let long = "x".repeat(100);
        let project = project_name(&long);
        assert_eq!(project.len(), 63);
        assert_eq!(project, project_name(&long));
    }

    #[test]
    fn truncation_trims_trailing_separators() {
        let id = format!("{}-{}", "a".repeat(62), "b".repeat(10));
        let project = project_name(&id);
        assert!(project.len() <= 63);
        assert!(!project.ends_with('-'));
    }

    #[test]
    fn result_always_starts_alphanumeric_with_valid_charset() {
        for id in ["demo", "--demo", "_x", "9lives", "App 1", "ümlaut"] {
            let project = project_name(id);
            assert!(
                project.starts_with(|c: char| c.is_ascii_alphanumeric()),
                "{id} -> {project}"
            );
            assert!(
                project
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'),
                "{id} -> {project}"
            );
        }
    }
}
