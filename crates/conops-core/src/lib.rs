// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the ConOps control plane.
//!
//! This crate provides the shared error type, the domain model (apps, their
//! credentials, the status state machine), and the trait seams between the
//! control plane and its backends (state store, container runtime).

pub mod error;
pub mod traits;
pub mod types;

pub use error::ConopsError;
pub use types::{App, AppCredential, AppStatus, RepoAuthMethod};

pub use traits::{ApplyError, ApplyRequest, ProgressFn, RuntimeApplier, RuntimeCleaner, StateStore};
