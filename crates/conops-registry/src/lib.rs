// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The app registry: a stateless façade over the state store, the credential
//! vault, and the repo-auth policy.
//!
//! Every actor in the control plane (watcher, reconciler, HTTP surface) goes
//! through this crate; none of them share mutable in-memory records. The
//! store serializes the transitions.

pub mod registry;

pub use registry::{NewAppRequest, Registry};
