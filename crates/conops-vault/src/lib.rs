// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! At-rest encryption for deploy keys.
//!
//! A process that starts without any key source gets one generated for it;
//! "encryption disabled" therefore only occurs when the operator runs without
//! a vault at all, which the registry surfaces as a configuration error on
//! any deploy-key operation.

pub mod crypto;
pub mod keyfile;
pub mod service;

pub use service::CredentialVault;
