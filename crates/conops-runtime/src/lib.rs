// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Local container runtime orchestration.
//!
//! Resolves a compatible docker toolchain (installing a managed client and
//! compose plugin when the system ones cannot talk to the daemon), prepares
//! per-app git checkouts, applies compose stacks, and snapshots what is
//! running for drift detection.

pub mod command;
pub mod executor;
pub mod project;
pub mod state;
pub mod toolchain;
pub mod transcript;

pub use executor::ComposeExecutor;
pub use project::project_name;
pub use state::{ProjectRuntimeState, ServiceContainer};
pub use toolchain::DockerResolution;
pub use transcript::Transcript;
