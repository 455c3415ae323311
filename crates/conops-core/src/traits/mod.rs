// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trait definitions decoupling the control plane from its backends.

pub mod runtime;
pub mod store;

pub use runtime::{ApplyError, ApplyRequest, ProgressFn, RuntimeApplier, RuntimeCleaner};
pub use store::StateStore;
