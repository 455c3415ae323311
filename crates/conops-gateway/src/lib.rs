// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The HTTP surface of the control plane.
//!
//! A thin adapter over the registry plus the force-sync and teardown paths.
//! Routing, middleware, and serialization live here; all semantics live in
//! the crates behind the [`GatewayState`](server::GatewayState).

pub mod handlers;
pub mod server;

pub use handlers::{ApiResponse, RegisterAppRequest};
pub use server::{build_router, start_server, GatewayState};
