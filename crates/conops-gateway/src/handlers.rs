// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP request handlers for the control-plane API.
//!
//! All responses wrap the standard `{message, data?}` envelope. Force-sync is
//! the one path that deliberately outlives its HTTP request: the apply runs on
//! a spawned task with a shutdown-derived cancellation token, so a client
//! disconnect cannot abort an in-progress apply.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use conops_core::{App, AppStatus, ApplyRequest, ConopsError};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::server::GatewayState;

/// Force-sync applies get their own generous budget, independent of the
/// reconciler's configured sync timeout.
const FORCE_SYNC_TIMEOUT: Duration = Duration::from_secs(600);
/// Teardown budget for DELETE.
const DELETE_CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Standard response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            message: message.into(),
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    fn message_only(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }
}

/// An HTTP-mapped error.
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Map a core error to its boundary status. `Config` maps to 400, which
    /// fits create-time checks; paths where a config failure is an internal
    /// fault (credential decrypt) construct their 500 explicitly.
    fn from_conops(err: ConopsError) -> Self {
        let status = match &err {
            ConopsError::Validation(_) => StatusCode::BAD_REQUEST,
            ConopsError::Config(_) => StatusCode::BAD_REQUEST,
            ConopsError::NotFound(_) => StatusCode::NOT_FOUND,
            ConopsError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiResponse::<()>::message_only(self.message)),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Request body for `POST /api/v1/apps`.
#[derive(Debug, Deserialize)]
pub struct RegisterAppRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub repo_auth_method: String,
    #[serde(default)]
    pub deploy_key: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub compose_path: String,
    #[serde(default)]
    pub poll_interval: String,
}

/// GET /healthz
pub async fn health() -> Json<ApiResponse<()>> {
    Json(ApiResponse::message_only("ok"))
}

/// POST /api/v1/apps
pub async fn register_app(
    State(state): State<GatewayState>,
    Json(body): Json<RegisterAppRequest>,
) -> ApiResult<(StatusCode, Json<ApiResponse<App>>)> {
    if body.name.trim().is_empty() || body.repo_url.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "app name and repo URL are required",
        ));
    }

    let app = state
        .registry
        .add_with_deploy_key(conops_registry::NewAppRequest {
            id: String::new(),
            name: body.name,
            repo_url: body.repo_url,
            repo_auth_method: body.repo_auth_method,
            deploy_key: body.deploy_key,
            branch: body.branch,
            compose_path: body.compose_path,
            poll_interval: body.poll_interval,
        })
        .await
        .map_err(ApiError::from_conops)?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::with_data("App registered successfully", app)),
    ))
}

/// GET /api/v1/apps
pub async fn list_apps(
    State(state): State<GatewayState>,
) -> ApiResult<Json<ApiResponse<Vec<App>>>> {
    let apps = state.registry.list().await.map_err(ApiError::from_conops)?;
    Ok(Json(ApiResponse::with_data("", apps)))
}

/// GET /api/v1/apps/{id}
pub async fn get_app(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<App>>> {
    let app = state.registry.get(&id).await.map_err(ApiError::from_conops)?;
    Ok(Json(ApiResponse::with_data("", app)))
}

/// DELETE /api/v1/apps/{id}
///
/// Runtime teardown runs BEFORE the rows are removed; the app row survives a
/// failed teardown so the operator can retry.
pub async fn delete_app(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let app = state.registry.get(&id).await.map_err(ApiError::from_conops)?;

    if let Some(cleaner) = &state.cleaner {
        let cleanup_cancel = state.shutdown.child_token();
        let watchdog = {
            let cleanup_cancel = cleanup_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(DELETE_CLEANUP_TIMEOUT).await;
                cleanup_cancel.cancel();
            })
        };
        let destroyed = cleaner
            .destroy(&app.id, &app.compose_path, HashMap::new(), cleanup_cancel)
            .await;
        watchdog.abort();

        if let Err(err) = destroyed {
            error!(app_id = %app.id, error = %err, "failed to cleanup app runtime");
            return Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to cleanup running containers before deletion",
            ));
        }
    }

    state
        .registry
        .delete(&id)
        .await
        .map_err(ApiError::from_conops)?;

    Ok(Json(ApiResponse::message_only("App deleted successfully")))
}

/// POST /api/v1/apps/{id}/sync
pub async fn force_sync_app(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let Some(applier) = state.applier.clone() else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "runtime applier is not configured",
        ));
    };

    let app = state.registry.get(&id).await.map_err(ApiError::from_conops)?;

    if app.status == AppStatus::Syncing {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "sync already in progress",
        ));
    }

    let started_at = chrono::Utc::now().to_rfc3339();
    if let Err(err) = state
        .registry
        .update_status(&app.id, AppStatus::Syncing, Some(&started_at))
        .await
    {
        warn!(app_id = %app.id, error = %err, "failed to mark app syncing");
    }

    let deploy_key = match state.registry.get_deploy_key(&app.id).await {
        Ok(key) => key,
        Err(err) => {
            let _ = state
                .registry
                .update_status(&app.id, AppStatus::Error, None)
                .await;
            return Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to load app credentials: {err}"),
            ));
        }
    };

    // Derive from the shutdown token, not the request: the apply must
    // survive reverse-proxy and client disconnects.
    let sync_cancel = state.shutdown.child_token();
    let watchdog = {
        let sync_cancel = sync_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FORCE_SYNC_TIMEOUT).await;
            sync_cancel.cancel();
        })
    };

    let registry = state.registry.clone();
    let sync_task = tokio::spawn(async move {
        let reporter = std::sync::Arc::new(conops_controller::SyncProgressReporter::new(
            registry.clone(),
            app.id.clone(),
            conops_controller::SYNC_PROGRESS_FLUSH_INTERVAL,
        ));

        let request = ApplyRequest {
            app_id: app.id.clone(),
            inline_content: String::new(),
            env_vars: HashMap::new(),
            repo_url: app.repo_url.clone(),
            branch: app.branch.clone(),
            compose_path: app.compose_path.clone(),
            // Latest on branch; the reconciler pins observed commits.
            commit_hash: String::new(),
            deploy_key,
        };

        let result = applier
            .apply(request, sync_cancel, Some(reporter.as_progress_fn()))
            .await;
        reporter.flush().await;

        let now = chrono::Utc::now().to_rfc3339();
        match result {
            Err(apply_err) => {
                let _ = registry
                    .update_sync_result(
                        &app.id,
                        AppStatus::Error,
                        &now,
                        &app.last_synced_commit,
                        &app.last_synced_commit_message,
                        &apply_err.transcript,
                        &apply_err.to_string(),
                    )
                    .await;
                error!(app_id = %app.id, error = %apply_err, "force sync failed");
                Err(())
            }
            Ok(output) => {
                if let Err(err) = registry
                    .update_sync_result(
                        &app.id,
                        AppStatus::Synced,
                        &now,
                        &app.last_seen_commit,
                        &app.last_seen_commit_message,
                        &output,
                        "",
                    )
                    .await
                {
                    warn!(app_id = %app.id, error = %err, "failed to update sync status after force sync");
                }
                Ok(())
            }
        }
    });

    let outcome = sync_task.await;
    watchdog.abort();

    match outcome {
        Ok(Ok(())) => Ok(Json(ApiResponse::message_only("App synced successfully"))),
        Ok(Err(())) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "force sync failed",
        )),
        Err(err) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("force sync task failed: {err}"),
        )),
    }
}
