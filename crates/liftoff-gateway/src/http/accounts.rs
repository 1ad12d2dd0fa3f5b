//! Account control surface: list, add, delete, switch, refresh, and the
//! IDE-credential import.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use liftoff_accounts::auth::TokenBundle;
use liftoff_accounts::stats::{global_quota, group_models_by_provider};
use liftoff_core::error::{LiftoffError, Result};

use crate::app::AppState;
use crate::http::error_response;

/// GET /v1/accounts — redacted accounts plus read-time quota aggregation.
pub async fn list_accounts(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.config().read().await.clone();
    let accounts = state.pool().list();

    let views: Vec<Value> = accounts
        .iter()
        .map(|account| {
            let mut view = serde_json::to_value(account.redacted()).unwrap_or(Value::Null);
            if config.provider_groupings_enabled {
                let stats =
                    group_models_by_provider(&account.quota, |m| config.is_model_visible(m));
                view["stats"] = serde_json::to_value(stats).unwrap_or(Value::Null);
            }
            view
        })
        .collect();

    Json(json!({
        "accounts": views,
        "global_quota": global_quota(&accounts, |m| config.is_model_visible(m)),
    }))
}

#[derive(Deserialize)]
pub struct AddAccountRequest {
    pub auth_code: String,
    #[serde(default)]
    pub replace: bool,
}

/// POST /v1/accounts — exchange an authorization code for a new account.
pub async fn add_account(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddAccountRequest>,
) -> Response {
    match add_account_inner(&state, req).await {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        Err(err) => {
            warn!(error = %err, "add account failed");
            error_response(&err).into_response()
        }
    }
}

async fn add_account_inner(state: &Arc<AppState>, req: AddAccountRequest) -> Result<Value> {
    let (bundle, userinfo) = state.deps.auth.exchange_code(&req.auth_code).await?;
    let ciphertext = state.deps.vault.encrypt(&serde_json::to_string(&bundle)?)?;
    let account = state.pool().add(
        userinfo.name.unwrap_or_else(|| userinfo.email.clone()),
        userinfo.email,
        userinfo.picture,
        ciphertext,
        req.replace,
    )?;
    // First account in the pool becomes active immediately.
    if state.pool().get_active().is_none() {
        state.pool().switch_to(&account.id)?;
    }
    info!(id = %account.id, "account registered");
    Ok(serde_json::to_value(account.redacted())?)
}

/// DELETE /v1/accounts/{id}.
pub async fn delete_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.pool().delete(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

/// POST /v1/accounts/{id}/switch.
pub async fn switch_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.pool().switch_to(&id) {
        Ok(account) => Json(account.redacted()).into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

/// POST /v1/accounts/{id}/refresh — force a quota poll of one account.
pub async fn refresh_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.deps.poll_account(&id).await {
        Ok(quota) => Json(json!({"id": id, "quota": quota})).into_response(),
        Err(err) => {
            warn!(id, error = %err, "forced account refresh failed");
            error_response(&err).into_response()
        }
    }
}

/// POST /v1/accounts/refresh-all — force a full poll tick, coalescing with
/// any tick already in flight.
pub async fn refresh_all(State(state): State<Arc<AppState>>) -> Json<Value> {
    let summary = state.poller.force_poll().await;
    Json(json!({
        "polled": summary.polled,
        "failed": summary.failed,
        "completed_at": summary.completed_at,
    }))
}

/// IDE-managed credentials document accepted by sync-local.
#[derive(Deserialize)]
struct LocalCredentials {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    token_type: Option<String>,
    expiry_date: i64,
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
}

#[derive(Deserialize)]
pub struct SyncLocalRequest {
    /// Path to the IDE's credentials JSON.
    pub path: String,
    #[serde(default)]
    pub replace: bool,
}

/// POST /v1/accounts/sync-local — import an IDE-managed account.
pub async fn sync_local(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncLocalRequest>,
) -> Response {
    match sync_local_inner(&state, req).await {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        Err(err) => {
            warn!(error = %err, "sync-local failed");
            error_response(&err).into_response()
        }
    }
}

async fn sync_local_inner(state: &Arc<AppState>, req: SyncLocalRequest) -> Result<Value> {
    let raw = std::fs::read_to_string(&req.path)
        .map_err(|e| LiftoffError::InvalidRequest(format!("cannot read {}: {e}", req.path)))?;
    let creds: LocalCredentials = serde_json::from_str(&raw)
        .map_err(|e| LiftoffError::InvalidRequest(format!("invalid credentials file: {e}")))?;
    let email = creds
        .email
        .clone()
        .ok_or_else(|| LiftoffError::InvalidRequest("credentials file missing email".into()))?;

    let bundle = TokenBundle {
        access_token: creds.access_token,
        refresh_token: creds.refresh_token,
        token_type: creds.token_type.unwrap_or_else(|| "Bearer".to_string()),
        expiry_date: creds.expiry_date,
    };
    let ciphertext = state.deps.vault.encrypt(&serde_json::to_string(&bundle)?)?;
    let account = state.pool().add(
        creds.name.unwrap_or_else(|| email.clone()),
        email,
        creds.picture,
        ciphertext,
        req.replace,
    )?;
    if let Some(project_id) = creds.project_id {
        state.pool().set_project(&account.id, project_id)?;
    }
    if state.pool().get_active().is_none() {
        state.pool().switch_to(&account.id)?;
    }
    info!(id = %account.id, "local account imported");
    Ok(serde_json::to_value(
        state
            .pool()
            .get(&account.id)
            .unwrap_or(account)
            .redacted(),
    )?)
}
