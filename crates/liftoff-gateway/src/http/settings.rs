//! GET/PUT /v1/settings — the config document, persisted rename-on-write.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{info, warn};

use liftoff_core::config::ProxyConfig;
use liftoff_core::persist::atomic_write_json;
use liftoff_relay::UpstreamDispatcher;

use crate::app::AppState;
use crate::http::error_response;

pub async fn get_settings(State(state): State<Arc<AppState>>) -> Json<ProxyConfig> {
    Json(state.config().read().await.clone())
}

/// Replace the settings document. The upstream dispatcher is rebuilt so new
/// base URLs, timeouts, and proxy settings apply to the next request; the
/// poller picks up interval and visibility changes on its next tick.
pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(new_config): Json<ProxyConfig>,
) -> Response {
    let dispatcher = match UpstreamDispatcher::new(&new_config) {
        Ok(d) => Arc::new(d),
        Err(err) => {
            warn!(error = %err, "rejected settings update");
            return error_response(&err).into_response();
        }
    };
    if let Err(err) = atomic_write_json(new_config.settings_path(), &new_config) {
        warn!(error = %err, "failed to persist settings");
        return error_response(&err).into_response();
    }

    *state.dispatcher.write().await = dispatcher;
    *state.config().write().await = new_config.clone();
    info!("settings updated");
    Json(new_config).into_response()
}
