use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;

use liftoff_accounts::poller::{PollerDeps, QuotaPoller};
use liftoff_relay::{SignatureStore, UpstreamDispatcher};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
///
/// The signature store and the account pool are the process-wide
/// singletons; the dispatcher sits behind a lock so a settings update can
/// swap in a rebuilt one without restarting.
pub struct AppState {
    pub deps: PollerDeps,
    pub signatures: Arc<SignatureStore>,
    pub dispatcher: RwLock<Arc<UpstreamDispatcher>>,
    pub poller: QuotaPoller,
}

impl AppState {
    pub fn pool(&self) -> &liftoff_accounts::AccountPool {
        &self.deps.pool
    }

    pub fn config(&self) -> &RwLock<liftoff_core::config::ProxyConfig> {
        &self.deps.config
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/v1/messages", post(crate::http::messages::messages_handler))
        .route(
            "/v1/accounts",
            get(crate::http::accounts::list_accounts).post(crate::http::accounts::add_account),
        )
        .route(
            "/v1/accounts/{id}",
            delete(crate::http::accounts::delete_account),
        )
        .route(
            "/v1/accounts/{id}/switch",
            post(crate::http::accounts::switch_account),
        )
        .route(
            "/v1/accounts/{id}/refresh",
            post(crate::http::accounts::refresh_account),
        )
        .route(
            "/v1/accounts/refresh-all",
            post(crate::http::accounts::refresh_all),
        )
        .route(
            "/v1/accounts/sync-local",
            post(crate::http::accounts::sync_local),
        )
        .route(
            "/v1/settings",
            get(crate::http::settings::get_settings).put(crate::http::settings::put_settings),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
