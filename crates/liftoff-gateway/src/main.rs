use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::RwLock;
use tracing::{info, warn};

use liftoff_accounts::auth::AuthClient;
use liftoff_accounts::persist::AccountStore;
use liftoff_accounts::poller::{PollerDeps, QuotaPoller};
use liftoff_accounts::quota_client::HttpQuotaClient;
use liftoff_accounts::AccountPool;
use liftoff_core::config::ProxyConfig;
use liftoff_relay::{SignatureStore, UpstreamDispatcher};
use liftoff_vault::CredentialStore;

mod app;
mod http;

#[derive(Parser)]
#[command(name = "liftoff-gateway", about = "Local dialect-translating LLM proxy")]
struct Args {
    /// Path to settings.json (default: <data_dir>/settings.json).
    #[arg(long)]
    config: Option<String>,
    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
    /// Override the bind address.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "liftoff=info,liftoff_gateway=info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ProxyConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        ProxyConfig::default()
    });
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let vault = Arc::new(CredentialStore::new_system());
    let pool = Arc::new(AccountPool::load(AccountStore::new(config.accounts_dir())));
    let auth = Arc::new(AuthClient::new(&config)?);
    let quota = Arc::new(HttpQuotaClient::new(&config)?);
    let dispatcher = Arc::new(UpstreamDispatcher::new(&config)?);
    let signatures = Arc::new(SignatureStore::new());

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let shared_config = Arc::new(RwLock::new(config));

    let deps = PollerDeps {
        pool: pool.clone(),
        vault,
        auth,
        quota,
        config: shared_config,
    };
    let poller = QuotaPoller::spawn(deps.clone());

    let state = Arc::new(app::AppState {
        deps,
        signatures,
        dispatcher: RwLock::new(dispatcher),
        poller,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(accounts = pool.list().len(), "liftoff gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
