//! Background quota poller — one loop per process.
//!
//! Every tick (60 s default, jittered ±10% so a fleet of installs doesn't
//! hit the metadata endpoint in lockstep) each non-quarantined account gets
//! an authenticated quota fetch. Snapshots are applied atomically per
//! account; status transitions and auto-switch candidates are published on
//! the pool's event channel. A stuck tick is abandoned at twice the
//! interval and reported as a failure without touching in-flight requests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use liftoff_core::config::ProxyConfig;
use liftoff_core::error::{LiftoffError, Result};
use liftoff_core::types::{AccountStatus, Quota};
use liftoff_vault::CredentialStore;

use crate::auth::{ensure_access_token, AuthClient};
use crate::pool::{AccountPool, PoolEvent};
use crate::quota_client::QuotaClient;
use crate::stats::overall_percentage;

/// Outcome of one poll tick.
#[derive(Debug, Clone, Default)]
pub struct PollSummary {
    pub polled: usize,
    pub failed: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Everything a tick needs. Cheap to clone; shared with the HTTP layer for
/// single-account refreshes.
#[derive(Clone)]
pub struct PollerDeps {
    pub pool: Arc<AccountPool>,
    pub vault: Arc<CredentialStore>,
    pub auth: Arc<AuthClient>,
    pub quota: Arc<dyn QuotaClient>,
    pub config: Arc<RwLock<ProxyConfig>>,
}

impl PollerDeps {
    /// Poll a single account: fetch, apply, and run the status transitions.
    pub async fn poll_account(&self, id: &str) -> Result<Quota> {
        let account = self
            .pool
            .get(id)
            .ok_or_else(|| LiftoffError::AccountNotFound { id: id.to_string() })?;
        if account.status == AccountStatus::Error {
            return Err(LiftoffError::AuthRejected {
                status: 401,
                message: "account is quarantined".into(),
            });
        }

        let token = ensure_access_token(&self.pool, &self.vault, &self.auth, id).await?;
        let quota = match self.quota.fetch_quota(&token).await {
            Ok(q) => q,
            Err(e @ LiftoffError::AuthRejected { .. }) => {
                self.pool.mark_error(id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.pool.apply_quota(id, quota.clone());
        self.apply_transitions(id, &quota).await;
        Ok(quota)
    }

    /// Status machine driven by the fresh snapshot:
    /// any model at 0% pins the account rate-limited; a rate-limited
    /// account whose snapshot shows capacity again returns to service.
    async fn apply_transitions(&self, id: &str, quota: &Quota) {
        let Some(account) = self.pool.get(id) else {
            return;
        };
        match account.status {
            AccountStatus::Active | AccountStatus::Idle if quota.any_exhausted() => {
                info!(id, "quota exhausted, marking rate-limited");
                self.pool.mark_rate_limited(id);
            }
            AccountStatus::RateLimited if !quota.any_exhausted() => {
                info!(id, "quota recovered, returning account to service");
                let back_to = if account.is_active {
                    AccountStatus::Active
                } else {
                    AccountStatus::Idle
                };
                self.pool.set_status(id, back_to);
            }
            _ => {}
        }

        // Auto-switch surveillance only watches the active account.
        if !account.is_active {
            return;
        }
        let config = self.config.read().await.clone();
        let overall = overall_percentage(quota, |m| config.is_model_visible(m));
        let limited = self.pool.get(id).map(|a| a.status == AccountStatus::RateLimited)
            .unwrap_or(false);
        if overall < config.auto_switch_threshold || limited {
            debug!(id, overall, "active account crossed auto-switch threshold");
            self.pool.emit(PoolEvent::AutoSwitchCandidate { id: id.to_string() });
            if config.auto_switch_enabled {
                self.pool.auto_switch(&config);
            }
        }
    }

    async fn tick(&self) -> PollSummary {
        let mut summary = PollSummary::default();
        for account in self.pool.list() {
            if account.status == AccountStatus::Error {
                continue;
            }
            match self.poll_account(&account.id).await {
                Ok(_) => summary.polled += 1,
                Err(e) => {
                    warn!(id = %account.id, error = %e, "quota poll failed for account");
                    summary.failed += 1;
                }
            }
        }
        summary.completed_at = Some(Utc::now());
        summary
    }
}

pub struct QuotaPoller {
    handle: JoinHandle<()>,
    wake: Arc<Notify>,
    results: watch::Receiver<PollSummary>,
}

impl QuotaPoller {
    /// Spawn the process-wide poll loop.
    pub fn spawn(deps: PollerDeps) -> Self {
        let wake = Arc::new(Notify::new());
        let (tx, rx) = watch::channel(PollSummary::default());
        let loop_wake = wake.clone();

        let handle = tokio::spawn(async move {
            loop {
                let interval = {
                    let config = deps.config.read().await;
                    config.poll_interval_secs.max(5)
                };
                let jitter = rand::thread_rng().gen_range(0.9..=1.1);
                let sleep = Duration::from_secs_f64(interval as f64 * jitter);

                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = loop_wake.notified() => {
                        debug!("quota poll forced");
                    }
                }

                let budget = Duration::from_secs(interval * 2);
                let summary = match tokio::time::timeout(budget, deps.tick()).await {
                    Ok(summary) => summary,
                    Err(_) => {
                        warn!(budget_secs = budget.as_secs(), "quota poll stuck, cancelled");
                        PollSummary {
                            polled: 0,
                            failed: deps.pool.list().len(),
                            completed_at: Some(Utc::now()),
                        }
                    }
                };
                debug!(polled = summary.polled, failed = summary.failed, "quota poll tick complete");
                let _ = tx.send(summary);
            }
        });

        Self {
            handle,
            wake,
            results: rx,
        }
    }

    /// Trigger an immediate tick and wait for its summary. When a tick is
    /// already in flight the next published summary — the in-flight one —
    /// is returned instead of queueing a second poll.
    pub async fn force_poll(&self) -> PollSummary {
        let mut rx = self.results.clone();
        rx.mark_unchanged();
        self.wake.notify_one();
        if rx.changed().await.is_err() {
            return PollSummary::default();
        }
        let summary = rx.borrow().clone();
        summary
    }

    pub fn last_summary(&self) -> PollSummary {
        self.results.borrow().clone()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for QuotaPoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::AccountStore;
    use async_trait::async_trait;
    use liftoff_core::types::ModelQuota;
    use liftoff_vault::keysource::{KeySource, KEY_LEN};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use zeroize::Zeroizing;

    struct FixedKey;
    impl KeySource for FixedKey {
        fn name(&self) -> &'static str {
            "test"
        }
        fn load(&self) -> Result<Zeroizing<[u8; KEY_LEN]>> {
            Ok(Zeroizing::new([3u8; KEY_LEN]))
        }
    }

    /// Scripted quota source keyed by access token.
    struct ScriptedQuota {
        by_token: Mutex<HashMap<String, Quota>>,
    }

    #[async_trait]
    impl QuotaClient for ScriptedQuota {
        async fn fetch_quota(&self, access_token: &str) -> Result<Quota> {
            self.by_token
                .lock()
                .unwrap()
                .get(access_token)
                .cloned()
                .ok_or_else(|| LiftoffError::UpstreamUnavailable("no script".into()))
        }
    }

    fn quota_at(pct: f64) -> Quota {
        let mut quota = Quota::default();
        quota.models.insert(
            "gemini-3-pro-preview".into(),
            ModelQuota {
                percentage: pct,
                reset_time: None,
            },
        );
        quota
    }

    fn deps_with(
        script: HashMap<String, Quota>,
    ) -> (PollerDeps, Arc<AccountPool>, Arc<ScriptedQuota>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts"));
        let pool = Arc::new(AccountPool::load(store));
        let vault = Arc::new(CredentialStore::with_sources(Box::new(FixedKey), vec![]));
        let config = Arc::new(RwLock::new(ProxyConfig::default()));
        let auth = Arc::new(AuthClient::new(&ProxyConfig::default()).unwrap());
        let scripted = Arc::new(ScriptedQuota {
            by_token: Mutex::new(script),
        });
        let deps = PollerDeps {
            pool: pool.clone(),
            vault,
            auth,
            quota: scripted.clone(),
            config,
        };
        (deps, pool, scripted, dir)
    }

    /// Seed an account whose bundle decrypts to a far-future token, so
    /// `ensure_access_token` never needs the network.
    fn seed_account(deps: &PollerDeps, token: &str) -> String {
        let bundle = serde_json::json!({
            "access_token": token,
            "refresh_token": "r",
            "token_type": "Bearer",
            "expiry_date": 4_102_444_800_000_i64,
        });
        let ciphertext = deps.vault.encrypt(&bundle.to_string()).unwrap();
        deps.pool
            .add("N".into(), format!("{token}@example.com"), None, ciphertext, false)
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn poll_applies_snapshot_and_emits_quota_updated() {
        let script = HashMap::from([("tok-a".to_string(), quota_at(80.0))]);
        let (deps, pool, _scripted, _dir) = deps_with(script);
        let id = seed_account(&deps, "tok-a");

        let mut rx = pool.subscribe();
        deps.poll_account(&id).await.unwrap();

        let account = pool.get(&id).unwrap();
        assert_eq!(account.quota.models["gemini-3-pro-preview"].percentage, 80.0);
        let mut saw_update = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PoolEvent::QuotaUpdated { .. }) {
                saw_update = true;
            }
        }
        assert!(saw_update);
    }

    #[tokio::test]
    async fn exhausted_quota_marks_rate_limited_and_recovery_restores() {
        let script = HashMap::from([("tok-a".to_string(), quota_at(0.0))]);
        let (deps, pool, scripted, _dir) = deps_with(script);
        let id = seed_account(&deps, "tok-a");

        deps.poll_account(&id).await.unwrap();
        assert_eq!(pool.get(&id).unwrap().status, AccountStatus::RateLimited);

        // Next poll sees capacity again.
        scripted
            .by_token
            .lock()
            .unwrap()
            .insert("tok-a".into(), quota_at(55.0));
        deps.poll_account(&id).await.unwrap();
        assert_eq!(pool.get(&id).unwrap().status, AccountStatus::Idle);
    }

    #[tokio::test]
    async fn active_account_below_threshold_triggers_auto_switch() {
        let script = HashMap::from([
            ("tok-low".to_string(), quota_at(10.0)),
            ("tok-high".to_string(), quota_at(90.0)),
        ]);
        let (deps, pool, _scripted, _dir) = deps_with(script);
        let low = seed_account(&deps, "tok-low");
        let high = seed_account(&deps, "tok-high");
        pool.switch_to(&low).unwrap();

        // Give the fallback account a known-good snapshot first.
        deps.poll_account(&high).await.unwrap();
        let mut rx = pool.subscribe();
        deps.poll_account(&low).await.unwrap();

        assert_eq!(pool.get_active().unwrap().id, high);
        let mut saw_candidate = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PoolEvent::AutoSwitchCandidate { .. }) {
                saw_candidate = true;
            }
        }
        assert!(saw_candidate);
    }

    #[tokio::test]
    async fn quarantined_accounts_are_not_polled() {
        let (deps, pool, _scripted, _dir) = deps_with(HashMap::new());
        let id = seed_account(&deps, "tok-x");
        pool.mark_error(&id);
        let summary = deps.tick().await;
        assert_eq!(summary.polled, 0);
        assert_eq!(summary.failed, 0);
    }
}
