//! Account pool: ordered set of authenticated accounts, selection policy,
//! status transitions, and auto-switching.
//!
//! All mutations take a short-held write lock covering only the in-memory
//! update; persistence happens after the lock is released, on clones of the
//! affected documents. Exactly zero or one account is active at any time.

use std::sync::RwLock;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use liftoff_core::config::ProxyConfig;
use liftoff_core::error::{LiftoffError, Result};
use liftoff_core::types::{Account, AccountStatus, Quota};

use crate::persist::AccountStore;
use crate::stats::overall_percentage;

/// Pool notifications, published on a broadcast channel so the poller, the
/// HTTP surface, and any future UI bridge can subscribe independently.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    QuotaUpdated {
        id: String,
    },
    StatusChanged {
        id: String,
        from: AccountStatus,
        to: AccountStatus,
    },
    /// The active account crossed below the auto-switch threshold; the pool
    /// decides whether to actually switch.
    AutoSwitchCandidate {
        id: String,
    },
    AutoSwitched {
        from: Option<String>,
        to: String,
    },
    /// Auto-switch wanted to move away but no candidate qualified.
    NoCapacity,
}

pub struct AccountPool {
    accounts: RwLock<Vec<Account>>,
    store: AccountStore,
    events: broadcast::Sender<PoolEvent>,
}

impl AccountPool {
    /// Load all persisted accounts from the store's directory.
    pub fn load(store: AccountStore) -> Self {
        let mut accounts = store.load_all();
        // Repair a torn write: more than one active account is an invariant
        // breach, so keep the most recently used and demote the rest.
        let active_count = accounts.iter().filter(|a| a.is_active).count();
        if active_count > 1 {
            warn!(active_count, "multiple active accounts on disk, quarantining extras");
            let keep = accounts
                .iter()
                .filter(|a| a.is_active)
                .max_by_key(|a| a.last_used)
                .map(|a| a.id.clone());
            for account in accounts.iter_mut() {
                if account.is_active && Some(&account.id) != keep.as_ref() {
                    account.is_active = false;
                    account.status = AccountStatus::Idle;
                    let _ = store.save(account);
                }
            }
        }
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        let (events, _) = broadcast::channel(64);
        Self {
            accounts: RwLock::new(accounts),
            store,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    /// Register a freshly authorized account. Duplicate emails are rejected
    /// unless the caller opted into replacement.
    pub fn add(
        &self,
        name: String,
        email: String,
        avatar_url: Option<String>,
        credentials: String,
        replace: bool,
    ) -> Result<Account> {
        let replaced_id = {
            let accounts = self.accounts.read().expect("pool lock");
            match accounts.iter().find(|a| a.email == email) {
                Some(_) if !replace => {
                    return Err(LiftoffError::AccountExists { email });
                }
                Some(existing) => Some(existing.id.clone()),
                None => None,
            }
        };
        if let Some(id) = replaced_id {
            self.delete(&id)?;
        }

        let account = Account {
            id: Uuid::new_v4().to_string(),
            name,
            email,
            avatar_url,
            provider: "google".to_string(),
            status: AccountStatus::Idle,
            is_active: false,
            last_used: Utc::now().timestamp(),
            project_id: None,
            credentials,
            quota: Quota::default(),
        };
        self.store.save(&account)?;
        self.accounts.write().expect("pool lock").push(account.clone());
        info!(id = %account.id, email = %account.email, "account added");
        Ok(account)
    }

    /// Remove the account and its on-disk document (credential bundle
    /// included).
    pub fn delete(&self, id: &str) -> Result<()> {
        let removed = {
            let mut accounts = self.accounts.write().expect("pool lock");
            let before = accounts.len();
            accounts.retain(|a| a.id != id);
            before != accounts.len()
        };
        if !removed {
            return Err(LiftoffError::AccountNotFound { id: id.to_string() });
        }
        self.store.remove(id)?;
        info!(id, "account deleted");
        Ok(())
    }

    pub fn list(&self) -> Vec<Account> {
        self.accounts.read().expect("pool lock").clone()
    }

    pub fn get(&self, id: &str) -> Option<Account> {
        self.accounts
            .read()
            .expect("pool lock")
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    pub fn get_active(&self) -> Option<Account> {
        self.accounts
            .read()
            .expect("pool lock")
            .iter()
            .find(|a| a.is_active)
            .cloned()
    }

    /// Transactional selection: the target becomes the only active account.
    pub fn switch_to(&self, id: &str) -> Result<Account> {
        let (changed, transitions, selected) = {
            let mut accounts = self.accounts.write().expect("pool lock");
            if !accounts.iter().any(|a| a.id == id) {
                return Err(LiftoffError::AccountNotFound { id: id.to_string() });
            }
            let mut changed = Vec::new();
            let mut transitions = Vec::new();
            let mut selected = None;
            for account in accounts.iter_mut() {
                let was_active = account.is_active;
                if account.id == id {
                    account.is_active = true;
                    if account.status == AccountStatus::Idle {
                        transitions.push((account.id.clone(), account.status, AccountStatus::Active));
                        account.status = AccountStatus::Active;
                    }
                    selected = Some(account.clone());
                    if !was_active {
                        changed.push(account.clone());
                    }
                } else if was_active {
                    account.is_active = false;
                    if account.status == AccountStatus::Active {
                        transitions.push((account.id.clone(), account.status, AccountStatus::Idle));
                        account.status = AccountStatus::Idle;
                    }
                    changed.push(account.clone());
                }
            }
            (changed, transitions, selected)
        };

        for account in &changed {
            self.store.save(account)?;
        }
        for (id, from, to) in transitions {
            self.emit(PoolEvent::StatusChanged { id, from, to });
        }
        Ok(selected.expect("target account verified present"))
    }

    /// Record that a request was just routed through this account.
    pub fn touch(&self, id: &str) {
        let updated = {
            let mut accounts = self.accounts.write().expect("pool lock");
            accounts.iter_mut().find(|a| a.id == id).map(|account| {
                account.last_used = Utc::now().timestamp();
                account.clone()
            })
        };
        if let Some(account) = updated {
            if let Err(e) = self.store.save(&account) {
                warn!(id, error = %e, "failed to persist last_used");
            }
        }
    }

    pub fn mark_rate_limited(&self, id: &str) {
        self.set_status(id, AccountStatus::RateLimited);
    }

    /// Authentication failure — quarantine until re-login.
    pub fn mark_error(&self, id: &str) {
        self.set_status(id, AccountStatus::Error);
    }

    pub fn set_status(&self, id: &str, to: AccountStatus) {
        let result = {
            let mut accounts = self.accounts.write().expect("pool lock");
            accounts.iter_mut().find(|a| a.id == id).and_then(|account| {
                let from = account.status;
                if from == to {
                    return None;
                }
                account.status = to;
                Some((account.clone(), from))
            })
        };
        if let Some((account, from)) = result {
            if let Err(e) = self.store.save(&account) {
                warn!(id, error = %e, "failed to persist status change");
            }
            self.emit(PoolEvent::StatusChanged {
                id: id.to_string(),
                from,
                to,
            });
        }
    }

    /// Swap in a fresh quota snapshot. Readers see either the previous
    /// snapshot in full or the new one — never a mix.
    pub fn apply_quota(&self, id: &str, quota: Quota) {
        let updated = {
            let mut accounts = self.accounts.write().expect("pool lock");
            accounts.iter_mut().find(|a| a.id == id).map(|account| {
                account.quota = quota;
                account.clone()
            })
        };
        if let Some(account) = updated {
            if let Err(e) = self.store.save(&account) {
                warn!(id, error = %e, "failed to persist quota snapshot");
            }
            self.emit(PoolEvent::QuotaUpdated { id: id.to_string() });
        }
    }

    /// Rewrite an account's credential bundle (token refresh, key
    /// migration).
    pub fn update_credentials(&self, id: &str, credentials: String) -> Result<()> {
        let updated = {
            let mut accounts = self.accounts.write().expect("pool lock");
            accounts.iter_mut().find(|a| a.id == id).map(|account| {
                account.credentials = credentials;
                account.clone()
            })
        };
        match updated {
            Some(account) => self.store.save(&account),
            None => Err(LiftoffError::AccountNotFound { id: id.to_string() }),
        }
    }

    /// Bind the cloud project used for upstream requests.
    pub fn set_project(&self, id: &str, project_id: String) -> Result<()> {
        let updated = {
            let mut accounts = self.accounts.write().expect("pool lock");
            accounts.iter_mut().find(|a| a.id == id).map(|account| {
                account.project_id = Some(project_id);
                account.clone()
            })
        };
        match updated {
            Some(account) => self.store.save(&account),
            None => Err(LiftoffError::AccountNotFound { id: id.to_string() }),
        }
    }

    /// Auto-switch decision point. Called when the active account was
    /// rate-limited or dropped below the quota threshold.
    ///
    /// Candidate = highest overall percentage among non-rate-limited,
    /// non-error accounts; ties broken by most recent `last_used`. When no
    /// candidate qualifies the active account stays selected and
    /// [`PoolEvent::NoCapacity`] is emitted.
    pub fn auto_switch(&self, config: &ProxyConfig) -> Option<Account> {
        let (current, candidate) = {
            let accounts = self.accounts.read().expect("pool lock");
            let current = accounts.iter().find(|a| a.is_active).map(|a| a.id.clone());
            let candidate = accounts
                .iter()
                .filter(|a| {
                    !a.is_active
                        && a.status != AccountStatus::RateLimited
                        && a.status != AccountStatus::Error
                })
                .max_by(|a, b| {
                    let pa = overall_percentage(&a.quota, |m| config.is_model_visible(m));
                    let pb = overall_percentage(&b.quota, |m| config.is_model_visible(m));
                    pa.partial_cmp(&pb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.last_used.cmp(&b.last_used))
                })
                .map(|a| a.id.clone());
            (current, candidate)
        };

        let Some(target) = candidate else {
            info!("auto-switch found no usable account");
            self.emit(PoolEvent::NoCapacity);
            return None;
        };

        match self.switch_to(&target) {
            Ok(account) => {
                info!(from = ?current, to = %target, "auto-switched active account");
                self.emit(PoolEvent::AutoSwitched {
                    from: current,
                    to: target,
                });
                Some(account)
            }
            Err(e) => {
                warn!(error = %e, "auto-switch failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftoff_core::types::ModelQuota;

    fn pool() -> (AccountPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts"));
        (AccountPool::load(store), dir)
    }

    fn add(pool: &AccountPool, email: &str) -> Account {
        pool.add("Name".into(), email.into(), None, "iv:tag:ct".into(), false)
            .unwrap()
    }

    fn with_quota(pool: &AccountPool, id: &str, pct: f64) {
        let mut quota = Quota::default();
        quota.models.insert(
            "gemini-3-pro-preview".into(),
            ModelQuota {
                percentage: pct,
                reset_time: None,
            },
        );
        pool.apply_quota(id, quota);
    }

    #[test]
    fn switch_to_leaves_exactly_one_active() {
        let (pool, _dir) = pool();
        let a = add(&pool, "a@example.com");
        let b = add(&pool, "b@example.com");

        pool.switch_to(&a.id).unwrap();
        pool.switch_to(&b.id).unwrap();

        let accounts = pool.list();
        let active: Vec<&Account> = accounts.iter().filter(|x| x.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);
        assert_eq!(pool.get(&a.id).unwrap().status, AccountStatus::Idle);
        assert_eq!(active[0].status, AccountStatus::Active);
    }

    #[test]
    fn switch_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts"));
        let id = {
            let pool = AccountPool::load(store.clone());
            let a = add(&pool, "a@example.com");
            pool.switch_to(&a.id).unwrap();
            a.id
        };
        let reloaded = AccountPool::load(store);
        assert_eq!(reloaded.get_active().unwrap().id, id);
    }

    #[test]
    fn duplicate_email_rejected_unless_replacing() {
        let (pool, _dir) = pool();
        let first = add(&pool, "dup@example.com");
        let err = pool
            .add("N".into(), "dup@example.com".into(), None, "x".into(), false)
            .unwrap_err();
        assert!(matches!(err, LiftoffError::AccountExists { .. }));

        let second = pool
            .add("N".into(), "dup@example.com".into(), None, "x".into(), true)
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(pool.list().len(), 1);
    }

    #[test]
    fn delete_purges_document() {
        let (pool, dir) = pool();
        let a = add(&pool, "a@example.com");
        let path = dir.path().join("accounts").join(format!("{}.json", a.id));
        assert!(path.exists());
        pool.delete(&a.id).unwrap();
        assert!(!path.exists());
        assert!(pool.list().is_empty());
        assert!(matches!(
            pool.delete(&a.id),
            Err(LiftoffError::AccountNotFound { .. })
        ));
    }

    #[test]
    fn auto_switch_picks_highest_percentage() {
        let (pool, _dir) = pool();
        let active = add(&pool, "active@example.com");
        let low = add(&pool, "low@example.com");
        let high = add(&pool, "high@example.com");
        pool.switch_to(&active.id).unwrap();
        with_quota(&pool, &active.id, 5.0);
        with_quota(&pool, &low.id, 30.0);
        with_quota(&pool, &high.id, 90.0);

        let config = ProxyConfig::default();
        let switched = pool.auto_switch(&config).unwrap();
        assert_eq!(switched.id, high.id);
        assert!(pool.get(&high.id).unwrap().is_active);
    }

    #[test]
    fn auto_switch_skips_rate_limited_and_error_accounts() {
        let (pool, _dir) = pool();
        let active = add(&pool, "active@example.com");
        let limited = add(&pool, "limited@example.com");
        let broken = add(&pool, "broken@example.com");
        let ok = add(&pool, "ok@example.com");
        pool.switch_to(&active.id).unwrap();
        with_quota(&pool, &limited.id, 100.0);
        with_quota(&pool, &broken.id, 100.0);
        with_quota(&pool, &ok.id, 40.0);
        pool.mark_rate_limited(&limited.id);
        pool.mark_error(&broken.id);

        let switched = pool.auto_switch(&ProxyConfig::default()).unwrap();
        assert_eq!(switched.id, ok.id);
    }

    #[test]
    fn auto_switch_tie_breaks_on_most_recent_use() {
        let (pool, _dir) = pool();
        let active = add(&pool, "active@example.com");
        let older = add(&pool, "older@example.com");
        let newer = add(&pool, "newer@example.com");
        pool.switch_to(&active.id).unwrap();
        with_quota(&pool, &older.id, 50.0);
        with_quota(&pool, &newer.id, 50.0);
        // Force distinct last_used ordering without sleeping.
        {
            let mut accounts = pool.accounts.write().unwrap();
            for account in accounts.iter_mut() {
                if account.id == older.id {
                    account.last_used = 100;
                }
                if account.id == newer.id {
                    account.last_used = 200;
                }
            }
        }
        let switched = pool.auto_switch(&ProxyConfig::default()).unwrap();
        assert_eq!(switched.id, newer.id);
    }

    #[test]
    fn auto_switch_with_no_candidate_emits_no_capacity() {
        let (pool, _dir) = pool();
        let active = add(&pool, "active@example.com");
        let other = add(&pool, "other@example.com");
        pool.switch_to(&active.id).unwrap();
        pool.mark_rate_limited(&other.id);

        let mut rx = pool.subscribe();
        assert!(pool.auto_switch(&ProxyConfig::default()).is_none());
        // Active selection is unchanged.
        assert_eq!(pool.get_active().unwrap().id, active.id);

        let mut saw_no_capacity = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PoolEvent::NoCapacity) {
                saw_no_capacity = true;
            }
        }
        assert!(saw_no_capacity);
    }

    #[test]
    fn status_change_emits_event_once() {
        let (pool, _dir) = pool();
        let a = add(&pool, "a@example.com");
        let mut rx = pool.subscribe();
        pool.mark_rate_limited(&a.id);
        pool.mark_rate_limited(&a.id); // no-op, no second event

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let changes: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, PoolEvent::StatusChanged { .. }))
            .collect();
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn multiple_actives_on_disk_are_repaired_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts"));
        for (id, last_used) in [("a1", 100), ("a2", 200)] {
            store
                .save(&Account {
                    id: id.into(),
                    name: "N".into(),
                    email: format!("{id}@example.com"),
                    avatar_url: None,
                    provider: "google".into(),
                    status: AccountStatus::Active,
                    is_active: true,
                    last_used,
                    project_id: None,
                    credentials: String::new(),
                    quota: Quota::default(),
                })
                .unwrap();
        }
        let pool = AccountPool::load(store);
        let actives: Vec<Account> = pool.list().into_iter().filter(|a| a.is_active).collect();
        assert_eq!(actives.len(), 1);
        assert_eq!(actives[0].id, "a2");
    }
}
