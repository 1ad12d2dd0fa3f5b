use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle state of a pool account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Idle,
    RateLimited,
    Error,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::RateLimited => write!(f, "rate-limited"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Quota snapshot for a single model: how much of the window remains and
/// when the upstream expects it to return to 100%.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelQuota {
    /// Remaining capacity, 0–100. Zero denotes a hard rate limit.
    pub percentage: f64,
    /// Upstream-reported reset instant. `None` means unknown — callers must
    /// never substitute "now".
    pub reset_time: Option<DateTime<Utc>>,
}

/// Per-account quota: the last polled snapshot, keyed by model identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub models: HashMap<String, ModelQuota>,
    /// When the snapshot was taken. `None` until the first successful poll.
    pub polled_at: Option<DateTime<Utc>>,
}

impl Quota {
    /// True when any model reports a hard (0%) limit.
    pub fn any_exhausted(&self) -> bool {
        self.models.values().any(|m| m.percentage <= 0.0)
    }

    /// Earliest valid reset time across all models, if any is known.
    pub fn earliest_reset(&self) -> Option<DateTime<Utc>> {
        self.models.values().filter_map(|m| m.reset_time).min()
    }
}

/// An authenticated cloud account owned by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Provider tag, e.g. "google".
    pub provider: String,
    pub status: AccountStatus,
    /// At most one account in the pool carries `true`.
    pub is_active: bool,
    /// Epoch seconds of the last request routed through this account.
    pub last_used: i64,
    /// Cloud project bound to upstream requests, when known.
    #[serde(default)]
    pub project_id: Option<String>,
    /// C1 ciphertext bundle (`iv:tag:ct`, hex). Never exposed over HTTP.
    pub credentials: String,
    #[serde(default)]
    pub quota: Quota,
}

impl Account {
    /// Copy with the credential bundle stripped, for listing endpoints.
    pub fn redacted(&self) -> RedactedAccount {
        RedactedAccount {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            avatar_url: self.avatar_url.clone(),
            provider: self.provider.clone(),
            status: self.status,
            is_active: self.is_active,
            last_used: self.last_used,
            quota: self.quota.clone(),
        }
    }
}

/// Account view sent to clients — identical minus the credential bundle.
#[derive(Debug, Clone, Serialize)]
pub struct RedactedAccount {
    pub id: String,
    pub name: String,
    pub email: String,
    pub avatar_url: Option<String>,
    pub provider: String,
    pub status: AccountStatus,
    pub is_active: bool,
    pub last_used: i64,
    pub quota: Quota,
}

/// Static description of a logical model provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub name: &'static str,
    pub company: &'static str,
    pub color: &'static str,
}

/// Aggregated quota view for one provider group.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderGroup {
    pub provider: ProviderInfo,
    /// Model identifiers in this group, in input order.
    pub models: Vec<String>,
    /// Mean percentage over visible models, one decimal.
    pub avg_percentage: f64,
    /// Minimum valid reset time over visible models.
    pub earliest_reset: Option<DateTime<Utc>>,
}

/// Coarse health classification derived from the overall percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Limited,
    Critical,
}

impl HealthStatus {
    /// `>=50 healthy · [25,50) degraded · [10,25) limited · <10 critical`.
    pub fn from_percentage(pct: f64) -> Self {
        if pct >= 50.0 {
            HealthStatus::Healthy
        } else if pct >= 25.0 {
            HealthStatus::Degraded
        } else if pct >= 10.0 {
            HealthStatus::Limited
        } else {
            HealthStatus::Critical
        }
    }
}

/// Read-time aggregation of one account's quota across provider groups.
#[derive(Debug, Clone, Serialize)]
pub struct AccountStats {
    /// Known providers in registry order, then `others` last.
    pub groups: Vec<ProviderGroup>,
    /// Mean over all visible models, one decimal. Empty set yields 0.
    pub overall_percentage: f64,
    pub health: HealthStatus,
}

/// Round to one decimal place, the precision every percentage crosses the
/// boundary with.
pub fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_thresholds() {
        assert_eq!(HealthStatus::from_percentage(50.0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_percentage(49.9), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_percentage(25.0), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_percentage(24.9), HealthStatus::Limited);
        assert_eq!(HealthStatus::from_percentage(10.0), HealthStatus::Limited);
        assert_eq!(HealthStatus::from_percentage(9.9), HealthStatus::Critical);
        assert_eq!(HealthStatus::from_percentage(0.0), HealthStatus::Critical);
    }

    #[test]
    fn quota_exhaustion_and_reset() {
        let mut q = Quota::default();
        assert!(!q.any_exhausted());
        assert!(q.earliest_reset().is_none());

        let early = Utc::now();
        let late = early + chrono::Duration::hours(2);
        q.models.insert(
            "gemini-3-pro-preview".into(),
            ModelQuota {
                percentage: 0.0,
                reset_time: Some(late),
            },
        );
        q.models.insert(
            "claude-sonnet-4-5".into(),
            ModelQuota {
                percentage: 40.0,
                reset_time: Some(early),
            },
        );
        assert!(q.any_exhausted());
        assert_eq!(q.earliest_reset(), Some(early));
    }

    #[test]
    fn redacted_account_drops_credentials() {
        let account = Account {
            id: "a1".into(),
            name: "Test".into(),
            email: "t@example.com".into(),
            avatar_url: None,
            provider: "google".into(),
            status: AccountStatus::Idle,
            is_active: false,
            last_used: 0,
            project_id: None,
            credentials: "aa:bb:cc".into(),
            quota: Quota::default(),
        };
        let json = serde_json::to_value(account.redacted()).unwrap();
        assert!(json.get("credentials").is_none());
        assert_eq!(json["email"], "t@example.com");
    }

    #[test]
    fn round1_rounds_half_up() {
        assert_eq!(round1(59.99), 60.0);
        assert_eq!(round1(33.333), 33.3);
        assert_eq!(round1(0.05), 0.1);
    }
}
