use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Built-in internal base URLs, tried in order when the config leaves
/// `internal_base_urls` empty.
pub const DEFAULT_INTERNAL_BASE_URLS: &[&str] = &[
    "https://cloudcode-pa.googleapis.com/v1internal",
    "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal",
];

pub const DEFAULT_USER_AGENT: &str = "antigravity-ide/1.4 liftoff";
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8045;

/// Top-level config (`settings.json` + `LIFTOFF_*` env overrides, plus the
/// dedicated proxy env vars handled in [`ProxyConfig::apply_env`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Per-model visibility for quota aggregation. Absent key = visible.
    #[serde(default)]
    pub model_visibility: HashMap<String, bool>,
    #[serde(default = "bool_true")]
    pub provider_groupings_enabled: bool,
    #[serde(default = "bool_true")]
    pub auto_switch_enabled: bool,
    /// Overall-percentage floor below which the active account is switched
    /// away from. Matches the `limited` health band by default.
    #[serde(default = "default_auto_switch_threshold")]
    pub auto_switch_threshold: f64,
    #[serde(default)]
    pub upstream_proxy: UpstreamProxyConfig,
    /// Per-endpoint-attempt timeout in seconds. Clamped to >= 1 on read.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Overrides the built-in internal base URL list when non-empty.
    #[serde(default)]
    pub internal_base_urls: Vec<String>,
    #[serde(default = "default_user_agent")]
    pub request_user_agent: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// HTTP(S)/SOCKS proxy for outbound upstream calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            model_visibility: HashMap::new(),
            provider_groupings_enabled: true,
            auto_switch_enabled: true,
            auto_switch_threshold: default_auto_switch_threshold(),
            upstream_proxy: UpstreamProxyConfig::default(),
            request_timeout: default_request_timeout(),
            internal_base_urls: Vec::new(),
            request_user_agent: default_user_agent(),
            data_dir: default_data_dir(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_auto_switch_threshold() -> f64 {
    25.0
}
fn default_request_timeout() -> u64 {
    120
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_poll_interval() -> u64 {
    60
}
fn default_data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.liftoff")
}

impl ProxyConfig {
    /// Load config from `settings.json` with `LIFTOFF_*` env overrides,
    /// then the dedicated proxy env vars on top.
    pub fn load(path: Option<&str>) -> crate::error::Result<Self> {
        let path = path.map(String::from).unwrap_or_else(default_settings_path);

        let mut config: ProxyConfig = Figment::new()
            .merge(Json::file(&path))
            .merge(Env::prefixed("LIFTOFF_"))
            .extract()
            .map_err(|e| crate::error::LiftoffError::Config(e.to_string()))?;

        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply the recognized proxy env vars. `lookup` is injected so tests
    /// never touch the process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let bases = lookup("PROXY_INTERNAL_BASE_URLS")
            .or_else(|| lookup("ANTIGRAVITY_INTERNAL_BASE_URLS"));
        if let Some(raw) = bases {
            let urls: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !urls.is_empty() {
                self.internal_base_urls = urls;
            }
        }
        if let Some(ua) = lookup("PROXY_REQUEST_USER_AGENT") {
            if !ua.trim().is_empty() {
                self.request_user_agent = ua;
            }
        }
    }

    /// Endpoint list: config override when non-empty, else the built-ins.
    /// Trailing slashes are stripped either way.
    pub fn base_urls(&self) -> Vec<String> {
        let urls: Vec<String> = if self.internal_base_urls.is_empty() {
            DEFAULT_INTERNAL_BASE_URLS
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            self.internal_base_urls.clone()
        };
        urls.into_iter()
            .map(|u| u.trim_end_matches('/').to_string())
            .collect()
    }

    /// Per-attempt timeout, clamped to at least one second.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    /// Absent key = visible.
    pub fn is_model_visible(&self, model: &str) -> bool {
        self.model_visibility.get(model).copied().unwrap_or(true)
    }

    pub fn settings_path(&self) -> String {
        format!("{}/settings.json", self.data_dir)
    }

    pub fn accounts_dir(&self) -> String {
        format!("{}/accounts", self.data_dir)
    }
}

fn default_settings_path() -> String {
    format!("{}/settings.json", default_data_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ProxyConfig::default();
        assert!(cfg.provider_groupings_enabled);
        assert!(cfg.auto_switch_enabled);
        assert_eq!(cfg.auto_switch_threshold, 25.0);
        assert_eq!(cfg.base_urls().len(), DEFAULT_INTERNAL_BASE_URLS.len());
        assert_eq!(cfg.server.port, DEFAULT_PORT);
    }

    #[test]
    fn timeout_clamps_to_one_second() {
        let cfg = ProxyConfig {
            request_timeout: 0,
            ..Default::default()
        };
        assert_eq!(cfg.attempt_timeout(), Duration::from_secs(1));
        let cfg = ProxyConfig {
            request_timeout: 30,
            ..Default::default()
        };
        assert_eq!(cfg.attempt_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn base_urls_strip_trailing_slashes() {
        let cfg = ProxyConfig {
            internal_base_urls: vec!["https://a.example/v1/".into(), "https://b.example".into()],
            ..Default::default()
        };
        assert_eq!(
            cfg.base_urls(),
            vec!["https://a.example/v1".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn env_overrides_base_urls_and_user_agent() {
        let mut cfg = ProxyConfig::default();
        cfg.apply_env(|name| match name {
            "PROXY_INTERNAL_BASE_URLS" => Some("https://x.example, https://y.example/".into()),
            "PROXY_REQUEST_USER_AGENT" => Some("custom-agent/2".into()),
            _ => None,
        });
        assert_eq!(
            cfg.base_urls(),
            vec!["https://x.example".to_string(), "https://y.example".to_string()]
        );
        assert_eq!(cfg.request_user_agent, "custom-agent/2");
    }

    #[test]
    fn legacy_env_alias_is_honored() {
        let mut cfg = ProxyConfig::default();
        cfg.apply_env(|name| match name {
            "ANTIGRAVITY_INTERNAL_BASE_URLS" => Some("https://legacy.example".into()),
            _ => None,
        });
        assert_eq!(cfg.base_urls(), vec!["https://legacy.example".to_string()]);
    }

    #[test]
    fn primary_env_var_wins_over_legacy_alias() {
        let mut cfg = ProxyConfig::default();
        cfg.apply_env(|name| match name {
            "PROXY_INTERNAL_BASE_URLS" => Some("https://new.example".into()),
            "ANTIGRAVITY_INTERNAL_BASE_URLS" => Some("https://legacy.example".into()),
            _ => None,
        });
        assert_eq!(cfg.base_urls(), vec!["https://new.example".to_string()]);
    }

    #[test]
    fn visibility_defaults_to_visible() {
        let mut cfg = ProxyConfig::default();
        cfg.model_visibility.insert("gemini-2.0-flash".into(), false);
        assert!(cfg.is_model_visible("gemini-3-pro-preview"));
        assert!(!cfg.is_model_visible("gemini-2.0-flash"));
    }
}
