//! Per-account quota metadata fetch.
//!
//! The upstream exposes per-model quota as part of its model listing RPC;
//! each entry carries a remaining fraction and the instant the window is
//! expected to reset. Base URLs are tried in order on transport failure,
//! mirroring the dispatcher's failover order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use liftoff_core::config::ProxyConfig;
use liftoff_core::error::{LiftoffError, Result};
use liftoff_core::types::{ModelQuota, Quota};

/// Seam for the poller: production uses [`HttpQuotaClient`], tests script
/// their own snapshots.
#[async_trait]
pub trait QuotaClient: Send + Sync {
    async fn fetch_quota(&self, access_token: &str) -> Result<Quota>;
}

pub struct HttpQuotaClient {
    http: reqwest::Client,
    bases: Vec<String>,
}

impl HttpQuotaClient {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(config.request_user_agent.clone())
            .timeout(config.attempt_timeout());
        if config.upstream_proxy.enabled && !config.upstream_proxy.url.is_empty() {
            let proxy = reqwest::Proxy::all(&config.upstream_proxy.url)
                .map_err(|e| LiftoffError::Config(format!("invalid upstream proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }
        Ok(Self {
            http: builder
                .build()
                .map_err(|e| LiftoffError::Internal(format!("http client: {e}")))?,
            bases: config.base_urls(),
        })
    }
}

#[async_trait]
impl QuotaClient for HttpQuotaClient {
    async fn fetch_quota(&self, access_token: &str) -> Result<Quota> {
        let mut last_err: Option<LiftoffError> = None;

        for base in &self.bases {
            let url = format!("{base}:fetchAvailableModels");
            let resp = match self
                .http
                .post(&url)
                .bearer_auth(access_token)
                .header("Content-Type", "application/json")
                .json(&serde_json::json!({}))
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    debug!(base = %base, error = %e, "quota endpoint unreachable, trying next");
                    last_err = Some(LiftoffError::UpstreamUnavailable(e.to_string()));
                    continue;
                }
            };

            let status = resp.status().as_u16();
            if status == 401 || status == 403 {
                let text = resp.text().await.unwrap_or_default();
                return Err(LiftoffError::AuthRejected {
                    status,
                    message: text,
                });
            }
            if !resp.status().is_success() {
                let text = resp.text().await.unwrap_or_default();
                warn!(base = %base, status, body = %text, "quota fetch failed");
                last_err = Some(LiftoffError::UpstreamUnavailable(format!(
                    "quota fetch returned {status}"
                )));
                continue;
            }

            let envelope: FetchModelsEnvelope = resp
                .json()
                .await
                .map_err(|e| LiftoffError::Internal(format!("quota response: {e}")))?;
            return Ok(parse_models(envelope));
        }

        Err(last_err
            .unwrap_or_else(|| LiftoffError::UpstreamUnavailable("no base urls configured".into())))
    }
}

fn parse_models(envelope: FetchModelsEnvelope) -> Quota {
    // Some internal endpoints double-wrap the payload.
    let models = envelope
        .response
        .map(|r| r.models)
        .unwrap_or(envelope.models);

    let mut quota = Quota {
        polled_at: Some(Utc::now()),
        ..Default::default()
    };
    for model in models {
        let Some(info) = model.quota_info else {
            continue;
        };
        let percentage = (info.remaining_fraction.clamp(0.0, 1.0) * 1000.0).round() / 10.0;
        quota.models.insert(
            model.name,
            ModelQuota {
                percentage,
                reset_time: info.reset_time,
            },
        );
    }
    quota
}

// Upstream response types (private — deserialization only)

#[derive(Deserialize)]
struct FetchModelsEnvelope {
    response: Option<FetchModelsInner>,
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct FetchModelsInner {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
    #[serde(rename = "quotaInfo")]
    quota_info: Option<QuotaInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotaInfo {
    #[serde(default)]
    remaining_fraction: f64,
    reset_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_model_list() {
        let envelope: FetchModelsEnvelope = serde_json::from_str(
            r#"{"models":[
                {"name":"gemini-3-pro-preview","quotaInfo":{"remainingFraction":0.425,"resetTime":"2026-08-01T12:00:00Z"}},
                {"name":"gemini-2.0-flash","quotaInfo":{"remainingFraction":0.0}},
                {"name":"embedding-001"}
            ]}"#,
        )
        .unwrap();
        let quota = parse_models(envelope);
        assert_eq!(quota.models.len(), 2);
        assert_eq!(quota.models["gemini-3-pro-preview"].percentage, 42.5);
        assert!(quota.models["gemini-3-pro-preview"].reset_time.is_some());
        assert_eq!(quota.models["gemini-2.0-flash"].percentage, 0.0);
        assert!(quota.models["gemini-2.0-flash"].reset_time.is_none());
        assert!(quota.any_exhausted());
    }

    #[test]
    fn parses_double_wrapped_payload() {
        let envelope: FetchModelsEnvelope = serde_json::from_str(
            r#"{"response":{"models":[
                {"name":"gemini-3-pro-preview","quotaInfo":{"remainingFraction":1.0}}
            ]}}"#,
        )
        .unwrap();
        let quota = parse_models(envelope);
        assert_eq!(quota.models["gemini-3-pro-preview"].percentage, 100.0);
    }

    #[test]
    fn out_of_range_fractions_are_clamped() {
        let envelope: FetchModelsEnvelope = serde_json::from_str(
            r#"{"models":[{"name":"m","quotaInfo":{"remainingFraction":1.7}}]}"#,
        )
        .unwrap();
        let quota = parse_models(envelope);
        assert_eq!(quota.models["m"].percentage, 100.0);
    }
}
