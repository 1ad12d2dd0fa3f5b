//! Upstream dispatcher: authenticated POSTs against the internal base URL
//! list, with per-attempt timeouts and endpoint failover.
//!
//! Classification drives the failover walk: transport errors and
//! 408/429/5xx move to the next base URL, 401/403 fail fast (a token
//! problem follows the request to every endpoint), anything else is
//! terminal. The dispatcher never issues more POSTs than there are
//! endpoints.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use liftoff_core::config::ProxyConfig;
use liftoff_core::error::{LiftoffError, Result};

use crate::gemini::GeminiInternalRequest;

/// Cap on how much of an error payload is read when hunting for a
/// structured message.
const ERROR_READ_LIMIT: usize = 512 * 1024;

pub struct UpstreamDispatcher {
    http: reqwest::Client,
    bases: Vec<String>,
    timeout: Duration,
}

impl UpstreamDispatcher {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(config.request_user_agent.clone());
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
            timeout: config.attempt_timeout(),
        })
    }

    /// Dispatcher over explicit endpoints. Tests use this to point at local
    /// listeners with short timeouts.
    pub fn from_parts(bases: Vec<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            bases: bases
                .into_iter()
                .map(|b| b.trim_end_matches('/').to_string())
                .collect(),
            timeout,
        }
    }

    /// Non-streaming call. Double-wrapped `{response: {...}}` bodies are
    /// unwrapped before returning.
    pub async fn generate(
        &self,
        access_token: &str,
        body: &GeminiInternalRequest,
        extra_headers: &[(String, String)],
    ) -> Result<Value> {
        let resp = self
            .post_with_failover("generateContent", "", access_token, body, extra_headers)
            .await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| LiftoffError::UpstreamUnavailable(format!("response decode: {e}")))?;
        Ok(unwrap_response(value))
    }

    /// Streaming call. Returns the raw response so the caller can consume
    /// the byte stream without buffering; dropping the response cancels the
    /// upstream read.
    pub async fn generate_stream(
        &self,
        access_token: &str,
        body: &GeminiInternalRequest,
        extra_headers: &[(String, String)],
    ) -> Result<reqwest::Response> {
        self.post_with_failover(
            "streamGenerateContent",
            "?alt=sse",
            access_token,
            body,
            extra_headers,
        )
        .await
    }

    async fn post_with_failover(
        &self,
        method: &str,
        query: &str,
        access_token: &str,
        body: &GeminiInternalRequest,
        extra_headers: &[(String, String)],
    ) -> Result<reqwest::Response> {
        let mut last_err: Option<LiftoffError> = None;

        for base in &self.bases {
            let url = format!("{base}:{method}{query}");
            debug!(url = %url, "dispatching upstream request");

            let mut request = self
                .http
                .post(&url)
                .timeout(self.timeout)
                .bearer_auth(access_token)
                .header("Content-Type", "application/json")
                .json(body);
            for (name, value) in extra_headers {
                request = request.header(name, value);
            }

            let resp = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(url = %url, error = %e, "endpoint unreachable, trying next");
                    last_err = Some(LiftoffError::UpstreamUnavailable(e.to_string()));
                    continue;
                }
            };

            let status = resp.status().as_u16();
            if resp.status().is_success() {
                return Ok(resp);
            }

            let message = read_error_message(resp).await;
            match status {
                // Token problem — no endpoint will accept it.
                401 | 403 => {
                    warn!(url = %url, status, "upstream rejected credentials");
                    return Err(LiftoffError::AuthRejected { status, message });
                }
                408 | 429 | 500..=599 => {
                    warn!(url = %url, status, message = %message, "retryable upstream failure, trying next");
                    last_err = Some(if status == 429 {
                        LiftoffError::RateLimited(message)
                    } else {
                        LiftoffError::UpstreamUnavailable(format!("{status}: {message}"))
                    });
                    continue;
                }
                other => {
                    warn!(url = %url, status = other, message = %message, "terminal upstream failure");
                    return Err(LiftoffError::UpstreamUnavailable(format!(
                        "{other}: {message}"
                    )));
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| LiftoffError::UpstreamUnavailable("no base urls configured".into())))
    }
}

/// Some internal endpoints wrap the payload as `{response: {...}}`.
pub fn unwrap_response(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.get("response").is_some_and(Value::is_object) => {
            map.remove("response").expect("checked present")
        }
        other => other,
    }
}

/// Read up to [`ERROR_READ_LIMIT`] bytes of an error body and extract a
/// human-readable message, falling back to the raw text.
async fn read_error_message(resp: reqwest::Response) -> String {
    let mut collected: Vec<u8> = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        collected.extend_from_slice(&chunk);
        if collected.len() >= ERROR_READ_LIMIT {
            collected.truncate(ERROR_READ_LIMIT);
            break;
        }
    }
    let text = String::from_utf8_lossy(&collected).to_string();
    extract_error_message(&text).unwrap_or(text)
}

/// Hunt for `.error.message` / `.message` in a payload that may be plain
/// JSON or an SSE transcript. Returns `None` when nothing structured is
/// found.
pub fn extract_error_message(text: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if let Some(message) = message_from_value(&value) {
            return Some(message);
        }
    }
    for line in text.lines() {
        let Some(data) = line.trim().strip_prefix("data:") else {
            continue;
        };
        if let Ok(value) = serde_json::from_str::<Value>(data.trim()) {
            if let Some(message) = message_from_value(&value) {
                return Some(message);
            }
        }
    }
    None
}

fn message_from_value(value: &Value) -> Option<String> {
    let direct = value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("message"));
    direct
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
