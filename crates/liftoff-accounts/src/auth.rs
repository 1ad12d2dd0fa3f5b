//! OAuth token lifecycle for pool accounts.
//!
//! Flow:
//!   1. The UI runs the authorization-code flow and hands the core an
//!      opaque code. `exchange_code` turns it into a token bundle plus the
//!      profile used for the account card.
//!   2. Before each upstream call, `ensure_access_token` checks expiry and
//!      refreshes with the stored refresh token when needed.
//!   3. Bundles live encrypted in the account document; refreshes and key
//!      migrations rewrite the document through the pool.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use liftoff_core::config::ProxyConfig;
use liftoff_core::error::{LiftoffError, Result};
use liftoff_vault::CredentialStore;

use crate::pool::AccountPool;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
const OAUTH_CLIENT_ID: &str =
    "461708817648-l1fdd4e33tnkq9cbm1oqt3hhm67tp3fl.apps.googleusercontent.com";
// Installed-app client: the "secret" is not confidential, it only pins the
// client identity during the code exchange.
const OAUTH_CLIENT_SECRET: &str = "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";
const OAUTH_REDIRECT_URI: &str = "http://localhost:8045/oauth/callback";

/// Refresh this many seconds before the recorded expiry.
const EXPIRY_SLACK_SECS: i64 = 60;

/// Decrypted credential bundle contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Unix millis.
    pub expiry_date: i64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Profile fields fetched alongside the code exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

pub struct AuthClient {
    http: reqwest::Client,
}

impl AuthClient {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(config.request_user_agent.clone());
        if config.upstream_proxy.enabled && !config.upstream_proxy.url.is_empty() {
            let proxy = reqwest::Proxy::all(&config.upstream_proxy.url)
                .map_err(|e| LiftoffError::Config(format!("invalid upstream proxy url: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| LiftoffError::Internal(format!("http client: {e}")))?;
        Ok(Self { http })
    }

    /// Exchange an authorization code for tokens and the account profile.
    pub async fn exchange_code(&self, auth_code: &str) -> Result<(TokenBundle, UserInfo)> {
        debug!("exchanging authorization code");
        let resp = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", auth_code),
                ("client_id", OAUTH_CLIENT_ID),
                ("client_secret", OAUTH_CLIENT_SECRET),
                ("redirect_uri", OAUTH_REDIRECT_URI),
            ])
            .send()
            .await
            .map_err(|e| LiftoffError::UpstreamUnavailable(format!("token endpoint: {e}")))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "authorization code exchange failed");
            return Err(LiftoffError::AuthRejected {
                status,
                message: text,
            });
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| LiftoffError::Internal(format!("token response: {e}")))?;
        let refresh_token = token.refresh_token.ok_or_else(|| {
            LiftoffError::AuthRejected {
                status: 400,
                message: "token endpoint returned no refresh_token".into(),
            }
        })?;
        let bundle = TokenBundle {
            access_token: token.access_token.clone(),
            refresh_token,
            token_type: token.token_type.unwrap_or_else(default_token_type),
            expiry_date: chrono::Utc::now().timestamp_millis() + token.expires_in as i64 * 1000,
        };

        let userinfo: UserInfo = self
            .http
            .get(USERINFO_URL)
            .bearer_auth(&bundle.access_token)
            .send()
            .await
            .map_err(|e| LiftoffError::UpstreamUnavailable(format!("userinfo: {e}")))?
            .json()
            .await
            .map_err(|e| LiftoffError::Internal(format!("userinfo response: {e}")))?;

        info!(email = %userinfo.email, "authorization code exchanged");
        Ok((bundle, userinfo))
    }

    /// Refresh an access token with the stored refresh token.
    pub async fn refresh(&self, current: &TokenBundle) -> Result<TokenBundle> {
        info!("refreshing upstream access token");
        let resp = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", current.refresh_token.as_str()),
                ("client_id", OAUTH_CLIENT_ID),
                ("client_secret", OAUTH_CLIENT_SECRET),
            ])
            .send()
            .await
            .map_err(|e| LiftoffError::UpstreamUnavailable(format!("token endpoint: {e}")))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "token refresh failed");
            return Err(LiftoffError::AuthRejected {
                status,
                message: text,
            });
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| LiftoffError::Internal(format!("token response: {e}")))?;
        debug!(expires_in = token.expires_in, "access token refreshed");

        Ok(TokenBundle {
            access_token: token.access_token,
            refresh_token: token
                .refresh_token
                .unwrap_or_else(|| current.refresh_token.clone()),
            token_type: token.token_type.unwrap_or_else(|| current.token_type.clone()),
            expiry_date: chrono::Utc::now().timestamp_millis() + token.expires_in as i64 * 1000,
        })
    }
}

/// Return a live bearer token for the account, refreshing and re-encrypting
/// as needed. Key-migrated or refreshed bundles are written back through the
/// pool before returning. An upstream auth rejection quarantines the
/// account.
pub async fn ensure_access_token(
    pool: &AccountPool,
    vault: &CredentialStore,
    auth: &AuthClient,
    account_id: &str,
) -> Result<String> {
    let account = pool
        .get(account_id)
        .ok_or_else(|| LiftoffError::AccountNotFound {
            id: account_id.to_string(),
        })?;

    let outcome = vault.decrypt_with_migration(&account.credentials)?;
    if let Some(reencrypted) = outcome.reencrypted {
        debug!(id = account_id, source = ?outcome.used_fallback, "credential bundle migrated");
        pool.update_credentials(account_id, reencrypted)?;
    }
    let bundle: TokenBundle = serde_json::from_str(&outcome.plaintext)?;

    let now = chrono::Utc::now().timestamp_millis();
    if now + EXPIRY_SLACK_SECS * 1000 < bundle.expiry_date {
        return Ok(bundle.access_token);
    }

    let refreshed = match auth.refresh(&bundle).await {
        Ok(b) => b,
        Err(e @ LiftoffError::AuthRejected { .. }) => {
            pool.mark_error(account_id);
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    let ciphertext = vault.encrypt(&serde_json::to_string(&refreshed)?)?;
    pool.update_credentials(account_id, ciphertext)?;
    Ok(refreshed.access_token)
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    token_type: Option<String>,
    #[serde(default = "default_expires")]
    expires_in: u64,
}

fn default_expires() -> u64 {
    3600
}
