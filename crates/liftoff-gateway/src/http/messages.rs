//! POST /v1/messages — the dialect-A chat endpoint.
//!
//! Orchestration per request: pick the active account, refresh its bearer
//! token, rewrite the body, dispatch with failover, and translate the reply
//! back. On an upstream rate limit the account is marked and — when
//! auto-switch is on — the request is retried once against the freshly
//! selected account; a second rate limit surfaces to the client.

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use liftoff_accounts::auth::ensure_access_token;
use liftoff_core::error::{LiftoffError, Result};
use liftoff_relay::claude::MessagesRequest;
use liftoff_relay::gemini::GenerateContentResponse;
use liftoff_relay::sse::{pump, OutFrame};
use liftoff_relay::transform::{transform_request, translate_response};
use liftoff_relay::SignatureStore;

use crate::app::AppState;
use crate::http::error_response;

pub async fn messages_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MessagesRequest>,
) -> Response {
    match handle(&state, req).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, code = %err.code_hint(), "messages request failed");
            error_response(&err).into_response()
        }
    }
}

async fn handle(state: &Arc<AppState>, req: MessagesRequest) -> Result<Response> {
    if req.messages.is_empty() {
        return Err(LiftoffError::InvalidRequest("messages must not be empty".into()));
    }

    let mut attempted_switch = false;
    loop {
        let account = state.pool().get_active().ok_or(LiftoffError::NoAccount)?;
        let token =
            ensure_access_token(state.pool(), &state.deps.vault, &state.deps.auth, &account.id)
                .await?;
        let project = account.project_id.clone().unwrap_or_default();
        let out = transform_request(&req, &project, &state.signatures);
        info!(
            model = %req.model,
            resolved = %out.resolved_model,
            stream = req.stream,
            account = %account.id,
            "dispatching chat request"
        );

        let dispatcher = state.dispatcher.read().await.clone();
        let err = if req.stream {
            match dispatcher.generate_stream(&token, &out.body, &[]).await {
                Ok(upstream) => {
                    state.pool().touch(&account.id);
                    return Ok(stream_response(
                        upstream,
                        req.model.clone(),
                        state.signatures.clone(),
                    ));
                }
                Err(e) => e,
            }
        } else {
            match dispatcher.generate(&token, &out.body, &[]).await {
                Ok(value) => {
                    let parsed: GenerateContentResponse = serde_json::from_value(value)
                        .map_err(|e| {
                            LiftoffError::Internal(format!("unexpected upstream shape: {e}"))
                        })?;
                    state.pool().touch(&account.id);
                    let message = translate_response(&parsed, &req.model, &state.signatures);
                    return Ok(Json(message).into_response());
                }
                Err(e) => e,
            }
        };

        match err {
            LiftoffError::RateLimited(message) => {
                warn!(account = %account.id, "upstream rate limit");
                state.pool().mark_rate_limited(&account.id);
                let config = state.config().read().await.clone();
                if !attempted_switch && config.auto_switch_enabled {
                    attempted_switch = true;
                    if state.pool().auto_switch(&config).is_some() {
                        continue;
                    }
                }
                return Err(LiftoffError::RateLimited(message));
            }
            e @ LiftoffError::AuthRejected { .. } => {
                state.pool().mark_error(&account.id);
                return Err(e);
            }
            e => return Err(e),
        }
    }
}

/// Bridge the upstream byte stream through the reframer into an SSE
/// response. Dropping the client connection drops the receiver, which stops
/// the pump and cancels the upstream read.
fn stream_response(
    upstream: reqwest::Response,
    requested_model: String,
    signatures: Arc<SignatureStore>,
) -> Response {
    let (tx, rx) = mpsc::channel::<OutFrame>(64);
    tokio::spawn(pump(upstream, requested_model, signatures, tx));

    let stream = ReceiverStream::new(rx).map(|frame| {
        Ok::<_, Infallible>(
            Event::default()
                .event(frame.event)
                .data(frame.data.to_string()),
        )
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
