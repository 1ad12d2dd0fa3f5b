pub mod accounts;
pub mod health;
pub mod messages;
pub mod settings;

use axum::http::StatusCode;
use axum::Json;

use liftoff_core::error::LiftoffError;
use liftoff_relay::claude::ErrorResponse;

/// Map a core error onto an HTTP status and the `CODE|HINT` error body.
pub fn error_response(err: &LiftoffError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err {
        LiftoffError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        LiftoffError::AccountNotFound { .. } => StatusCode::NOT_FOUND,
        LiftoffError::AccountExists { .. } => StatusCode::CONFLICT,
        LiftoffError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        LiftoffError::NoAccount => StatusCode::SERVICE_UNAVAILABLE,
        LiftoffError::AuthRejected { .. } | LiftoffError::UpstreamUnavailable(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse::new(err.code_hint(), err.to_string())),
    )
}
