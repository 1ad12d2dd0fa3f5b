use thiserror::Error;

/// Hint sub-code attached to keychain failures. The front end resolves the
/// combined `CODE|HINT` string to a localized message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeychainHint {
    /// macOS Gatekeeper ran the app from a translocated (randomized) path.
    Translocation,
    /// The OS keychain refused access to the entry.
    Denied,
    /// The binary is unsigned, so the keychain cannot pin an identity to it.
    Unsigned,
}

impl KeychainHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeychainHint::Translocation => "HINT_APP_TRANSLOCATION",
            KeychainHint::Denied => "HINT_KEYCHAIN_DENIED",
            KeychainHint::Unsigned => "HINT_UNSIGNED_BUILD",
        }
    }
}

/// Hint sub-code attached to credential-migration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationHint {
    /// Re-running the login flow will mint fresh credentials.
    Relogin,
    /// The stored data is unreadable under every known key; wipe it.
    ClearData,
}

impl MigrationHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationHint::Relogin => "HINT_RELOGIN",
            MigrationHint::ClearData => "HINT_CLEAR_DATA",
        }
    }
}

#[derive(Debug, Error)]
pub enum LiftoffError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transient upstream failure after every endpoint was tried.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// 401/403 from the upstream — a token problem, never retried.
    #[error("Upstream rejected credentials ({status}): {message}")]
    AuthRejected { status: u16, message: String },

    /// Explicit quota exhaustion (upstream 429 or percentage 0).
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("No active account available")]
    NoAccount,

    #[error("Account not found: {id}")]
    AccountNotFound { id: String },

    #[error("Account already exists for {email}")]
    AccountExists { email: String },

    #[error("Keychain unavailable")]
    KeychainUnavailable { hint: KeychainHint },

    #[error("Credential data could not be migrated")]
    DataMigrationFailed { hint: MigrationHint },

    /// Malformed client request — surfaced as a 4xx, never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Broken core invariant — logged, offending account quarantined.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LiftoffError {
    /// Short error code string for the process boundary.
    pub fn code(&self) -> &'static str {
        match self {
            LiftoffError::Config(_) => "ERR_CONFIG",
            LiftoffError::UpstreamUnavailable(_) => "ERR_UPSTREAM_UNAVAILABLE",
            LiftoffError::AuthRejected { .. } => "ERR_AUTH_REJECTED",
            LiftoffError::RateLimited(_) => "ERR_RATE_LIMITED",
            LiftoffError::NoAccount => "ERR_NO_ACCOUNT",
            LiftoffError::AccountNotFound { .. } => "ERR_ACCOUNT_NOT_FOUND",
            LiftoffError::AccountExists { .. } => "ERR_ACCOUNT_EXISTS",
            LiftoffError::KeychainUnavailable { .. } => "ERR_KEYCHAIN_UNAVAILABLE",
            LiftoffError::DataMigrationFailed { .. } => "ERR_DATA_MIGRATION_FAILED",
            LiftoffError::InvalidRequest(_) => "ERR_INVALID_REQUEST",
            LiftoffError::Serialization(_) => "ERR_SERIALIZATION",
            LiftoffError::Io(_) => "ERR_IO",
            LiftoffError::Internal(_) => "ERR_INTERNAL",
        }
    }

    /// `CODE|HINT` string sent across the process boundary. Errors without a
    /// hint carry the bare code; unknown codes pass through untouched on the
    /// receiving side.
    pub fn code_hint(&self) -> String {
        match self {
            LiftoffError::KeychainUnavailable { hint } => {
                format!("{}|{}", self.code(), hint.as_str())
            }
            LiftoffError::DataMigrationFailed { hint } => {
                format!("{}|{}", self.code(), hint.as_str())
            }
            _ => self.code().to_string(),
        }
    }

    /// True for the single retryable category: transient upstream failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, LiftoffError::UpstreamUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, LiftoffError>;
