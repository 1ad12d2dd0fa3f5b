//! Credential store: AES-256-GCM encryption of account secrets at rest,
//! with transparent migration between encryption key sources.

pub mod keysource;
pub mod store;

pub use keysource::{KeySource, LegacyFileKey, LegacyKeychainKey, PrimaryKeychainKey};
pub use store::{CredentialStore, DecryptOutcome};
