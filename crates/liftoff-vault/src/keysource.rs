//! Encryption key sources, in migration priority order.
//!
//! The primary key lives in the OS keychain and is minted on first use.
//! Two legacy sources exist so bundles written by older builds still
//! decrypt: the pre-rename keychain entry, and the fixed key the earliest
//! builds compiled into the binary.

use liftoff_core::error::{KeychainHint, LiftoffError, Result};
use rand::RngCore;
use tracing::{debug, info};
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;

const PRIMARY_SERVICE: &str = "liftoff";
const PRIMARY_USER: &str = "credential-key";
const LEGACY_SERVICE: &str = "antigravity-tools";
const LEGACY_USER: &str = "storage-key";

/// Fixed key shipped by pre-keychain builds. Only ever used to *read* old
/// bundles; nothing is encrypted under it anymore.
const LEGACY_FILE_KEY: [u8; KEY_LEN] = [
    0x61, 0x6e, 0x74, 0x69, 0x67, 0x72, 0x61, 0x76, 0x69, 0x74, 0x79, 0x2d, 0x74, 0x6f, 0x6f,
    0x6c, 0x73, 0x2d, 0x73, 0x74, 0x6f, 0x72, 0x61, 0x67, 0x65, 0x2d, 0x6b, 0x65, 0x79, 0x2d,
    0x30, 0x31,
];

/// A place a 32-byte AES key can be obtained from.
pub trait KeySource: Send + Sync {
    /// Short label used in migration reporting and logs.
    fn name(&self) -> &'static str;
    fn load(&self) -> Result<Zeroizing<[u8; KEY_LEN]>>;
}

/// Primary key in the OS keychain, created on first use.
pub struct PrimaryKeychainKey;

impl KeySource for PrimaryKeychainKey {
    fn name(&self) -> &'static str {
        "keychain-primary"
    }

    fn load(&self) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let entry = keyring::Entry::new(PRIMARY_SERVICE, PRIMARY_USER)
            .map_err(|e| keychain_unavailable(&e))?;
        match entry.get_password() {
            Ok(hex_key) => decode_key(&hex_key),
            Err(keyring::Error::NoEntry) => {
                info!("no primary credential key yet, minting one");
                let mut key = Zeroizing::new([0u8; KEY_LEN]);
                rand::rngs::OsRng.fill_bytes(key.as_mut());
                entry
                    .set_password(&hex::encode(key.as_ref()))
                    .map_err(|e| keychain_unavailable(&e))?;
                Ok(key)
            }
            Err(e) => Err(keychain_unavailable(&e)),
        }
    }
}

/// Pre-rename keychain entry. Read-only: absence is reported as an error and
/// the migration ladder simply moves on.
pub struct LegacyKeychainKey;

impl KeySource for LegacyKeychainKey {
    fn name(&self) -> &'static str {
        "keychain-legacy"
    }

    fn load(&self) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let entry = keyring::Entry::new(LEGACY_SERVICE, LEGACY_USER)
            .map_err(|e| keychain_unavailable(&e))?;
        let hex_key = entry.get_password().map_err(|e| keychain_unavailable(&e))?;
        decode_key(&hex_key)
    }
}

/// The compiled-in legacy key.
pub struct LegacyFileKey;

impl KeySource for LegacyFileKey {
    fn name(&self) -> &'static str {
        "file-legacy"
    }

    fn load(&self) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        Ok(Zeroizing::new(LEGACY_FILE_KEY))
    }
}

fn decode_key(hex_key: &str) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let bytes = hex::decode(hex_key.trim()).map_err(|_| LiftoffError::KeychainUnavailable {
        hint: KeychainHint::Denied,
    })?;
    let arr: [u8; KEY_LEN] =
        bytes
            .try_into()
            .map_err(|_| LiftoffError::KeychainUnavailable {
                hint: KeychainHint::Denied,
            })?;
    Ok(Zeroizing::new(arr))
}

/// Classify a keyring failure into the hint the UI can act on.
fn keychain_unavailable(err: &keyring::Error) -> LiftoffError {
    let text = err.to_string();
    debug!(error = %text, "keychain access failed");
    let hint = if text.contains("translocat") {
        KeychainHint::Translocation
    } else if text.contains("signature") || text.contains("unsigned") {
        KeychainHint::Unsigned
    } else {
        KeychainHint::Denied
    };
    LiftoffError::KeychainUnavailable { hint }
}
