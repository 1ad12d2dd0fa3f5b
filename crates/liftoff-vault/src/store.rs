//! Bundle encryption and the key-migration ladder.
//!
//! Bundles are `iv_hex:tag_hex:ct_hex` — AES-256-GCM with a fresh 16-byte
//! IV per encryption. Decryption tries the primary key first, then each
//! legacy source in order; a fallback hit re-encrypts under the primary so
//! the caller can rewrite storage and retire the old key.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce};
use rand::RngCore;
use tracing::{debug, info};
use zeroize::Zeroizing;

use liftoff_core::error::{LiftoffError, MigrationHint, Result};

use crate::keysource::{KeySource, LegacyFileKey, LegacyKeychainKey, PrimaryKeychainKey, KEY_LEN};

/// AES-256-GCM with the 16-byte IV the bundle format mandates.
type BundleCipher = AesGcm<Aes256, U16>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Result of [`CredentialStore::decrypt_with_migration`].
#[derive(Debug)]
pub struct DecryptOutcome {
    pub plaintext: String,
    /// Name of the legacy source that decrypted the bundle, when the primary
    /// key did not.
    pub used_fallback: Option<&'static str>,
    /// Replacement bundle encrypted under the primary key. Present exactly
    /// when `used_fallback` is — callers must rewrite their storage with it.
    pub reencrypted: Option<String>,
}

pub struct CredentialStore {
    primary: Box<dyn KeySource>,
    legacy: Vec<Box<dyn KeySource>>,
}

impl CredentialStore {
    /// Production store: OS keychain primary, keychain + file legacy.
    pub fn new_system() -> Self {
        Self {
            primary: Box::new(PrimaryKeychainKey),
            legacy: vec![Box::new(LegacyKeychainKey), Box::new(LegacyFileKey)],
        }
    }

    /// Store with explicit key sources. Tests use this to stay off the OS
    /// keychain.
    pub fn with_sources(primary: Box<dyn KeySource>, legacy: Vec<Box<dyn KeySource>>) -> Self {
        Self { primary, legacy }
    }

    /// Encrypt under the primary key into an `iv:tag:ct` hex bundle.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let key = self.primary.load()?;
        encrypt_with(&key, plaintext)
    }

    /// Decrypt a bundle, migrating it to the primary key when a legacy
    /// source was needed.
    pub fn decrypt_with_migration(&self, bundle: &str) -> Result<DecryptOutcome> {
        let (iv, tag, ct) = parse_bundle(bundle)?;

        // No primary key means nothing can be re-encrypted — fail before
        // touching the ciphertext.
        let primary_key = self.primary.load()?;

        if let Some(plaintext) = try_decrypt(&primary_key, &iv, &tag, &ct) {
            return Ok(DecryptOutcome {
                plaintext,
                used_fallback: None,
                reencrypted: None,
            });
        }

        for source in &self.legacy {
            let key = match source.load() {
                Ok(k) => k,
                Err(e) => {
                    debug!(source = source.name(), error = %e, "legacy key source unavailable, skipping");
                    continue;
                }
            };
            if let Some(plaintext) = try_decrypt(&key, &iv, &tag, &ct) {
                info!(source = source.name(), "credential bundle decrypted with legacy key, re-encrypting");
                let reencrypted = encrypt_with(&primary_key, &plaintext)?;
                return Ok(DecryptOutcome {
                    plaintext,
                    used_fallback: Some(source.name()),
                    reencrypted: Some(reencrypted),
                });
            }
        }

        Err(LiftoffError::DataMigrationFailed {
            hint: MigrationHint::Relogin,
        })
    }
}

fn encrypt_with(key: &Zeroizing<[u8; KEY_LEN]>, plaintext: &str) -> Result<String> {
    let cipher = BundleCipher::new(Key::<BundleCipher>::from_slice(key.as_ref()));
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let sealed = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_bytes())
        .map_err(|_| LiftoffError::Internal("credential encryption failed".into()))?;

    // aes-gcm appends the tag to the ciphertext; the bundle format keeps
    // them separate.
    let (ct, tag) = sealed.split_at(sealed.len() - TAG_LEN);
    Ok(format!(
        "{}:{}:{}",
        hex::encode(iv),
        hex::encode(tag),
        hex::encode(ct)
    ))
}

fn try_decrypt(
    key: &Zeroizing<[u8; KEY_LEN]>,
    iv: &[u8],
    tag: &[u8],
    ct: &[u8],
) -> Option<String> {
    let cipher = BundleCipher::new(Key::<BundleCipher>::from_slice(key.as_ref()));
    let mut sealed = Vec::with_capacity(ct.len() + tag.len());
    sealed.extend_from_slice(ct);
    sealed.extend_from_slice(tag);
    let plain = cipher.decrypt(Nonce::<U16>::from_slice(iv), sealed.as_slice()).ok()?;
    String::from_utf8(plain).ok()
}

/// Split and hex-decode an `iv:tag:ct` bundle. A malformed bundle cannot be
/// migrated under any key, so it surfaces the clear-data hint.
fn parse_bundle(bundle: &str) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let malformed = || LiftoffError::DataMigrationFailed {
        hint: MigrationHint::ClearData,
    };
    let mut parts = bundle.splitn(3, ':');
    let iv = hex::decode(parts.next().ok_or_else(malformed)?).map_err(|_| malformed())?;
    let tag = hex::decode(parts.next().ok_or_else(malformed)?).map_err(|_| malformed())?;
    let ct = hex::decode(parts.next().ok_or_else(malformed)?).map_err(|_| malformed())?;
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(malformed());
    }
    Ok((iv, tag, ct))
}
