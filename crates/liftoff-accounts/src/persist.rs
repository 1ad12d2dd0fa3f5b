//! On-disk layout: one JSON document per account under
//! `<data_dir>/accounts/<id>.json`, written rename-on-write. The credential
//! field inside each document is the vault ciphertext bundle — plaintext
//! tokens never touch disk.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use liftoff_core::error::Result;
use liftoff_core::persist::{atomic_write_json, read_json};
use liftoff_core::types::Account;

#[derive(Debug, Clone)]
pub struct AccountStore {
    dir: PathBuf,
}

impl AccountStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn save(&self, account: &Account) -> Result<()> {
        atomic_write_json(self.path_for(&account.id), account)
    }

    /// Remove the account document, purging its credential bundle with it.
    pub fn remove(&self, id: &str) -> Result<()> {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every readable account document. Unparsable files are skipped
    /// with a warning rather than poisoning startup.
    pub fn load_all(&self) -> Vec<Account> {
        let mut accounts = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return accounts,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Account>(&path) {
                Ok(account) => accounts.push(account),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable account document"),
            }
        }
        accounts
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
