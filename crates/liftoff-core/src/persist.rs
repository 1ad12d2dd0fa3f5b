//! Rename-on-write JSON persistence helpers.
//!
//! Every on-disk document (account files, `settings.json`) goes through
//! [`atomic_write_json`]: write to a `.tmp` sibling, then rename over the
//! target so readers never observe a torn file.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::error::Result;

pub fn atomic_write_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Doc {
            name: "alpha".into(),
            count: 3,
        };
        atomic_write_json(&path, &doc).unwrap();
        let back: Doc = read_json(&path).unwrap();
        assert_eq!(back, doc);
        // No temp file left behind.
        assert!(!dir.path().join("doc.json.tmp").exists());
    }

    #[test]
    fn write_creates_missing_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deep/doc.json");
        atomic_write_json(
            &path,
            &Doc {
                name: "beta".into(),
                count: 1,
            },
        )
        .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn overwrite_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        atomic_write_json(&path, &Doc { name: "v1".into(), count: 1 }).unwrap();
        atomic_write_json(&path, &Doc { name: "v2".into(), count: 2 }).unwrap();
        let back: Doc = read_json(&path).unwrap();
        assert_eq!(back.name, "v2");
    }
}
