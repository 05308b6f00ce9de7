//! Durable scalar store
//!
//! Persists small named 32-bit integers (`current_term`, `voted_for`) across
//! restarts, one file per key: `<prefix><key>.persist`. Writes go to a
//! temporary file which is atomically renamed over the target, so a crash
//! never leaves a partially visible value. Callers access this only under
//! the replica-state lock, so no locking is needed here.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::Result;

pub struct ScalarStore {
    prefix: PathBuf,
}

impl ScalarStore {
    /// `prefix` is the shared file-name stem, e.g. `/data/raft.3.`.
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut name = self.prefix.as_os_str().to_os_string();
        name.push(key);
        name.push(".persist");
        PathBuf::from(name)
    }

    /// Durably store `value` under `key`.
    pub fn store(&self, key: &str, value: i32) -> Result<()> {
        let target = self.path_for(key);
        let tmp = tmp_path(&target);

        let mut file = File::create(&tmp)?;
        file.write_all(&value.to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Load the value under `key`, or `default` when the file is absent or
    /// holds fewer than 4 bytes (e.g. a torn write we could not complete).
    pub fn load(&self, key: &str, default: i32) -> i32 {
        let target = self.path_for(key);
        match fs::read(&target) {
            Ok(bytes) if bytes.len() >= 4 => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
            Ok(_) => {
                tracing::warn!(path = %target.display(), "truncated scalar file, using default");
                default
            }
            Err(_) => default,
        }
    }
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScalarStore::new(dir.path().join("raft.0."));

        store.store("CurrentTerm", 7).unwrap();
        store.store("VotedFor", -1).unwrap();

        assert_eq!(store.load("CurrentTerm", 0), 7);
        assert_eq!(store.load("VotedFor", 0), -1);
    }

    #[test]
    fn test_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScalarStore::new(dir.path().join("raft.0."));
        assert_eq!(store.load("CurrentTerm", 42), 42);
    }

    #[test]
    fn test_load_truncated_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScalarStore::new(dir.path().join("raft.0."));
        fs::write(store.path_for("CurrentTerm"), [0xAB, 0xCD]).unwrap();
        assert_eq!(store.load("CurrentTerm", 9), 9);
    }

    #[test]
    fn test_overwrite_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScalarStore::new(dir.path().join("raft.0."));
        store.store("CurrentTerm", 1).unwrap();
        store.store("CurrentTerm", 2).unwrap();
        assert_eq!(store.load("CurrentTerm", 0), 2);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ScalarStore::new(dir.path().join("raft.1."));
            store.store("VotedFor", 3).unwrap();
        }
        let store = ScalarStore::new(dir.path().join("raft.1."));
        assert_eq!(store.load("VotedFor", -1), 3);
    }
}
