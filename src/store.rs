//! Shared-store adapter (C1): typed read/write/list/delete of JSON
//! documents over a directory tree that may be a replicated filesystem
//! (e.g. an iCloud Drive folder). Writes are atomic against local readers
//! via write-temp-then-rename, the same pattern the original CLI uses for
//! its config and session files. The adapter does not attempt cross-host
//! locking -- it exposes the raw semantics of the underlying filesystem;
//! correctness under concurrent writers is the election protocol's job.
//!
//! Every operation runs its filesystem work inside `spawn_blocking`,
//! mirroring the teacher's use of `spawn_blocking` for its child-process
//! and shell-capture calls -- this is the concrete mechanism behind spec
//! §5's "the ingest loop yields (suspends)... during every store
//! read/write" on a store root that may be a slow, replicated mount.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BridgeError;

#[derive(Debug, Clone)]
pub struct SharedStore {
    root: PathBuf,
}

fn io_err(relative: &str, e: std::io::Error) -> BridgeError {
    BridgeError::StoreTransient(format!("{relative}: {e}"))
}

async fn run_blocking<F, T>(f: F) -> Result<T, BridgeError>
where
    F: FnOnce() -> Result<T, BridgeError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BridgeError::StoreTransient(format!("blocking task panicked: {e}")))?
}

impl SharedStore {
    /// Opens the store rooted at `root`, creating it if missing. Returns
    /// `StoreUnavailable` only if the root cannot be created at all
    /// (e.g. parent directory missing, permission denied) -- callers
    /// should treat that as "fall back to single-instance mode".
    pub fn open(root: PathBuf) -> Result<SharedStore, BridgeError> {
        std::fs::create_dir_all(&root)
            .map_err(|e| BridgeError::StoreUnavailable(format!("{}: {e}", root.display())))?;
        Ok(SharedStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub async fn read<T: DeserializeOwned>(&self, relative: &str) -> Result<Option<T>, BridgeError> {
        let path = self.resolve(relative);
        let rel = relative.to_string();
        let contents = run_blocking(move || match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&rel, e)),
        })
        .await?;
        match contents {
            Some(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|e| BridgeError::StoreTransient(format!("{relative}: parse error: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn write<T: Serialize>(&self, relative: &str, value: &T) -> Result<(), BridgeError> {
        let path = self.resolve(relative);
        let rel = relative.to_string();
        let serialized = serde_json::to_vec_pretty(value)
            .map_err(|e| BridgeError::StoreTransient(format!("{relative}: serialize error: {e}")))?;
        run_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(&rel, e))?;
            }
            let tmp_path = path.with_extension("tmp");
            std::fs::write(&tmp_path, &serialized).map_err(|e| io_err(&rel, e))?;
            std::fs::rename(&tmp_path, &path).map_err(|e| io_err(&rel, e))?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, relative: &str) -> Result<(), BridgeError> {
        let path = self.resolve(relative);
        let rel = relative.to_string();
        run_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&rel, e)),
        })
        .await
    }

    /// Lists every `<subdir>/*.json` document. Malformed files are
    /// skipped with a warning rather than failing the whole listing, so
    /// one corrupt DeviceRecord never hides the rest of the registry.
    pub async fn list_json(&self, subdir: &str) -> Result<Vec<(String, serde_json::Value)>, BridgeError> {
        let dir = self.resolve(subdir);
        let sub = subdir.to_string();
        run_blocking(move || {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(io_err(&sub, e)),
            };

            let mut out = Vec::new();
            for entry in entries {
                let Ok(entry) = entry else { continue };
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                match std::fs::read_to_string(&path) {
                    Ok(contents) => match serde_json::from_str(&contents) {
                        Ok(value) => out.push((stem.to_string(), value)),
                        Err(e) => tracing::warn!(file = %path.display(), error = %e, "skipping malformed store file"),
                    },
                    Err(e) => tracing::warn!(file = %path.display(), error = %e, "skipping unreadable store file"),
                }
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        value: u32,
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStore::open(dir.path().to_path_buf()).unwrap();
        store.write("state.json", &Doc { value: 7 }).await.unwrap();
        let read: Option<Doc> = store.read("state.json").await.unwrap();
        assert_eq!(read, Some(Doc { value: 7 }));
    }

    #[tokio::test]
    async fn read_missing_file_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStore::open(dir.path().to_path_buf()).unwrap();
        let read: Option<Doc> = store.read("nope.json").await.unwrap();
        assert_eq!(read, None);
    }

    #[tokio::test]
    async fn write_is_atomic_no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStore::open(dir.path().to_path_buf()).unwrap();
        store.write("devices/a.json", &Doc { value: 1 }).await.unwrap();
        assert!(!dir.path().join("devices/a.json.tmp").exists());
        assert!(dir.path().join("devices/a.json").exists());
    }

    #[tokio::test]
    async fn list_json_skips_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStore::open(dir.path().to_path_buf()).unwrap();
        store.write("devices/good.json", &Doc { value: 42 }).await.unwrap();
        std::fs::create_dir_all(dir.path().join("devices")).unwrap();
        std::fs::write(dir.path().join("devices/bad.json"), b"not json").unwrap();
        let listed = store.list_json("devices").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "good");
    }

    #[tokio::test]
    async fn list_json_on_missing_subdir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStore::open(dir.path().to_path_buf()).unwrap();
        assert!(store.list_json("devices").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStore::open(dir.path().to_path_buf()).unwrap();
        store.delete("nope.json").await.unwrap();
    }
}
