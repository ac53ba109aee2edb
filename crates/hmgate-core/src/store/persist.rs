// # Persistent Store
//
// Durable snapshot of one interface's Description Cache and Value Cache.
//
// ## Crash recovery
//
// - Atomic writes: the blob goes to a temp file, then is renamed in place
// - Backup: the previous blob is kept as `.backup`
// - Recovery: a corrupt or mismatched blob falls back to the backup, then
//   to nothing (full re-fetch)
//
// ## File format
//
// ```json
// {
//   "version": 1,
//   "interface_id": "ccu-HmIP-RF",
//   "saved_at": "2025-01-09T12:00:00Z",
//   "descriptions": { "descriptions": [...], "paramsets": [...] },
//   "values": [{ "channel_address": "ABC123:1", "parameter": "LEVEL", ... }]
// }
// ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::store::description_cache::DescriptionSnapshot;
use crate::store::value_cache::PersistedValue;

/// Blob format version. A mismatch discards the blob.
pub const FORMAT_VERSION: u32 = 1;

/// Everything persisted for one interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    pub version: u32,
    pub interface_id: String,
    pub saved_at: DateTime<Utc>,
    pub descriptions: DescriptionSnapshot,
    pub values: Vec<PersistedValue>,
}

impl InterfaceSnapshot {
    pub fn new(
        interface_id: &str,
        descriptions: DescriptionSnapshot,
        values: Vec<PersistedValue>,
    ) -> Self {
        Self {
            version: FORMAT_VERSION,
            interface_id: interface_id.to_owned(),
            saved_at: Utc::now(),
            descriptions,
            values,
        }
    }
}

/// What [`PersistentStore::load`] found.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(InterfaceSnapshot),
    /// The main blob was unusable; the backup was.
    Recovered {
        snapshot: InterfaceSnapshot,
        error: CoreError,
    },
    /// Nothing usable on disk; the caller re-fetches.
    Discarded { error: CoreError },
    Missing,
}

/// File-backed blobs keyed by central id + interface id.
#[derive(Debug, Clone)]
pub struct PersistentStore {
    dir: PathBuf,
    central_id: String,
}

impl PersistentStore {
    pub fn new(dir: impl Into<PathBuf>, central_id: &str) -> Self {
        Self {
            dir: dir.into(),
            central_id: central_id.to_owned(),
        }
    }

    pub fn path_for(&self, interface_id: &str) -> PathBuf {
        let name = format!("{}-{}.json", sanitize(&self.central_id), sanitize(interface_id));
        self.dir.join(name)
    }

    /// Load the blob for `interface_id`. Never fails: problems are reported
    /// in the outcome so startup can continue with a re-fetch.
    pub async fn load(&self, interface_id: &str) -> LoadOutcome {
        let path = self.path_for(interface_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            debug!(path = %path.display(), "no persisted state");
            return LoadOutcome::Missing;
        }

        let error = match read_snapshot(&path, interface_id).await {
            Ok(snapshot) => {
                debug!(
                    path = %path.display(),
                    devices = snapshot.descriptions.descriptions.len(),
                    values = snapshot.values.len(),
                    "loaded persisted state"
                );
                return LoadOutcome::Loaded(snapshot);
            }
            Err(e) => e,
        };

        warn!(error = %error, "persisted state unusable, trying backup");
        let backup = backup_path(&path);
        if fs::try_exists(&backup).await.unwrap_or(false) {
            match read_snapshot(&backup, interface_id).await {
                Ok(snapshot) => {
                    info!(path = %backup.display(), "recovered persisted state from backup");
                    return LoadOutcome::Recovered { snapshot, error };
                }
                Err(backup_err) => {
                    warn!(error = %backup_err, "backup unusable as well");
                }
            }
        }

        LoadOutcome::Discarded { error }
    }

    /// Atomically replace the blob for the snapshot's interface.
    pub async fn save(&self, snapshot: &InterfaceSnapshot) -> Result<(), CoreError> {
        let path = self.path_for(&snapshot.interface_id);
        let io_err = |e: std::io::Error| CoreError::Internal(format!("{}: {e}", path.display()));

        fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| CoreError::Internal(format!("cannot serialize state: {e}")))?;

        let temp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&temp).await.map_err(io_err)?;
            file.write_all(&json).await.map_err(io_err)?;
            file.flush().await.map_err(io_err)?;
            file.sync_all().await.map_err(io_err)?;
        }

        if fs::try_exists(&path).await.unwrap_or(false) {
            if let Err(e) = fs::copy(&path, backup_path(&path)).await {
                warn!(error = %e, "could not refresh state backup");
            }
        }

        fs::rename(&temp, &path).await.map_err(io_err)?;
        debug!(
            path = %path.display(),
            values = snapshot.values.len(),
            "persisted state written"
        );
        Ok(())
    }

    /// Delete the blob and its backup.
    pub async fn clear(&self, interface_id: &str) -> Result<(), CoreError> {
        let path = self.path_for(interface_id);
        for p in [backup_path(&path), path] {
            match fs::remove_file(&p).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CoreError::Internal(format!("{}: {e}", p.display()))),
            }
        }
        Ok(())
    }
}

async fn read_snapshot(path: &Path, interface_id: &str) -> Result<InterfaceSnapshot, CoreError> {
    let corrupt = |reason: String| CoreError::PersistenceCorrupt {
        path: path.display().to_string(),
        reason,
    };

    let bytes = fs::read(path).await.map_err(|e| corrupt(e.to_string()))?;

    // Check the version before the full decode so format changes are
    // reported as such rather than as parse errors.
    #[derive(Deserialize)]
    struct Header {
        version: u32,
    }
    let header: Header =
        serde_json::from_slice(&bytes).map_err(|e| corrupt(format!("invalid JSON: {e}")))?;
    if header.version != FORMAT_VERSION {
        return Err(corrupt(format!(
            "format version {} (expected {FORMAT_VERSION})",
            header.version
        )));
    }

    let snapshot: InterfaceSnapshot =
        serde_json::from_slice(&bytes).map_err(|e| corrupt(format!("invalid state: {e}")))?;
    if snapshot.interface_id != interface_id {
        return Err(corrupt(format!(
            "belongs to interface {}",
            snapshot.interface_id
        )));
    }
    Ok(snapshot)
}

fn backup_path(path: &Path) -> PathBuf {
    path.with_extension("json.backup")
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use hmgate_api::Value;
    use tempfile::TempDir;

    use crate::store::value_cache::ValueKey;

    fn snapshot(level: f64) -> InterfaceSnapshot {
        InterfaceSnapshot::new(
            "ccu-HmIP-RF",
            DescriptionSnapshot::default(),
            vec![PersistedValue {
                key: ValueKey::new("ABC123:1", "LEVEL"),
                value: Value::Float(level),
                updated_at: Utc::now(),
            }],
        )
    }

    #[tokio::test]
    async fn missing_file_is_missing() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::new(dir.path(), "central");
        assert!(matches!(store.load("ccu-HmIP-RF").await, LoadOutcome::Missing));
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::new(dir.path(), "central");
        let saved = snapshot(0.5);
        store.save(&saved).await.unwrap();

        match store.load("ccu-HmIP-RF").await {
            LoadOutcome::Loaded(loaded) => assert_eq!(loaded, saved),
            other => panic!("expected Loaded, got {other:?}"),
        }
        assert!(store.path_for("ccu-HmIP-RF").ends_with("central-ccu-HmIP-RF.json"));
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_backup() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::new(dir.path(), "central");
        store.save(&snapshot(0.1)).await.unwrap();
        store.save(&snapshot(0.2)).await.unwrap();

        fs::write(store.path_for("ccu-HmIP-RF"), b"{ not json").await.unwrap();

        match store.load("ccu-HmIP-RF").await {
            LoadOutcome::Recovered { snapshot, error } => {
                assert_eq!(snapshot.values[0].value, Value::Float(0.1));
                assert!(matches!(error, CoreError::PersistenceCorrupt { .. }));
            }
            other => panic!("expected Recovered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn version_mismatch_is_discarded() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::new(dir.path(), "central");
        fs::write(
            store.path_for("ccu-HmIP-RF"),
            br#"{"version": 99, "interface_id": "ccu-HmIP-RF"}"#,
        )
        .await
        .unwrap();

        match store.load("ccu-HmIP-RF").await {
            LoadOutcome::Discarded { error } => {
                assert!(error.to_string().contains("format version 99"));
            }
            other => panic!("expected Discarded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clear_removes_blob_and_backup() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::new(dir.path(), "central");
        store.save(&snapshot(0.1)).await.unwrap();
        store.save(&snapshot(0.2)).await.unwrap();

        store.clear("ccu-HmIP-RF").await.unwrap();
        assert!(matches!(store.load("ccu-HmIP-RF").await, LoadOutcome::Missing));
        store.clear("ccu-HmIP-RF").await.unwrap();
    }
}
