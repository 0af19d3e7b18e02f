//! Per-session credential workspace and the credential store inside it.

use prime_core::error::{PairingError, PrimeError};
use serde_json::Value;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// File the protocol client's credentials are persisted to.
pub const CREDS_FILE: &str = "creds.json";

/// A directory owned by exactly one session.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    /// Create `root/<session_id>`. Fails if it already exists.
    pub async fn create(root: &Path, session_id: &str) -> Result<Self, PairingError> {
        tokio::fs::create_dir_all(root).await.map_err(|e| {
            PairingError::Workspace(format!("cannot create {}: {e}", root.display()))
        })?;
        let path = root.join(session_id);
        tokio::fs::create_dir(&path).await.map_err(|e| {
            PairingError::Workspace(format!("cannot create {}: {e}", path.display()))
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recursively delete the directory. Missing is fine; other failures are logged.
    pub async fn remove(&self) {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("workspace: failed to remove {}: {e}", self.path.display()),
        }
    }
}

/// The session's `creds.json`, loaded once and rewritten on every update.
pub struct CredentialStore {
    path: PathBuf,
    creds: Option<Value>,
}

impl CredentialStore {
    /// Load `creds.json` from `dir` if present. An unreadable file counts as empty.
    pub async fn load(dir: &Path) -> Self {
        let path = dir.join(CREDS_FILE);
        let creds = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("workspace: ignoring malformed {}: {e}", path.display());
                    None
                }
            },
            Err(_) => None,
        };
        Self { path, creds }
    }

    pub fn credentials(&self) -> Option<&Value> {
        self.creds.as_ref()
    }

    /// Whether the stored credentials belong to an already linked device.
    pub fn is_registered(&self) -> bool {
        self.creds
            .as_ref()
            .and_then(|c| c.get("registered"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Replace the stored credentials and write them to disk.
    pub async fn save(&mut self, creds: Value) -> Result<(), PrimeError> {
        let text = serde_json::to_string_pretty(&creds)?;
        tokio::fs::write(&self.path, text).await?;
        self.creds = Some(creds);
        Ok(())
    }

    /// Raw `creds.json` text, exactly as persisted.
    pub async fn read_raw(&self) -> Result<String, PrimeError> {
        Ok(tokio::fs::read_to_string(&self.path).await?)
    }
}

/// Remove directories under `root` that no tracked session owns and that are
/// at least `max_age` old. Returns what was removed.
pub async fn sweep_orphans(
    root: &Path,
    tracked: &HashSet<String>,
    max_age: Duration,
) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(e) => e,
        Err(_) => return removed,
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("workspace: failed to scan {}: {e}", root.display());
                break;
            }
        };

        let name = entry.file_name().to_string_lossy().to_string();
        if tracked.contains(&name) {
            continue;
        }
        let meta = match entry.metadata().await {
            Ok(m) if m.is_dir() => m,
            _ => continue,
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!("workspace: removed orphaned {}", path.display());
                removed.push(path);
            }
            Err(e) => warn!("workspace: failed to remove orphan {}: {e}", path.display()),
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_is_exclusive() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path(), "session_1").await.unwrap();
        assert!(ws.path().is_dir());

        let err = Workspace::create(root.path(), "session_1").await.unwrap_err();
        assert!(matches!(err, PairingError::Workspace(_)));
    }

    #[tokio::test]
    async fn test_create_makes_missing_root() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("a").join("sessions");
        let ws = Workspace::create(&root, "s").await.unwrap();
        assert!(ws.path().starts_with(&root));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path(), "s").await.unwrap();
        tokio::fs::write(ws.path().join("creds.json"), "{}")
            .await
            .unwrap();
        tokio::fs::create_dir(ws.path().join("keys")).await.unwrap();

        ws.remove().await;
        assert!(!ws.path().exists());
        ws.remove().await;
        assert!(!ws.path().exists());
    }

    #[tokio::test]
    async fn test_store_empty_workspace_not_registered() {
        let root = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(root.path()).await;
        assert!(store.credentials().is_none());
        assert!(!store.is_registered());
    }

    #[tokio::test]
    async fn test_store_save_and_reload() {
        let root = tempfile::tempdir().unwrap();
        let mut store = CredentialStore::load(root.path()).await;
        store
            .save(serde_json::json!({"registered": true, "me": {"id": "1555"}}))
            .await
            .unwrap();
        assert!(store.is_registered());

        let raw = store.read_raw().await.unwrap();
        assert!(raw.contains("\"registered\": true"));

        let reloaded = CredentialStore::load(root.path()).await;
        assert!(reloaded.is_registered());
        assert_eq!(reloaded.credentials().unwrap()["me"]["id"], "1555");
    }

    #[tokio::test]
    async fn test_store_malformed_file_ignored() {
        let root = tempfile::tempdir().unwrap();
        tokio::fs::write(root.path().join(CREDS_FILE), "{not json")
            .await
            .unwrap();
        let store = CredentialStore::load(root.path()).await;
        assert!(store.credentials().is_none());
    }

    #[tokio::test]
    async fn test_sweep_orphans_skips_tracked() {
        let root = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(root.path().join("session_live"))
            .await
            .unwrap();
        tokio::fs::create_dir(root.path().join("session_dead"))
            .await
            .unwrap();
        tokio::fs::write(root.path().join("stray.txt"), "x")
            .await
            .unwrap();

        let tracked: HashSet<String> = ["session_live".to_string()].into();
        let removed = sweep_orphans(root.path(), &tracked, Duration::ZERO).await;

        assert_eq!(removed, vec![root.path().join("session_dead")]);
        assert!(root.path().join("session_live").exists());
        assert!(root.path().join("stray.txt").exists());
    }

    #[tokio::test]
    async fn test_sweep_orphans_respects_age() {
        let root = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(root.path().join("session_new"))
            .await
            .unwrap();

        let removed =
            sweep_orphans(root.path(), &HashSet::new(), Duration::from_secs(3600)).await;
        assert!(removed.is_empty());
        assert!(root.path().join("session_new").exists());
    }
}
