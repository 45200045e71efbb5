//! JSON-file state store — one document, replaced atomically on flush.
//!
//! Document shape: `{ "chats": { "<channel>": ["<key>", ...] } }`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::traits::StateStore;
use crate::error::StoreError;

/// On-disk document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenDocument {
    #[serde(default)]
    pub chats: BTreeMap<String, Vec<String>>,
}

/// State store backed by a single JSON file.
pub struct JsonFileStore {
    path: PathBuf,
    doc: Mutex<SeenDocument>,
}

impl JsonFileStore {
    /// Open (or start) the state file at `path`.
    ///
    /// A missing file starts empty. An unreadable or corrupt file also
    /// starts empty: the cost is one possible duplicate re-delivery.
    pub async fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let doc = match read_document(&path).await {
            Ok(Some(doc)) => {
                info!(
                    path = %path.display(),
                    channels = doc.chats.len(),
                    "Seen state loaded"
                );
                doc
            }
            Ok(None) => {
                info!(path = %path.display(), "No seen state yet, starting empty");
                SeenDocument::default()
            }
            Err(e @ StoreError::Corrupt { .. }) => {
                let aside = sibling(&path, ".corrupt");
                match fs::rename(&path, &aside).await {
                    Ok(()) => warn!(
                        path = %path.display(),
                        moved_to = %aside.display(),
                        error = %e,
                        "Seen state corrupt, set aside and starting empty"
                    ),
                    Err(rename) => warn!(
                        path = %path.display(),
                        error = %e,
                        rename_error = %rename,
                        "Seen state corrupt and could not be set aside, starting empty"
                    ),
                }
                SeenDocument::default()
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Seen state unreadable, starting empty"
                );
                SeenDocument::default()
            }
        };

        Self {
            path,
            doc: Mutex::new(doc),
        }
    }

    /// Snapshot of the in-memory document.
    pub async fn document(&self) -> SeenDocument {
        self.doc.lock().await.clone()
    }
}

/// `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state.json".into());
    name.push(suffix);
    path.with_file_name(name)
}

async fn read_document(path: &Path) -> Result<Option<SeenDocument>, StoreError> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn get(&self, channel_key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .doc
            .lock()
            .await
            .chats
            .get(channel_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn set(&self, channel_key: &str, keys: Vec<String>) -> Result<(), StoreError> {
        self.doc.lock().await.chats.insert(channel_key.to_string(), keys);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let json = {
            let doc = self.doc.lock().await;
            serde_json::to_string_pretty(&*doc)?
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let tmp = sibling(&self.path, ".tmp");
        fs::write(&tmp, json.as_bytes())
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: tmp.display().to_string(),
                reason: e.to_string(),
            })?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;

        let channels = self.doc.lock().await.chats.len();
        info!(path = %self.path.display(), channels, "Seen state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("last_seen.json")).await;
        assert!(store.get("alpha").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn flush_then_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_seen.json");

        let store = JsonFileStore::open(&path).await;
        store.set("alpha", vec!["k1".into(), "k2".into()]).await.unwrap();
        store.flush().await.unwrap();

        let reopened = JsonFileStore::open(&path).await;
        assert_eq!(reopened.get("alpha").await.unwrap(), vec!["k1", "k2"]);
    }

    #[tokio::test]
    async fn document_shape_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_seen.json");
        let store = JsonFileStore::open(&path).await;
        store.set("alpha", vec!["abc".into()]).await.unwrap();
        store.flush().await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, serde_json::json!({"chats": {"alpha": ["abc"]}}));
    }

    #[tokio::test]
    async fn flush_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_seen.json");
        let store = JsonFileStore::open(&path).await;
        store.set("a", vec!["x".into()]).await.unwrap();
        store.flush().await.unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("last_seen.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_seen.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonFileStore::open(&path).await;
        assert!(store.document().await.chats.is_empty());

        let aside = dir.path().join("last_seen.json.corrupt");
        assert_eq!(std::fs::read_to_string(&aside).unwrap(), "{ not json");
        assert!(!path.exists());

        store.set("alpha", vec!["k".into()]).await.unwrap();
        store.flush().await.unwrap();
        assert_eq!(std::fs::read_to_string(&aside).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn legacy_document_without_chats_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_seen.json");
        std::fs::write(&path, r#"{"seen": ["old"]}"#).unwrap();

        let store = JsonFileStore::open(&path).await;
        assert!(store.document().await.chats.is_empty());
    }

    #[tokio::test]
    async fn flush_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state").join("last_seen.json");
        let store = JsonFileStore::open(&path).await;
        store.flush().await.unwrap();
        assert!(path.exists());
    }
}
