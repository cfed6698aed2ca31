//! Feature toggle stores
//!
//! Toggle storage belongs to the host application; Warden only reads and
//! clears flags through [`FeatureToggleStore`].

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use warden_core::WardenResult;

/// Key/value feature toggles
#[async_trait::async_trait]
pub trait FeatureToggleStore: Send + Sync {
    /// Current value; `None` when the toggle is unknown
    async fn get(&self, name: &str) -> WardenResult<Option<bool>>;

    /// Set a toggle
    async fn set(&self, name: &str, enabled: bool) -> WardenResult<()>;
}

/// Toggles held in memory
#[derive(Debug, Default)]
pub struct InMemoryToggleStore {
    toggles: RwLock<HashMap<String, bool>>,
}

impl InMemoryToggleStore {
    /// Empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With one toggle preset
    #[must_use]
    pub fn with(self, name: impl Into<String>, enabled: bool) -> Self {
        self.toggles.write().insert(name.into(), enabled);
        self
    }
}

#[async_trait::async_trait]
impl FeatureToggleStore for InMemoryToggleStore {
    async fn get(&self, name: &str) -> WardenResult<Option<bool>> {
        Ok(self.toggles.read().get(name).copied())
    }

    async fn set(&self, name: &str, enabled: bool) -> WardenResult<()> {
        self.toggles.write().insert(name.to_string(), enabled);
        Ok(())
    }
}

/// Toggles in a JSON object file (`{"name": true}`); a missing file is empty
#[derive(Debug)]
pub struct JsonFileToggleStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileToggleStore {
    /// Store backed by `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> WardenResult<BTreeMap<String, bool>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl FeatureToggleStore for JsonFileToggleStore {
    async fn get(&self, name: &str) -> WardenResult<Option<bool>> {
        Ok(self.read_all().await?.get(name).copied())
    }

    async fn set(&self, name: &str, enabled: bool) -> WardenResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut toggles = self.read_all().await?;
        toggles.insert(name.to_string(), enabled);
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&toggles)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_round_trip() {
        let store = InMemoryToggleStore::new().with("a", true);
        assert_eq!(store.get("a").await.unwrap(), Some(true));
        store.set("a", false).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(false));
        assert_eq!(store.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn json_file_keeps_other_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toggles.json");
        std::fs::write(&path, r#"{"a": true, "b": true}"#).unwrap();

        let store = JsonFileToggleStore::new(&path);
        store.set("a", false).await.unwrap();

        let on_disk: BTreeMap<String, bool> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.get("a"), Some(&false));
        assert_eq!(on_disk.get("b"), Some(&true));
    }

    #[tokio::test]
    async fn json_file_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileToggleStore::new(dir.path().join("none.json"));
        assert_eq!(store.get("x").await.unwrap(), None);
    }
}
