use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::state::{Cursor, StateStore};

/// Cursor kept in a single JSON file, replaced wholesale on every save
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Cursor {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}, starting fresh", self.path.display());
                return Cursor::default();
            }
            Err(e) => {
                warn!(
                    "Failed to read state file {}: {}; starting fresh",
                    self.path.display(),
                    e
                );
                return Cursor::default();
            }
        };

        match Cursor::from_json(&content) {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(
                    "State file {} is corrupt ({:#}); starting fresh",
                    self.path.display(),
                    e
                );
                Cursor::default()
            }
        }
    }

    async fn save(&self, cursor: &Cursor) -> Result<()> {
        let body = cursor.to_json()?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directories: {}", parent.display()))?;
        }

        // Write beside the target and rename over it so a crash never leaves half a file.
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace state file: {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_loads_zero_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().await, Cursor::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("nested").join("state.json"));

        let mut cursor = Cursor::default();
        cursor.advance_to(42);
        cursor.set_retry_count(43, 1);
        store.save(&cursor).await.unwrap();

        assert_eq!(store.load().await, cursor);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_zero_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ this is not json").unwrap();

        let store = JsonStateStore::new(&path);
        assert_eq!(store.load().await, Cursor::default());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("state.json"));

        let mut first = Cursor::default();
        first.advance_to(1);
        first.set_retry_count(2, 2);
        store.save(&first).await.unwrap();

        let mut second = Cursor::default();
        second.advance_to(3);
        store.save(&second).await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.last_processed_id, 3);
        assert!(loaded.retry_counters.is_empty());
    }

    #[tokio::test]
    async fn test_reads_legacy_file_without_retry_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{ "last_message_id": "1234" }"#).unwrap();

        let cursor = JsonStateStore::new(&path).load().await;
        assert_eq!(cursor.last_processed_id, 1234);
    }
}
