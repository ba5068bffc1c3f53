/*!
Local filesystem document store.
*/

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::DocumentStore;
use crate::{Result, SnapkeepError};

/// Catalog document stored as a file
///
/// Saves write a sibling temporary file, flush it to disk and rename it over
/// the target, so readers see either the old or the new document. Missing
/// parent directories are created on first save.
///
/// # Example
/// ```rust,no_run
/// use snapkeep_core::storage::{DocumentStore, LocalFileStore};
///
/// # async fn run() -> snapkeep_core::Result<()> {
/// let store = LocalFileStore::new("/var/lib/snapkeep/catalog.json");
/// store.save(br#"{"format_version":1}"#).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    path: PathBuf,
}

impl LocalFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Ensure the parent directory exists, creating it if necessary
    async fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    SnapkeepError::storage(format!(
                        "Failed to create directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for LocalFileStore {
    async fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path).await {
            Ok(data) => {
                debug!(path = %self.path.display(), size = data.len(), "Loaded catalog document");
                Ok(Some(data))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SnapkeepError::storage(format!(
                "Failed to read catalog from {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn save(&self, data: &[u8]) -> Result<()> {
        self.ensure_parent_dir().await?;

        let temp_path = self.temp_path();
        let write_err = |e: std::io::Error| {
            SnapkeepError::storage(format!(
                "Failed to write catalog to {}: {e}",
                temp_path.display()
            ))
        };

        let mut file = fs::File::create(&temp_path).await.map_err(write_err)?;
        file.write_all(data).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            SnapkeepError::storage(format!(
                "Failed to replace catalog {}: {e}",
                self.path.display()
            ))
        })?;

        debug!(path = %self.path.display(), size = data.len(), "Saved catalog document");
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_loads_as_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path().join("catalog.json"));

        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_creates_nested_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state/prod/catalog.json");
        let store = LocalFileStore::new(&path);

        store.save(b"{\"format_version\":1}").await.unwrap();

        assert!(path.exists());
        assert_eq!(
            store.load().await.unwrap(),
            Some(b"{\"format_version\":1}".to_vec())
        );
    }

    #[tokio::test]
    async fn test_save_replaces_without_leaving_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("catalog.json");
        let store = LocalFileStore::new(&path);

        store.save(b"old").await.unwrap();
        store.save(b"new").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        assert!(!temp_dir.path().join("catalog.json.tmp").exists());
    }
}
