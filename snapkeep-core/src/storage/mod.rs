/*!
Document stores backing the catalog.

The catalog is a single JSON document. A [`DocumentStore`] only knows how to
load and save that document as bytes; interpretation lives in
[`crate::catalog`]. Stores are adapters behind a port, so new backends can be
added without touching the engine.
*/

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};

use crate::{Result, SnapkeepError};

pub use local::LocalFileStore;
#[cfg(feature = "s3")]
pub use s3::S3DocumentStore;

/// Durable home of the catalog document
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load the current document, or `None` if none has been saved yet
    async fn load(&self) -> Result<Option<Vec<u8>>>;

    /// Replace the document
    ///
    /// Implementations must not leave a partially written document behind.
    async fn save(&self, data: &[u8]) -> Result<()>;

    /// Human readable location, used in logs
    fn describe(&self) -> String;
}

#[async_trait]
impl DocumentStore for Box<dyn DocumentStore> {
    async fn load(&self) -> Result<Option<Vec<u8>>> {
        (**self).load().await
    }

    async fn save(&self, data: &[u8]) -> Result<()> {
        (**self).save(data).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[derive(Debug, Default)]
struct MemoryStoreState {
    document: Option<Vec<u8>>,
    read_only: bool,
    saves: usize,
}

/// Document store that keeps the catalog in memory
///
/// Useful for tests and dry runs. It can be switched to read-only to
/// rehearse a catalog that cannot be written.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryStoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every following `save` fail (or succeed again)
    pub fn set_read_only(&self, read_only: bool) {
        self.state().read_only = read_only;
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        self.state().saves
    }

    /// Raw copy of the stored document
    pub fn document(&self) -> Option<Vec<u8>> {
        self.state().document.clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.state().document.clone())
    }

    async fn save(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        if state.read_only {
            return Err(SnapkeepError::storage("in-memory catalog store is read-only"));
        }
        state.document = Some(data.to_vec());
        state.saves += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
