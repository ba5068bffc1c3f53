/*!
The engine's durable record of which snapshots it believes exist.

[`Catalog`] is the port the engine uses. [`StoredCatalog`] implements it on
top of any [`DocumentStore`]: every mutation loads the document, applies the
change and saves the whole document back before returning.
*/

pub mod document;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{CatalogBackend, CatalogConfig};
use crate::snapshot::Snapshot;
use crate::storage::{DocumentStore, LocalFileStore, MemoryStore};
use crate::Result;

pub use document::{CatalogDocument, CatalogEntry, CATALOG_FORMAT_VERSION};

/// Durable mapping from instance id to the snapshots recorded for it
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Durably record a snapshot
    ///
    /// Appending a snapshot id that is already recorded for the same
    /// instance succeeds without changing anything.
    async fn append(&self, snapshot: Snapshot) -> Result<()>;

    /// Snapshots of an instance, ordered by creation time (oldest first)
    async fn list(&self, instance_id: &str) -> Result<Vec<Snapshot>>;

    /// Look up a snapshot by id
    async fn get(&self, snapshot_id: &str) -> Result<Option<Snapshot>>;

    /// Remove a snapshot, returning it if it was recorded
    async fn remove(&self, snapshot_id: &str) -> Result<Option<Snapshot>>;

    /// Every instance with its snapshots
    async fn all(&self) -> Result<BTreeMap<String, Vec<Snapshot>>>;
}

/// Catalog persisted as a single document
///
/// Writers are serialized by an internal lock, so concurrent appends and
/// removals for any instances never lose each other's updates. Readers load
/// the last saved document without taking the lock.
pub struct StoredCatalog<S> {
    store: S,
    write_lock: Mutex<()>,
}

/// Catalog held in memory
pub type MemoryCatalog = StoredCatalog<MemoryStore>;

/// Catalog kept in a local JSON file
pub type FileCatalog = StoredCatalog<LocalFileStore>;

impl<S: DocumentStore> StoredCatalog<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// The underlying document store
    pub fn store(&self) -> &S {
        &self.store
    }

    async fn load(&self) -> Result<CatalogDocument> {
        match self.store.load().await? {
            Some(data) => CatalogDocument::from_bytes(&data),
            None => Ok(CatalogDocument::new()),
        }
    }

    async fn save(&self, document: &CatalogDocument) -> Result<()> {
        self.store.save(&document.to_bytes()?).await
    }
}

impl<S> std::fmt::Debug for StoredCatalog<S>
where
    S: DocumentStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCatalog")
            .field("store", &self.store.describe())
            .finish()
    }
}

impl MemoryCatalog {
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }
}

impl FileCatalog {
    /// Open (or lazily create) a catalog file
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Self::new(LocalFileStore::new(path))
    }
}

#[async_trait]
impl<S: DocumentStore> Catalog for StoredCatalog<S> {
    async fn append(&self, snapshot: Snapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await?;

        let snapshot_id = snapshot.id.clone();
        let instance_id = snapshot.instance_id.clone();
        if document.append(snapshot)? {
            self.save(&document).await?;
            debug!(
                instance_id = %instance_id,
                snapshot_id = %snapshot_id,
                "Recorded snapshot"
            );
        } else {
            debug!(
                instance_id = %instance_id,
                snapshot_id = %snapshot_id,
                "Snapshot already recorded"
            );
        }
        Ok(())
    }

    async fn list(&self, instance_id: &str) -> Result<Vec<Snapshot>> {
        Ok(self.load().await?.list(instance_id))
    }

    async fn get(&self, snapshot_id: &str) -> Result<Option<Snapshot>> {
        Ok(self.load().await?.get(snapshot_id).cloned())
    }

    async fn remove(&self, snapshot_id: &str) -> Result<Option<Snapshot>> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await?;

        let removed = document.remove(snapshot_id);
        if let Some(snapshot) = &removed {
            self.save(&document).await?;
            debug!(
                instance_id = %snapshot.instance_id,
                snapshot_id,
                "Removed snapshot from catalog"
            );
        }
        Ok(removed)
    }

    async fn all(&self) -> Result<BTreeMap<String, Vec<Snapshot>>> {
        Ok(self.load().await?.all())
    }
}

/// Open the catalog described by `config`
pub async fn open_catalog(
    config: &CatalogConfig,
) -> Result<StoredCatalog<Box<dyn DocumentStore>>> {
    config.validate()?;

    let store: Box<dyn DocumentStore> = match config.backend {
        CatalogBackend::Local => Box::new(LocalFileStore::new(config.local_path())),
        #[cfg(feature = "s3")]
        CatalogBackend::S3 => Box::new(crate::storage::S3DocumentStore::connect(config).await?),
        #[cfg(not(feature = "s3"))]
        CatalogBackend::S3 => {
            return Err(crate::SnapkeepError::config(
                "S3 catalog support is not compiled in (enable the 's3' feature)",
            ))
        }
    };

    info!(location = %store.describe(), "Opened catalog");
    Ok(StoredCatalog::new(store))
}
