/*!
# Snapkeep Core Engine

Point-in-time backups of compute instances, with retention and
reconciliation.

Given a set of instance ids, the engine creates one machine image per
instance, records it in a durable catalog, keeps at most N images per
instance and repairs drift between the catalog and what the provider
actually holds.

## Architecture

The core follows hexagonal architecture principles:
- [`Engine`] holds the domain logic and depends only on two ports
- [`Provider`] creates, deletes and lists images ([`MemoryProvider`], and
  `Ec2Provider` behind the `ec2` feature)
- [`Catalog`] records snapshots; [`StoredCatalog`] persists it through a
  [`storage::DocumentStore`] (local file, memory, or S3 behind the `s3` feature)

## Usage

```rust
use snapkeep_core::{Engine, EngineSettings, MemoryCatalog, MemoryProvider, RetentionPolicy};

# async fn run() -> snapkeep_core::Result<()> {
let engine = Engine::new(
    MemoryProvider::new(),
    MemoryCatalog::in_memory(),
    EngineSettings::default(),
)?;

let report = engine.run(["i-1", "i-2"]).await?;
assert!(!report.has_failures());

let reconciled = engine.reconcile().await?;
assert!(reconciled.is_clean());
# Ok(())
# }
```
*/

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod observability;
pub mod provider;
pub mod reconcile;
pub mod retention;
pub mod snapshot;
pub mod storage;

#[cfg(test)]
mod error_tests;

pub use catalog::{open_catalog, Catalog, FileCatalog, MemoryCatalog, StoredCatalog};
pub use config::{CatalogBackend, CatalogConfig, Credentials, EngineConfig, RetrySettings};
pub use coordinator::{BackupOutcome, BackupReport};
pub use engine::{Engine, EngineSettings, RunReport, Shutdown};
pub use error::{Result, SnapkeepError};
pub use observability::{init_observability, LogFormat};
#[cfg(feature = "metrics")]
pub use observability::EngineMetrics;
pub use provider::{MemoryProvider, Provider, ProviderError, ProviderErrorKind};
pub use reconcile::{ReconcilePlan, ReconcileReport};
pub use retention::{
    select_expired, PruneOutcome, RetentionBatchReport, RetentionPolicy, RetentionReport,
};
pub use snapshot::{snapshot_name, Snapshot};
