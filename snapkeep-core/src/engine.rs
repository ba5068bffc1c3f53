/*!
The engine context shared by backup, retention and reconciliation.

An [`Engine`] owns a provider, a catalog and the settings that bound how hard
it drives them. There is no process-wide state: two engines with different
providers or catalogs can run side by side.
*/

use snapkeep_retry::{with_policy, RetryError, RetryPolicy};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::config::{default_fan_out, EngineConfig};
use crate::coordinator::BackupReport;
use crate::observability::{record_provider_retry, ProviderTimer};
use crate::provider::{Provider, ProviderError};
use crate::retention::{RetentionBatchReport, RetentionPolicy};
use crate::{Result, SnapkeepError};

/// Limits applied to every engine operation
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Maximum number of per-instance workflows in flight
    pub fan_out: usize,
    /// Retry policy for every provider call
    pub retry: RetryPolicy,
    /// Policy applied by [`Engine::run`]
    pub retention: RetentionPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            fan_out: config.fan_out,
            retry: config.retry.to_policy(),
            retention: config.retention,
        }
    }

    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.fan_out < 1 {
            return Err(SnapkeepError::policy_violation("fan_out must be at least 1"));
        }
        if self.retry.max_attempts < 1 {
            return Err(SnapkeepError::policy_violation(
                "retry max_attempts must be at least 1",
            ));
        }
        self.retention.validate()
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fan_out: default_fan_out(),
            retry: RetryPolicy::cloud_provider(),
            retention: RetentionPolicy::default(),
        }
    }
}

/// Cooperative cancellation flag
///
/// Once triggered, per-instance work that has not started yet is skipped.
/// Provider calls already in flight finish or time out.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a combined backup and prune pass
#[derive(Debug)]
pub struct RunReport {
    pub backup: BackupReport,
    pub retention: RetentionBatchReport,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.backup.has_failures() || self.retention.has_failures()
    }
}

/// Outcome of deleting one image at the provider
#[derive(Debug)]
pub(crate) enum ProviderDelete {
    Deleted,
    /// The provider reported the image as already gone
    AlreadyAbsent,
    Failed(SnapkeepError),
}

/// Backup, retention and reconcile engine
///
/// # Example
/// ```rust
/// use snapkeep_core::{Engine, EngineSettings, MemoryCatalog, MemoryProvider};
///
/// # async fn run() -> snapkeep_core::Result<()> {
/// let engine = Engine::new(
///     MemoryProvider::new(),
///     MemoryCatalog::in_memory(),
///     EngineSettings::default(),
/// )?;
/// let report = engine.backup(["i-1", "i-2"]).await;
/// assert_eq!(report.snapshots().count(), 2);
/// # Ok(())
/// # }
/// ```
pub struct Engine<P, C> {
    provider: P,
    catalog: C,
    settings: EngineSettings,
    shutdown: Shutdown,
}

impl<P: Provider, C: Catalog> Engine<P, C> {
    /// Create an engine; rejects invalid settings before any provider call
    pub fn new(provider: P, catalog: C, settings: EngineSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            provider,
            catalog,
            settings,
            shutdown: Shutdown::new(),
        })
    }

    /// Share a shutdown flag with the caller
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Back up the given instances, then enforce the configured retention
    /// policy on each of them
    pub async fn run<I, S>(&self, instance_ids: I) -> Result<RunReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let instance_ids: Vec<String> = instance_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();

        let backup = self.backup(&instance_ids).await;
        let prune_ids: BTreeSet<&str> = instance_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !id.trim().is_empty())
            .collect();
        let retention = self
            .enforce_many(&self.settings.retention, prune_ids)
            .await?;

        info!(
            run_id = %backup.run_id,
            created = backup.snapshots().count(),
            pruned = retention.removed_count(),
            "Backup run finished"
        );
        Ok(RunReport { backup, retention })
    }

    /// Delete one image at the provider through the retry layer
    pub(crate) async fn delete_at_provider(&self, image_id: &str) -> ProviderDelete {
        let result = with_policy("delete_image", &self.settings.retry, |attempt| async move {
            if attempt > 1 {
                record_provider_retry("delete_image");
            }
            let timer = ProviderTimer::start("delete_image");
            let result = self.provider.delete_image(image_id).await;
            timer.finish(result.as_ref().map_or_else(ProviderError::is_not_found, |_| true));
            result
        })
        .await;

        match result {
            Ok(()) => ProviderDelete::Deleted,
            Err(RetryError::Permanent { source, .. }) if source.is_not_found() => {
                info!(image_id, "Image already absent at provider");
                ProviderDelete::AlreadyAbsent
            }
            Err(e) => {
                warn!(image_id, error = %e, "Provider delete failed");
                ProviderDelete::Failed(e.into())
            }
        }
    }

    /// Managed image ids at the provider, through the retry layer
    pub(crate) async fn provider_inventory(&self) -> Result<BTreeSet<String>> {
        with_policy("list_images", &self.settings.retry, |attempt| async move {
            if attempt > 1 {
                record_provider_retry("list_images");
            }
            let timer = ProviderTimer::start("list_images");
            let result = self.provider.list_images().await;
            timer.finish(result.is_ok());
            result
        })
        .await
        .map_err(SnapkeepError::from)
    }
}
