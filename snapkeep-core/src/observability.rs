/*!
Logging and metrics for the Snapkeep engine.

- Structured logging through `tracing`, installed by [`init_observability`]
- Prometheus counters and a provider latency histogram (feature `metrics`)

The `record_*` helpers are always available and compile to nothing when the
`metrics` feature is disabled, so engine code never needs its own cfg gates.
*/

#[cfg(feature = "metrics")]
use prometheus::{
    core::Collector, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::Instant;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{Result, SnapkeepError};

/// Output format of log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact human readable lines
    #[default]
    Human,
    /// One JSON object per event
    Json,
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins when set. Otherwise Snapkeep crates log at `info`, or at
/// `debug` when `verbose` is set, and everything else at `warn`.
pub fn init_observability(format: LogFormat, verbose: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    EngineMetrics::global();

    let default_directives = if verbose {
        "warn,snapkeep=debug"
    } else {
        "warn,snapkeep=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Human => registry
            .with(tracing_subscriber::fmt::layer().with_target(verbose))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false),
            )
            .try_init(),
    };
    installed.map_err(|e| {
        SnapkeepError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!(?format, "Snapkeep observability initialized");
    Ok(())
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<EngineMetrics>> = OnceLock::new();

/// Prometheus metrics for engine runs
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct EngineMetrics {
    pub snapshots_created_total: IntCounter,
    pub snapshots_pruned_total: IntCounter,
    pub orphans_removed_total: IntCounter,
    pub dangling_found_total: IntCounter,
    /// Provider calls by operation
    pub provider_requests_total: IntCounterVec,
    pub provider_errors_total: IntCounterVec,
    pub provider_retries_total: IntCounterVec,
    pub provider_latency_seconds: HistogramVec,
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> Result<C> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| SnapkeepError::config(format!("Failed to register metric: {e}")))?;
    Ok(collector)
}

#[cfg(feature = "metrics")]
fn metric_err(e: prometheus::Error) -> SnapkeepError {
    SnapkeepError::config(format!("Failed to create metric: {e}"))
}

#[cfg(feature = "metrics")]
impl EngineMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            register(&registry, IntCounter::new(name, help).map_err(metric_err)?)
        };
        let by_operation = |name: &str, help: &str| -> Result<IntCounterVec> {
            register(
                &registry,
                IntCounterVec::new(Opts::new(name, help), &["operation"]).map_err(metric_err)?,
            )
        };

        let snapshots_created_total =
            counter("snapkeep_snapshots_created_total", "Snapshots created and recorded")?;
        let snapshots_pruned_total =
            counter("snapkeep_snapshots_pruned_total", "Snapshots removed by retention")?;
        let orphans_removed_total =
            counter("snapkeep_orphans_removed_total", "Provider images deleted by reconcile")?;
        let dangling_found_total =
            counter("snapkeep_dangling_found_total", "Catalog entries without a provider image")?;
        let provider_requests_total =
            by_operation("snapkeep_provider_requests_total", "Provider calls attempted")?;
        let provider_errors_total =
            by_operation("snapkeep_provider_errors_total", "Provider calls that failed")?;
        let provider_retries_total =
            by_operation("snapkeep_provider_retries_total", "Provider call retries")?;
        let provider_latency_seconds = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "snapkeep_provider_latency_seconds",
                    "Duration of provider calls in seconds",
                ),
                &["operation"],
            )
            .map_err(metric_err)?,
        )?;

        Ok(Self {
            snapshots_created_total,
            snapshots_pruned_total,
            orphans_removed_total,
            dangling_found_total,
            provider_requests_total,
            provider_errors_total,
            provider_retries_total,
            provider_latency_seconds,
            registry,
        })
    }

    /// Process-wide metrics, or `None` if they could not be registered
    pub fn global() -> Option<&'static EngineMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| SnapkeepError::config(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| SnapkeepError::config(format!("Failed to convert metrics to string: {e}")))
    }
}

#[cfg(feature = "metrics")]
fn with_metrics(f: impl FnOnce(&EngineMetrics)) {
    if let Some(metrics) = EngineMetrics::global() {
        f(metrics);
    }
}

/// Count snapshots created and recorded
#[allow(unused_variables)]
pub fn record_snapshots_created(count: usize) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.snapshots_created_total.inc_by(count as u64));
}

/// Count snapshots removed by retention
#[allow(unused_variables)]
pub fn record_snapshots_pruned(count: usize) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.snapshots_pruned_total.inc_by(count as u64));
}

#[allow(unused_variables)]
pub fn record_orphans_removed(count: usize) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.orphans_removed_total.inc_by(count as u64));
}

#[allow(unused_variables)]
pub fn record_dangling_found(count: usize) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.dangling_found_total.inc_by(count as u64));
}

/// Count a retry of a provider operation
#[allow(unused_variables)]
pub fn record_provider_retry(operation: &str) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.provider_retries_total.with_label_values(&[operation]).inc());
}

/// Times one provider call and records its outcome
#[derive(Debug)]
pub struct ProviderTimer {
    operation: &'static str,
    start: Instant,
}

impl ProviderTimer {
    pub fn start(operation: &'static str) -> Self {
        #[cfg(feature = "metrics")]
        with_metrics(|m| m.provider_requests_total.with_label_values(&[operation]).inc());

        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Record latency, and an error if `ok` is false
    pub fn finish(self, ok: bool) {
        let elapsed = self.start.elapsed();
        tracing::trace!(
            operation = self.operation,
            ok,
            elapsed_ms = elapsed.as_millis() as u64,
            "Provider call finished"
        );

        #[cfg(feature = "metrics")]
        with_metrics(|m| {
            m.provider_latency_seconds
                .with_label_values(&[self.operation])
                .observe(elapsed.as_secs_f64());
            if !ok {
                m.provider_errors_total
                    .with_label_values(&[self.operation])
                    .inc();
            }
        });
    }
}
