/*!
Snapkeep CLI - back up EC2 instances as machine images, prune old images and
keep the catalog in step with the account.
*/

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use snapkeep_core::catalog::StoredCatalog;
use snapkeep_core::provider::Ec2Provider;
use snapkeep_core::storage::DocumentStore;
use snapkeep_core::{
    init_observability, open_catalog, BackupOutcome, Catalog, CatalogConfig, Credentials, Engine,
    EngineConfig, EngineSettings, LogFormat, PruneOutcome, RetentionPolicy, Shutdown, Snapshot,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::{info, warn};

type CliEngine = Engine<Ec2Provider, StoredCatalog<Box<dyn DocumentStore>>>;

#[derive(Parser)]
#[command(name = "snapkeep")]
#[command(about = "Instance snapshot backup, retention and reconciliation")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Catalog location: a file path or s3://bucket/key
    #[arg(long, global = true)]
    catalog: Option<String>,

    /// AWS region for the EC2 provider
    #[arg(long, global = true, env = "AWS_REGION")]
    region: Option<String>,

    /// Maximum number of instances processed concurrently
    #[arg(long, global = true)]
    fan_out: Option<usize>,

    /// Snapshots to keep per instance
    #[arg(long, global = true)]
    max_snapshots: Option<usize>,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true, hide = true)]
    access_key_id: Option<String>,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true, hide = true)]
    secret_access_key: Option<String>,

    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true, hide = true)]
    session_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create one snapshot per instance, then apply retention
    Backup {
        /// Instance ids to back up
        #[arg(required = true)]
        instance_ids: Vec<String>,
        /// Skip the retention pass after the backup
        #[arg(long)]
        no_prune: bool,
    },
    /// Delete snapshots beyond the retention limit
    Prune {
        /// Instances to prune (all cataloged instances when omitted)
        instance_ids: Vec<String>,
        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete orphan images and drop catalog entries without images
    Reconcile {
        /// Show the differences without fixing them
        #[arg(long)]
        dry_run: bool,
    },
    /// List cataloged snapshots
    List {
        /// Only show this instance
        instance: Option<String>,
    },
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Instance")]
    instance: String,
    #[tabled(rename = "Snapshot")]
    snapshot: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Created")]
    created: String,
}

impl From<&Snapshot> for SnapshotRow {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            instance: snapshot.instance_id.clone(),
            snapshot: snapshot.id.clone(),
            name: snapshot.name.clone(),
            created: snapshot.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        }
    }
}

#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Instance")]
    instance: String,
    #[tabled(rename = "Snapshot")]
    snapshot: String,
    #[tabled(rename = "Result")]
    result: &'static str,
    #[tabled(rename = "Detail")]
    detail: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Human
    };
    init_observability(format, cli.verbose)?;

    let config = load_config(&cli)?;
    let ok = match &cli.command {
        Commands::List { instance } => list_snapshots(&config, instance.as_deref()).await?,
        Commands::Backup {
            instance_ids,
            no_prune,
        } => {
            let engine = build_engine(&cli, &config).await?;
            backup(&engine, instance_ids, *no_prune).await?
        }
        Commands::Prune {
            instance_ids,
            dry_run,
        } => {
            let engine = build_engine(&cli, &config).await?;
            prune(&engine, instance_ids, *dry_run).await?
        }
        Commands::Reconcile { dry_run } => {
            let engine = build_engine(&cli, &config).await?;
            reconcile(&engine, *dry_run).await?
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Configuration file (if any) with command-line overrides applied
fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(uri) = &cli.catalog {
        config.catalog = CatalogConfig::from_uri(uri)?;
    }
    if let Some(region) = &cli.region {
        config.region = Some(region.clone());
    }
    if config.catalog.s3_region.is_none() {
        config.catalog.s3_region = config.region.clone();
    }
    if let Some(fan_out) = cli.fan_out {
        config.fan_out = fan_out;
    }
    if let Some(max) = cli.max_snapshots {
        config.retention = RetentionPolicy::new(max)?;
    }

    config.validate()?;
    Ok(config)
}

async fn build_engine(cli: &Cli, config: &EngineConfig) -> anyhow::Result<CliEngine> {
    let (Some(access_key_id), Some(secret_access_key)) =
        (&cli.access_key_id, &cli.secret_access_key)
    else {
        bail!("AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set");
    };

    let mut credentials = Credentials::new(access_key_id.as_str(), secret_access_key.as_str());
    if let Some(token) = &cli.session_token {
        credentials = credentials.with_session_token(token.as_str());
    }
    if let Some(region) = &config.region {
        credentials = credentials.with_region(region.as_str());
    }

    let settings = EngineSettings::from_config(config);
    let operation_timeout = settings
        .retry
        .attempt_timeout
        .unwrap_or(Duration::from_secs(60));
    let provider = Ec2Provider::connect(&credentials, operation_timeout).await?;
    let catalog = open_catalog(&config.catalog).await?;
    info!(region = provider.region(), catalog = ?catalog, "Engine ready");

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight work");
            signal.trigger();
        }
    });

    Ok(Engine::new(provider, catalog, settings)?.with_shutdown(shutdown))
}

async fn list_snapshots(config: &EngineConfig, instance: Option<&str>) -> anyhow::Result<bool> {
    let catalog = open_catalog(&config.catalog).await?;

    let snapshots: Vec<Snapshot> = match instance {
        Some(instance_id) => catalog.list(instance_id).await?,
        None => catalog.all().await?.into_values().flatten().collect(),
    };

    if snapshots.is_empty() {
        println!("No snapshots recorded");
    } else {
        let rows: Vec<SnapshotRow> = snapshots.iter().map(SnapshotRow::from).collect();
        println!("{}", Table::new(rows));
        println!("\n{} snapshot(s)", snapshots.len());
    }
    Ok(true)
}

async fn backup(
    engine: &CliEngine,
    instance_ids: &[String],
    no_prune: bool,
) -> anyhow::Result<bool> {
    let (backup, retention) = if no_prune {
        (engine.backup(instance_ids).await, None)
    } else {
        let report = engine.run(instance_ids).await?;
        (report.backup, Some(report.retention))
    };

    let rows: Vec<ResultRow> = backup
        .outcomes
        .iter()
        .map(|outcome| match outcome {
            BackupOutcome::Created(snapshot) => ResultRow {
                instance: snapshot.instance_id.clone(),
                snapshot: snapshot.id.clone(),
                result: "created",
                detail: snapshot.name.clone(),
            },
            BackupOutcome::Failed { instance_id, error } => ResultRow {
                instance: instance_id.clone(),
                snapshot: String::new(),
                result: if error.needs_reconcile() {
                    "unrecorded"
                } else {
                    "failed"
                },
                detail: error.to_string(),
            },
            BackupOutcome::Skipped { instance_id } => ResultRow {
                instance: instance_id.clone(),
                snapshot: String::new(),
                result: "skipped",
                detail: "interrupted".to_string(),
            },
        })
        .collect();
    println!("{}", Table::new(rows));

    let mut ok = !backup.has_failures();
    if let Some(retention) = retention {
        ok &= print_retention(&retention);
    }
    info!(run_id = %backup.run_id, ok, "Backup command finished");
    Ok(ok)
}

async fn prune(
    engine: &CliEngine,
    instance_ids: &[String],
    dry_run: bool,
) -> anyhow::Result<bool> {
    let policy = engine.settings().retention;

    if dry_run {
        let instance_ids: Vec<String> = if instance_ids.is_empty() {
            engine.catalog().all().await?.into_keys().collect()
        } else {
            instance_ids.to_vec()
        };

        let mut expired = Vec::new();
        for instance_id in &instance_ids {
            expired.extend(engine.plan_retention(&policy, instance_id).await?);
        }
        if expired.is_empty() {
            println!("Nothing to prune");
        } else {
            let rows: Vec<SnapshotRow> = expired.iter().map(SnapshotRow::from).collect();
            println!("{}", Table::new(rows));
            println!("\n{} snapshot(s) would be deleted", expired.len());
        }
        return Ok(true);
    }

    let batch = if instance_ids.is_empty() {
        engine.enforce_all(&policy).await?
    } else {
        engine.enforce_many(&policy, instance_ids).await?
    };
    Ok(print_retention(&batch))
}

/// Print retention results; returns false if anything failed
fn print_retention(batch: &snapkeep_core::RetentionBatchReport) -> bool {
    let mut rows: Vec<ResultRow> = batch
        .reports
        .iter()
        .flat_map(|report| report.outcomes.iter())
        .map(|outcome| {
            let (result, detail) = match outcome {
                PruneOutcome::Removed(_) => ("deleted", String::new()),
                PruneOutcome::AlreadyAbsent(_) => {
                    ("deleted", "already absent at provider".to_string())
                }
                PruneOutcome::Failed { error, .. } => ("failed", error.to_string()),
                PruneOutcome::Unrecorded { error, .. } => ("unrecorded", error.to_string()),
            };
            ResultRow {
                instance: outcome.snapshot().instance_id.clone(),
                snapshot: outcome.snapshot().id.clone(),
                result,
                detail,
            }
        })
        .collect();
    rows.extend(batch.errors.iter().map(|(instance_id, error)| ResultRow {
        instance: instance_id.clone(),
        snapshot: String::new(),
        result: "failed",
        detail: error.to_string(),
    }));
    rows.extend(batch.skipped.iter().map(|instance_id| ResultRow {
        instance: instance_id.clone(),
        snapshot: String::new(),
        result: "skipped",
        detail: "interrupted".to_string(),
    }));

    if rows.is_empty() {
        println!("Nothing to prune");
    } else {
        println!("{}", Table::new(rows));
    }
    !batch.has_failures()
}

async fn reconcile(engine: &CliEngine, dry_run: bool) -> anyhow::Result<bool> {
    if dry_run {
        let plan = engine.plan_reconcile().await?;
        if plan.is_empty() {
            println!("Catalog and provider agree");
            return Ok(true);
        }

        let mut rows: Vec<ResultRow> = plan
            .orphans
            .iter()
            .map(|image_id| ResultRow {
                instance: String::new(),
                snapshot: image_id.clone(),
                result: "orphan",
                detail: "would delete image".to_string(),
            })
            .collect();
        rows.extend(plan.dangling.iter().map(|snapshot| ResultRow {
            instance: snapshot.instance_id.clone(),
            snapshot: snapshot.id.clone(),
            result: "dangling",
            detail: "would drop catalog entry".to_string(),
        }));
        println!("{}", Table::new(rows));
        return Ok(true);
    }

    let report = engine.reconcile().await?;
    if report.is_clean() {
        println!("Catalog and provider agree");
        return Ok(true);
    }

    let row = |snapshot: &String, result: &'static str, detail: &str| ResultRow {
        instance: String::new(),
        snapshot: snapshot.clone(),
        result,
        detail: detail.to_string(),
    };
    let mut rows = Vec::new();
    rows.extend(
        report
            .orphans_removed
            .iter()
            .map(|id| row(id, "deleted", "orphan image")),
    );
    rows.extend(
        report
            .already_absent
            .iter()
            .map(|id| row(id, "deleted", "already absent")),
    );
    rows.extend(
        report
            .rechecked_kept
            .iter()
            .map(|id| row(id, "kept", "recorded since scan")),
    );
    rows.extend(
        report
            .dangling_found
            .iter()
            .map(|id| row(id, "dropped", "no image at provider")),
    );
    rows.extend(
        report
            .failures
            .iter()
            .map(|(id, error)| row(id, "failed", &error.to_string())),
    );
    println!("{}", Table::new(rows));

    Ok(!report.has_failures())
}
