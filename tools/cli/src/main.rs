//! Offsync CLI - drive the sync engine against simulated links.
//!
//! Runs workloads through the full engine and scheduler using seeded network
//! and endpoint doubles, and inspects configurations and saved record stores.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use offsync_common::{Priority, RecordKind, RecordStatus};
use offsync_sync::simulation::typical_condition;
use offsync_sync::{
    CapabilityTable, ConnectionType, EngineConfig, QueueStatus, RecordDraft, RecordFilter,
    RecordStore, SimulatedEndpoint, SimulatedNetwork, SyncEngine, SyncMetrics, SyncScheduler,
    SystemClock, TimeRange,
};

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "Offsync - offline-first sync engine driver")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Link {
    Ethernet,
    Wifi,
    Cellular,
    Satellite,
}

impl From<Link> for ConnectionType {
    fn from(link: Link) -> Self {
        match link {
            Link::Ethernet => ConnectionType::Ethernet,
            Link::Wifi => ConnectionType::Wifi,
            Link::Cellular => ConnectionType::Cellular,
            Link::Satellite => ConnectionType::Satellite,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated workload through the engine and print metrics.
    Simulate {
        /// Engine configuration file (JSON). Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of records to submit.
        #[arg(short, long, default_value_t = 100)]
        records: usize,

        /// Seed for the network and endpoint doubles.
        #[arg(short, long, default_value_t = 7)]
        seed: u64,

        /// How long to let the scheduler run.
        #[arg(short, long, default_value_t = 10)]
        duration_secs: u64,

        /// Simulated link type.
        #[arg(short, long, value_enum, default_value = "wifi")]
        link: Link,

        /// Probability that a network sample reports offline.
        #[arg(long, default_value_t = 0.05)]
        dropout: f64,

        /// Probability that a transfer fails.
        #[arg(long, default_value_t = 0.1)]
        failure_rate: f64,

        /// Multiplier applied to modelled transfer times.
        #[arg(long, default_value_t = 0.01)]
        time_scale: f64,

        /// Write the record store here when done.
        #[arg(long)]
        save: Option<PathBuf>,

        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Write the default engine configuration.
    InitConfig {
        /// Destination file; stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the policy list of a configuration.
    Policies {
        /// Engine configuration file (JSON). Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show the feature capability table.
    Capabilities,

    /// Summarize a saved record store.
    Inspect {
        /// Record store written by `simulate --save`.
        #[arg(short, long)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let builder = FmtSubscriber::builder().with_target(false).compact();
    if std::env::var_os("RUST_LOG").is_some() {
        tracing::subscriber::set_global_default(
            builder.with_env_filter(EnvFilter::from_default_env()).finish(),
        )?;
    } else {
        tracing::subscriber::set_global_default(builder.with_max_level(level).finish())?;
    }

    match cli.command {
        Commands::Simulate {
            config,
            records,
            seed,
            duration_secs,
            link,
            dropout,
            failure_rate,
            time_scale,
            save,
            json,
        } => {
            let options = SimulationOptions {
                records,
                seed,
                duration: Duration::from_secs(duration_secs),
                link: link.into(),
                dropout,
                failure_rate,
                time_scale,
            };
            cmd_simulate(config, options, save, json).await
        }

        Commands::InitConfig { output } => cmd_init_config(output).await,

        Commands::Policies { config } => cmd_policies(config).await,

        Commands::Capabilities => cmd_capabilities(),

        Commands::Inspect { path } => cmd_inspect(&path).await,
    }
}

async fn load_config(path: Option<PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(&path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

struct SimulationOptions {
    records: usize,
    seed: u64,
    duration: Duration,
    link: ConnectionType,
    dropout: f64,
    failure_rate: f64,
    time_scale: f64,
}

#[derive(Serialize)]
struct SimulationSummary {
    submitted: usize,
    rejected: usize,
    statuses: BTreeMap<String, usize>,
    queues: Vec<QueueStatus>,
    metrics: SyncMetrics,
}

/// Submit a mixed workload and let the scheduler work through it.
async fn cmd_simulate(
    config: Option<PathBuf>,
    options: SimulationOptions,
    save: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let config = load_config(config).await?;
    let network = Arc::new(SimulatedNetwork::new(
        options.seed,
        typical_condition(options.link),
        options.dropout,
    ));
    let endpoint = Arc::new(
        SimulatedEndpoint::new(options.seed.wrapping_add(1))
            .with_failure_rate(options.failure_rate)
            .with_cost(Arc::new(offsync_sync::default_transfer_cost), options.time_scale),
    );
    let engine = Arc::new(
        SyncEngine::new(config, network, endpoint, Arc::new(SystemClock))
            .context("Invalid engine configuration")?,
    );

    info!(
        "Simulating {} records over {:?} for {:?}",
        options.records, options.link, options.duration
    );
    engine.sample_network().await;
    let scheduler = SyncScheduler::spawn(engine.clone());

    let mut submitted = 0;
    let mut rejected = 0;
    for i in 0..options.records {
        match engine.submit(workload_draft(i)).await {
            Ok(_) => submitted += 1,
            Err(e) => {
                rejected += 1;
                info!("Submission {} rejected: {}", i, e);
            }
        }
    }

    tokio::time::sleep(options.duration).await;
    scheduler.shutdown().await;

    let mut statuses = BTreeMap::new();
    for summary in engine.list(&RecordFilter::default()).await {
        *statuses.entry(summary.status.to_string()).or_insert(0) += 1;
    }
    let summary = SimulationSummary {
        submitted,
        rejected,
        statuses,
        queues: engine.queue_status().await,
        metrics: engine.metrics(TimeRange::all()).await,
    };

    if let Some(path) = save {
        engine
            .save(&path)
            .await
            .with_context(|| format!("Failed to save records to {}", path.display()))?;
        println!("Records saved to {}", path.display());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

/// Deterministic mix of kinds, tiers and logical keys.
fn workload_draft(i: usize) -> RecordDraft {
    let kind = RecordKind::ALL[i % RecordKind::ALL.len()];
    let priority = match kind {
        RecordKind::Alert => Priority::Critical,
        RecordKind::Transaction => Priority::High,
        RecordKind::UserAction | RecordKind::ConfigurationChange => Priority::Medium,
        RecordKind::SensorReading | RecordKind::InferenceResult => Priority::Low,
    };
    let payload = serde_json::json!({
        "sequence": i,
        "kind": kind,
        "reading": (i as f64 * 0.37).sin(),
        "notes": "sample ".repeat(i % 50),
    });

    let draft = match kind {
        RecordKind::Alert => {
            RecordDraft::new(kind, payload, priority, "cli-device", chrono::Duration::minutes(10))
        }
        _ => RecordDraft::untimed(kind, payload, priority, "cli-device"),
    };
    if kind == RecordKind::ConfigurationChange {
        draft.with_logical_key(format!("settings-{}", i % 3))
    } else {
        draft
    }
}

fn print_summary(summary: &SimulationSummary) {
    println!("Simulation summary:");
    println!("  Submitted: {}", summary.submitted);
    println!("  Rejected: {}", summary.rejected);
    println!("  Records by status:");
    for (status, count) in &summary.statuses {
        println!("    {}: {}", status, count);
    }
    println!("  Queues:");
    for queue in &summary.queues {
        println!(
            "    {:<8} {:?} depth={} paused={}",
            queue.tier.as_str(),
            queue.strategy,
            queue.depth,
            queue.paused
        );
    }
    let m = &summary.metrics;
    println!("  Metrics:");
    println!("    Synced: {}", m.total_synced);
    println!("    Attempts: {} ok / {} failed", m.success_count, m.failure_count);
    println!("    Avg sync time: {:.1} ms", m.avg_sync_time_ms);
    println!("    Bandwidth used: {:.3} MB", m.bandwidth_used_mb);
    println!("    Conflicts resolved: {}", m.conflicts_resolved);
    println!("    Integrity issues: {}", m.integrity_issues);
    println!("    Efficiency: {:.1}%", m.efficiency_pct);
}

async fn cmd_init_config(output: Option<PathBuf>) -> Result<()> {
    let json = EngineConfig::default()
        .to_json()
        .context("Failed to serialize default config")?;
    match output {
        Some(path) => {
            tokio::fs::write(&path, json)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

async fn cmd_policies(config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config).await?;
    if config.policies.is_empty() {
        println!("No policies configured; every sync cycle will be skipped.");
        return Ok(());
    }

    println!("Policies (first match wins):");
    for policy in &config.policies {
        let networks = if policy.conditions.network_types.is_empty() {
            "any".to_string()
        } else {
            policy
                .conditions
                .network_types
                .iter()
                .map(|t| format!("{:?}", t).to_lowercase())
                .collect::<Vec<_>>()
                .join(",")
        };
        println!(
            "  {} [{}] networks={} floor={} limit={} concurrent={} retry={:?}",
            policy.name,
            if policy.enabled { "enabled" } else { "disabled" },
            networks,
            policy
                .actions
                .priority_override
                .map_or("none", |p| p.as_str()),
            policy
                .actions
                .bandwidth_limit_mbps
                .map_or("none".to_string(), |l| format!("{} Mbps", l)),
            policy.actions.max_concurrent,
            policy.actions.retry_strategy,
        );
    }
    Ok(())
}

fn cmd_capabilities() -> Result<()> {
    let table = CapabilityTable::default_table();
    println!("{:<20} {:<8} {:<8} {}", "FEATURE", "OFFLINE", "COST", "LEVEL");
    for entry in table.entries() {
        println!(
            "{:<20} {:<8} {:<8} {:?}",
            entry.feature,
            if entry.works_offline { "yes" } else { "no" },
            format!("{:?}", entry.data_cost).to_lowercase(),
            entry.functionality,
        );
    }
    Ok(())
}

async fn cmd_inspect(path: &PathBuf) -> Result<()> {
    let config = EngineConfig::default();
    let store = RecordStore::load(path, config.max_records, config.attempt_history_limit)
        .await
        .with_context(|| format!("Failed to load records from {}", path.display()))?;

    println!("Record store: {}", path.display());
    println!("  Records: {}", store.len());
    let counts = store.count_by_status();
    for status in [
        RecordStatus::Pending,
        RecordStatus::Syncing,
        RecordStatus::Synced,
        RecordStatus::Failed,
        RecordStatus::Expired,
    ] {
        println!("    {}: {}", status, counts.get(&status).copied().unwrap_or(0));
    }

    let failed = store.list(&RecordFilter::default().with_status(RecordStatus::Failed));
    if !failed.is_empty() {
        println!("  Failed records:");
        for record in failed {
            let summary = record.summary();
            println!(
                "    {} {:?} retries={}/{} last_error={}",
                summary.id,
                summary.kind,
                summary.retry_count,
                summary.max_retries,
                summary.last_error.as_deref().unwrap_or("-"),
            );
        }
    }

    let metrics = SyncMetrics::compute(store.records(), &[], TimeRange::all());
    println!(
        "  Attempts: {} ok / {} failed, efficiency {:.1}%",
        metrics.success_count, metrics.failure_count, metrics.efficiency_pct
    );
    Ok(())
}
