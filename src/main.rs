//! # Leadflow: lead orchestration worker
//!
//! Usage:
//!   leadflow init                                     # Write a default config file
//!   leadflow worker                                   # Run step workers until Ctrl-C
//!   leadflow publish --user U --flow F --node N L1 L2 # Schedule the step after node N
//!   leadflow load fixtures.json                       # Upsert flows, leads, connections
//!   leadflow check-config                             # Report missing settings

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use leadflow_core::{CalendarConnection, Flow, Lead, LeadflowConfig};
use leadflow_scheduler::{
    FlowLauncher, RetryPolicy, SqliteQueue, SqliteStore, TaskLifecycleController, WorkerPool,
};

#[derive(Parser)]
#[command(name = "leadflow", version, about = "📇 Leadflow: lead orchestration worker")]
struct Cli {
    /// Config file (default: ~/.leadflow/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Run the worker pool
    Worker,
    /// Schedule the step that follows a node for some leads
    Publish {
        #[arg(long)]
        user: String,
        #[arg(long)]
        flow: String,
        /// Source node; the route leaving it picks the step
        #[arg(long, default_value = "start")]
        node: String,
        #[arg(required = true)]
        leads: Vec<String>,
    },
    /// Load a JSON fixture of flows, leads and calendar connections
    Load { file: String },
    /// Print configuration problems
    CheckConfig,
}

/// Fixture document accepted by `load`.
#[derive(Debug, Default, Deserialize)]
struct Fixture {
    #[serde(default)]
    flows: Vec<Flow>,
    #[serde(default)]
    leads: Vec<Lead>,
    #[serde(default)]
    connections: Vec<CalendarConnection>,
}

fn init_logging(verbose: bool, json: bool) {
    let fallback = if verbose { "leadflow=debug" } else { "leadflow=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn config_path(path: Option<&str>) -> PathBuf {
    match path {
        Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
        None => LeadflowConfig::default_path(),
    }
}

/// Write the default configuration unless a file is already there.
fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    LeadflowConfig::default()
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("✅ Config written to {}", path.display());
    Ok(())
}

fn load_config(path: Option<&str>) -> Result<LeadflowConfig> {
    let config = match path {
        Some(_) => LeadflowConfig::load_from(&config_path(path))?.with_env(),
        None => LeadflowConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);
    if let Command::Init { force } = cli.command {
        return init_config(&config_path(cli.config.as_deref()), force);
    }
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Init { .. } => Ok(()),
        Command::CheckConfig => check_config(&config),
        Command::Load { file } => load_fixture(&config, &file),
        Command::Publish {
            user,
            flow,
            node,
            leads,
        } => publish(&config, &user, &flow, &node, &leads).await,
        Command::Worker => run_worker(config).await,
    }
}

fn check_config(config: &LeadflowConfig) -> Result<()> {
    println!("📇 Leadflow configuration");
    println!("   Database: {}", config.database_path().display());
    println!("   Workers:  {} per step kind", config.worker.pool_size);
    println!("   Retries:  {} (fixed {}s)", config.retry.max_retries, config.retry.fixed_delay_secs);
    let missing = config.validate();
    if missing.is_empty() {
        println!("✅ All required settings present");
        return Ok(());
    }
    for key in &missing {
        println!("⚠️  Missing: {key}");
    }
    anyhow::bail!("{} required setting(s) missing", missing.len())
}

fn open_store(config: &LeadflowConfig) -> Result<Arc<SqliteStore>> {
    let path = config.database_path();
    let store = SqliteStore::open(&path)
        .with_context(|| format!("opening store at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn open_queue(config: &LeadflowConfig) -> Result<Arc<SqliteQueue>> {
    let lease = Duration::from_secs(config.worker.lease_secs);
    let queue = SqliteQueue::open(&config.database_path(), lease).context("opening step queue")?;
    Ok(Arc::new(queue))
}

fn load_fixture(config: &LeadflowConfig, file: &str) -> Result<()> {
    let path = shellexpand::tilde(file).to_string();
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let fixture: Fixture = serde_json::from_str(&raw).context("parsing fixture")?;
    let store = open_store(config)?;

    for flow in &fixture.flows {
        store.save_flow(flow)?;
    }
    for lead in &fixture.leads {
        store.save_lead(lead)?;
    }
    for conn in &fixture.connections {
        store.save_connection(conn)?;
    }
    tracing::info!(
        "💾 Loaded {} flow(s), {} lead(s), {} connection(s)",
        fixture.flows.len(),
        fixture.leads.len(),
        fixture.connections.len()
    );
    Ok(())
}

async fn publish(
    config: &LeadflowConfig,
    user: &str,
    flow: &str,
    node: &str,
    leads: &[String],
) -> Result<()> {
    let store = open_store(config)?;
    let queue = open_queue(config)?;
    let launcher = FlowLauncher::new(store.clone(), store, queue);
    let sent = launcher.publish(user, flow, node, leads).await?;
    for message in &sent {
        println!("📤 {} → {} ({})", message.lead_id, message.target_node, message.id);
    }
    Ok(())
}

async fn run_worker(config: LeadflowConfig) -> Result<()> {
    for key in config.validate() {
        tracing::warn!("⚠️  Missing setting: {key}");
    }

    let store = open_store(&config)?;
    let queue = open_queue(&config)?;
    let steps = leadflow_steps::build_registry(&config, store.clone(), store.clone(), store.clone())?;
    let controller = Arc::new(TaskLifecycleController::new(
        store.clone(),
        store,
        queue.clone(),
        steps,
        RetryPolicy::from_config(&config.retry),
    ));
    let pool = Arc::new(WorkerPool::new(queue, controller, &config.worker));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let workers = tokio::spawn(pool.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutting down workers...");
    shutdown_tx.send(true)?;
    workers.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_loadable_defaults() {
        let dir = std::env::temp_dir().join("leadflow-init-test");
        let path = dir.join("config.toml");
        std::fs::remove_dir_all(&dir).ok();

        init_config(&path, false).unwrap();
        let loaded = LeadflowConfig::load_from(&path).unwrap();
        assert_eq!(loaded.retry.max_retries, 3);

        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }
}
