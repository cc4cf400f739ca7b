/*!
Tally CLI - runs the collector server or the metrics agent.

Settings come from an optional JSON config file; command-line flags and
`TALLY_*` environment variables override individual fields.
*/

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tabled::{Table, Tabled};
use tally_core::config::{parse_duration, parse_duration_list};
use tally_core::observability::init_observability;
use tally_core::shutdown::cancel_on_signal;
use tally_core::{AgentConfig, ServerConfig, SnapshotFile, TransportKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Runtime metrics collection and delivery")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, env = "TALLY_VERBOSE")]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "TALLY_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collector server
    Server(ServerArgs),
    /// Run the metrics agent
    Agent(AgentArgs),
    /// Print the contents of a snapshot file
    Snapshot {
        /// Snapshot file to read
        path: PathBuf,
    },
}

#[derive(Args)]
struct ServerArgs {
    /// JSON config file; flags override its fields
    #[arg(short, long, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long, env = "TALLY_ADDRESS")]
    address: Option<String>,

    /// Binary RPC listen address
    #[arg(long, env = "TALLY_RPC_ADDRESS")]
    rpc_address: Option<String>,

    /// Snapshot file; an empty value disables snapshots
    #[arg(short = 'f', long, env = "TALLY_FILE_STORAGE_PATH")]
    file_storage_path: Option<PathBuf>,

    /// Snapshot interval; 0 writes on every update
    #[arg(short = 'i', long, env = "TALLY_STORE_INTERVAL", value_parser = parse_duration)]
    store_interval: Option<Duration>,

    /// Restore the snapshot on startup
    #[arg(short, long, env = "TALLY_RESTORE")]
    restore: Option<bool>,

    /// Postgres connection string
    #[arg(short, long, env = "TALLY_DATABASE_DSN")]
    database_dsn: Option<String>,

    /// CIDR that callers must come from
    #[arg(short, long, env = "TALLY_TRUSTED_SUBNET")]
    trusted_subnet: Option<String>,

    /// HMAC-SHA256 key for body signatures
    #[arg(short, long, env = "TALLY_KEY")]
    key: Option<String>,

    /// Retry delays for storage operations, e.g. `1s,3s,5s`
    #[arg(long, env = "TALLY_BACKOFF")]
    backoff: Option<String>,

    /// Disable storage retries
    #[arg(long, env = "TALLY_NO_BACKOFF")]
    no_backoff: bool,

    /// How long in-flight requests may run after shutdown starts
    #[arg(long, env = "TALLY_SHUTDOWN_GRACE", value_parser = parse_duration)]
    shutdown_grace: Option<Duration>,
}

#[derive(Args)]
struct AgentArgs {
    /// JSON config file; flags override its fields
    #[arg(short, long, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    /// Server address
    #[arg(short, long, env = "TALLY_ADDRESS")]
    address: Option<String>,

    /// Delivery transport (`http` or `rpc`)
    #[arg(long, env = "TALLY_TRANSPORT")]
    transport: Option<TransportKind>,

    /// Sampling interval
    #[arg(short, long, env = "TALLY_POLL_INTERVAL", value_parser = parse_duration)]
    poll_interval: Option<Duration>,

    /// Delivery interval of each worker
    #[arg(short, long, env = "TALLY_REPORT_INTERVAL", value_parser = parse_duration)]
    report_interval: Option<Duration>,

    /// Number of concurrent delivery workers
    #[arg(short = 'l', long, env = "TALLY_RATE_LIMIT")]
    rate_limit: Option<usize>,

    /// Gzip request bodies
    #[arg(long, env = "TALLY_COMPRESS")]
    compress: Option<bool>,

    /// HMAC-SHA256 key for body signatures
    #[arg(short, long, env = "TALLY_KEY")]
    key: Option<String>,

    /// Retry delays, e.g. `1s,3s,5s`
    #[arg(long, env = "TALLY_BACKOFF")]
    backoff: Option<String>,

    /// Send every batch once without retries
    #[arg(long, env = "TALLY_NO_BACKOFF")]
    no_backoff: bool,

    /// Timeout of a single delivery attempt
    #[arg(long, env = "TALLY_REQUEST_TIMEOUT", value_parser = parse_duration)]
    request_timeout: Option<Duration>,

    /// How long workers may run after shutdown starts
    #[arg(long, env = "TALLY_SHUTDOWN_GRACE", value_parser = parse_duration)]
    shutdown_grace: Option<Duration>,
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Value")]
    value: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_observability(cli.json_logs, cli.verbose).context("failed to initialize logging")?;

    let result = match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Agent(args) => run_agent(args).await,
        Commands::Snapshot { path } => show_snapshot(path),
    };
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "Tally exited with an error");
    }
    result
}

async fn run_server(args: ServerArgs) -> Result<(), anyhow::Error> {
    let config = server_config(args)?;
    info!(
        address = %config.address,
        rpc_address = config.rpc_address.as_deref().unwrap_or("disabled"),
        "Starting server"
    );

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());
    tally_core::server::run_server(config, cancel)
        .await
        .context("server failed")
}

async fn run_agent(args: AgentArgs) -> Result<(), anyhow::Error> {
    let config = agent_config(args)?;

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());
    tally_core::agent::run_agent(config, cancel)
        .await
        .context("agent failed")
}

fn server_config(args: ServerArgs) -> Result<ServerConfig, anyhow::Error> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    if let Some(address) = args.address {
        config.address = address;
    }
    if let Some(rpc_address) = args.rpc_address {
        config.rpc_address = Some(rpc_address).filter(|a| !a.trim().is_empty());
    }
    if let Some(path) = args.file_storage_path {
        config.file_storage_path = Some(path);
    }
    if let Some(interval) = args.store_interval {
        config.store_interval = interval;
    }
    if let Some(restore) = args.restore {
        config.restore = restore;
    }
    if let Some(dsn) = args.database_dsn {
        config.database_dsn = Some(dsn);
    }
    if let Some(subnet) = args.trusted_subnet {
        config.trusted_subnet = Some(subnet);
    }
    if let Some(key) = args.key {
        config.key = Some(key);
    }
    if let Some(delays) = args.backoff {
        config.backoff_intervals = parse_duration_list(&delays)?;
    }
    if args.no_backoff {
        config.backoff = false;
    }
    if let Some(grace) = args.shutdown_grace {
        config.shutdown_grace = grace;
    }

    config.validate()?;
    Ok(config)
}

fn agent_config(args: AgentArgs) -> Result<AgentConfig, anyhow::Error> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };

    if let Some(address) = args.address {
        config.address = address;
    }
    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    if let Some(interval) = args.poll_interval {
        config.poll_interval = interval;
    }
    if let Some(interval) = args.report_interval {
        config.report_interval = interval;
    }
    if let Some(workers) = args.rate_limit {
        config.rate_limit = workers;
    }
    if let Some(compress) = args.compress {
        config.compress_request = compress;
    }
    if let Some(key) = args.key {
        config.key = Some(key);
    }
    if let Some(delays) = args.backoff {
        config.backoff_intervals = parse_duration_list(&delays)?;
    }
    if args.no_backoff {
        config.backoff = false;
    }
    if let Some(timeout) = args.request_timeout {
        config.request_timeout = timeout;
    }
    if let Some(grace) = args.shutdown_grace {
        config.shutdown_grace = grace;
    }

    config.validate()?;
    Ok(config)
}

fn show_snapshot(path: PathBuf) -> Result<(), anyhow::Error> {
    let Some(mut metrics) = SnapshotFile::new(&path).load()? else {
        println!("No snapshot found at: {}", path.display());
        return Ok(());
    };
    if metrics.is_empty() {
        println!("Snapshot {} is empty", path.display());
        return Ok(());
    }

    metrics.sort_by(|a, b| (a.kind().as_str(), &a.id).cmp(&(b.kind().as_str(), &b.id)));
    let rows: Vec<SnapshotRow> = metrics
        .iter()
        .map(|metric| SnapshotRow {
            id: metric.id.clone(),
            kind: metric.kind().to_string(),
            value: metric.value.to_string(),
        })
        .collect();

    println!("{}", Table::new(rows));
    println!("{} metrics in {}", metrics.len(), path.display());
    Ok(())
}
