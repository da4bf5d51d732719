#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kollect_dispatch::{Dispatcher, DispatcherConfig, LogTransport, SyncPayload};
use kollect_store::DEFAULT_PURGE_CAPACITY;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod agent;

use agent::{Agent, Settings};

const DRAIN_LIMIT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "kollectd", version, about = "Kubernetes resource graph collector")]
struct Cli {
    /// Cluster identity; prefixes every node UID
    #[arg(long, env = "KOLLECT_CLUSTER_NAME", default_value = "local-cluster", global = true)]
    cluster_name: String,

    /// Seconds between resource discovery passes
    #[arg(long, env = "KOLLECT_REDISCOVER_SECS", default_value_t = 120, global = true)]
    rediscover_secs: u64,

    /// Seconds to wait for a new watcher's initial list
    #[arg(long, env = "KOLLECT_INIT_TIMEOUT_SECS", default_value_t = 10, global = true)]
    init_timeout_secs: u64,

    /// Seconds between syncs to the aggregator
    #[arg(long, env = "KOLLECT_REPORT_SECS", default_value_t = 5, global = true)]
    report_secs: u64,

    /// Seconds to wait after a failed sync
    #[arg(long, env = "KOLLECT_RETRY_SECS", default_value_t = 10, global = true)]
    retry_secs: u64,

    /// Recently deleted UIDs remembered to reject late events
    #[arg(long, env = "KOLLECT_PURGE_CAPACITY", default_value_t = DEFAULT_PURGE_CAPACITY, global = true)]
    purge_capacity: usize,

    /// Transform workers (default: available parallelism)
    #[arg(long, env = "KOLLECT_WORKERS", global = true)]
    workers: Option<usize>,

    /// Capacity of the channels between stages
    #[arg(long, env = "KOLLECT_QUEUE_CAP", default_value_t = 2048, global = true)]
    queue_cap: usize,

    /// YAML file with allow/deny rules
    #[arg(long, env = "KOLLECT_FILTER_FILE", global = true)]
    filter_file: Option<PathBuf>,

    /// Log full payload JSON
    #[arg(long, env = "KOLLECT_PRINT_PAYLOADS", action = ArgAction::SetTrue, global = true)]
    print_payloads: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the collector until interrupted
    Run,
    /// Print the resource types that would be watched
    Discover {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
        output: Output,
    },
    /// Collect for a while, then print the complete graph as JSON
    Snapshot {
        #[arg(long = "wait-secs", default_value_t = 15)]
        wait_secs: u64,
    },
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        Ok(Settings {
            cluster: self.cluster_name.clone(),
            init_timeout: Duration::from_secs(self.init_timeout_secs),
            purge_capacity: self.purge_capacity,
            workers: self.workers.unwrap_or_else(kollect_transform::default_workers),
            queue_cap: self.queue_cap.max(1),
            filter: agent::load_filter(self.filter_file.as_deref())?,
        })
    }

    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            report_interval: Duration::from_secs(self.report_secs.max(1)),
            retry_interval: Duration::from_secs(self.retry_secs.max(1)),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KOLLECT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KOLLECT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KOLLECT_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run => run(&cli).await,
        Commands::Discover { output } => discover(&cli, *output).await,
        Commands::Snapshot { wait_secs } => snapshot(&cli, Duration::from_secs(*wait_secs)).await,
    }
}

async fn client() -> Result<Client> {
    Client::try_default().await.context("building Kubernetes client")
}

async fn run(cli: &Cli) -> Result<()> {
    let settings = cli.settings()?;
    let Agent { reconciler, supervisor, tasks } = Agent::assemble(client().await?, &settings);

    let token = CancellationToken::new();
    let watching = tokio::spawn(supervisor.run(Duration::from_secs(cli.rediscover_secs.max(1)), token.child_token()));
    let dispatching = Dispatcher::new(reconciler, Arc::new(LogTransport::new(cli.print_payloads)))
        .with_config(cli.dispatcher_config())
        .spawn(token.child_token());
    info!(cluster = %settings.cluster, "collector running; ctrl-c to stop");

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    token.cancel();
    let _ = watching.await;
    let _ = dispatching.await;
    agent::drain(tasks, DRAIN_LIMIT).await;
    Ok(())
}

async fn discover(cli: &Cli, output: Output) -> Result<()> {
    let filter = agent::load_filter(cli.filter_file.as_deref())?;
    let resources = kollect_kubehub::discover_watchable(&client().await?, &filter).await?;
    match output {
        Output::Human => {
            for r in &resources {
                let scope = if r.namespaced { "namespaced" } else { "cluster" };
                println!("{} • {} • {}", r.key(), r.kind, scope);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
    }
    info!(count = resources.len(), "discover done");
    Ok(())
}

async fn snapshot(cli: &Cli, wait: Duration) -> Result<()> {
    let settings = cli.settings()?;
    let Agent { reconciler, supervisor, tasks } = Agent::assemble(client().await?, &settings);

    let token = CancellationToken::new();
    let watching = tokio::spawn(supervisor.run(Duration::from_secs(cli.rediscover_secs.max(1)), token.clone()));
    info!(wait_secs = wait.as_secs(), "collecting");
    tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        res = signal::ctrl_c() => res.context("waiting for ctrl-c")?,
    }
    token.cancel();
    let _ = watching.await;
    agent::drain(tasks, DRAIN_LIMIT).await;

    let payload = SyncPayload::from(reconciler.complete());
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
