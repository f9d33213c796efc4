use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use autodisco_fleet::HintsRequest;
use autodisco_provider::{hints_cmd, new_pod_eventer, Config, FleetConfig};
use autodisco_store::{MemoryRegistry, RegistrySnapshot};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "autodiscoctl", version, about = "Kubernetes pod autodiscovery")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Provider config file (YAML)
    #[arg(short = 'c', long = "config", global = true, env = "AUTODISCO_CONFIG")]
    config: Option<PathBuf>,

    /// Restrict to pods on this node (overrides `node`)
    #[arg(long = "node", global = true)]
    node: Option<String>,

    /// Restrict to one namespace (overrides `namespace`)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Fleet server base URL (overrides `fleet.url`)
    #[arg(long = "fleet-url", global = true)]
    fleet_url: Option<String>,

    /// Agent id used for hints (overrides `fleet.agent_id`)
    #[arg(long = "agent-id", global = true)]
    agent_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch pods and print registry changes until Ctrl-C
    Run,
    /// Send one hints request read from a JSON file
    Hints {
        /// JSON document shaped like the hints request body
        file: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("AUTODISCO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("AUTODISCO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid AUTODISCO_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    if let Some(node) = &cli.node { cfg.node = Some(node.clone()); }
    if let Some(ns) = &cli.namespace { cfg.namespace = Some(ns.clone()); }
    if let Some(url) = &cli.fleet_url {
        cfg.fleet.get_or_insert_with(FleetConfig::default).url = url.clone();
    }
    if let Some(id) = &cli.agent_id {
        match cfg.fleet.as_mut() {
            Some(f) => f.agent_id = Some(id.clone()),
            None => warn!("--agent-id given without a fleet server; ignoring"),
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    match &cli.command {
        Commands::Run => run(&cfg, cli.output).await,
        Commands::Hints { file } => send_hints(&cfg, file, cli.output).await,
    }
}

async fn run(cfg: &Config, output: Output) -> Result<()> {
    let client = kube::Client::try_default().await.context("building kube client")?;
    let registry = Arc::new(MemoryRegistry::new());
    let mut epochs = registry.subscribe_epoch();
    let eventer = new_pod_eventer(client, cfg, registry.clone())?;
    info!(scope = cfg.scope.as_str(), node = ?cfg.node, ns = ?cfg.namespace, "starting pod provider");
    eventer.start().await?;

    let mut seen: HashMap<String, u64> = HashMap::new();
    print_changes(&registry.current(), &mut seen, output)?;
    loop {
        tokio::select! {
            changed = epochs.changed() => {
                if changed.is_err() {
                    warn!("registry closed; exiting");
                    break;
                }
                print_changes(&registry.current(), &mut seen, output)?;
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping provider");
                break;
            }
        }
    }
    eventer.stop();
    Ok(())
}

/// Human output prints `+ id` for new or republished entries and `- id` for
/// removed ones; JSON output prints the whole snapshot per epoch.
fn print_changes(snap: &RegistrySnapshot, seen: &mut HashMap<String, u64>, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string(snap)?),
        Output::Human => {
            for line in registry_changes(snap, seen) {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

/// Diff `snap` against the entry epochs in `seen`, then remember the new ones.
fn registry_changes(snap: &RegistrySnapshot, seen: &mut HashMap<String, u64>) -> Vec<String> {
    let mut lines = Vec::new();
    let mut live = HashMap::with_capacity(snap.entries.len());
    for e in &snap.entries {
        let id = e.id.to_string();
        if seen.get(&id) != Some(&e.epoch) {
            lines.push(format!("+ {} (priority {})", id, e.priority));
        }
        live.insert(id, e.epoch);
    }
    let mut gone: Vec<_> = seen.keys().filter(|id| !live.contains_key(*id)).collect();
    gone.sort();
    lines.extend(gone.into_iter().map(|id| format!("- {}", id)));
    *seen = live;
    lines
}

async fn send_hints(cfg: &Config, file: &Path, output: Output) -> Result<()> {
    let fleet = cfg.fleet.as_ref().context("no fleet server configured; set fleet.url or --fleet-url")?;
    let cmd = hints_cmd(fleet)?;
    let raw = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let req: HintsRequest = serde_json::from_slice(&raw).with_context(|| format!("parsing {}", file.display()))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });
    let resp = cmd.execute(&cancel, &req).await?;
    match output {
        Output::Human => println!("hints {} for agent {}", resp.action, cmd.agent_info().agent_id()),
        Output::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
    }
    Ok(())
}
