mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use events::{Event, EventBus, EventEnvelope};
use orchestrator::{
    Catalog, CommandNodeInstaller, ErrorKind, JsonCatalog, SandboxOrchestrator, ScriptWriter,
    TemplateScriptWriter,
};
use sandbox_core::{AuxiliaryPorts, ConcurrencyMode, SandboxBatchRequest, Version};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "dbsandbox")]
#[command(about = "Deploy multi-node database sandboxes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.dbsandbox/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default config file
    Init {
        #[arg(long)]
        overwrite: bool,
    },
    /// Deploy several independent nodes of one version
    Deploy(DeployArgs),
    /// List deployed sandboxes
    List,
}

#[derive(clap::Args)]
struct DeployArgs {
    /// Server version, e.g. 8.0.11
    version: String,

    #[arg(short, long)]
    nodes: Option<u32>,

    /// First port is base + 1
    #[arg(long)]
    base_port: Option<u16>,

    /// Run the nodes' installation steps in parallel
    #[arg(long)]
    concurrent: bool,

    #[arg(long)]
    max_parallelism: Option<usize>,

    /// Replace an existing sandbox in the same directory
    #[arg(long)]
    force: bool,

    #[arg(long)]
    dir_name: Option<String>,

    /// Do not allocate auxiliary ports
    #[arg(long)]
    disable_aux: bool,

    /// Directory holding the server binaries (default: <sandbox_binary>/<version>)
    #[arg(long)]
    basedir: Option<PathBuf>,

    #[arg(long)]
    sandbox_home: Option<PathBuf>,

    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.unwrap_or_else(CliConfig::default_path);

    match cli.command {
        Commands::Init { overwrite } => init_config(&config_path, overwrite).await,
        Commands::Deploy(args) => {
            let config = CliConfig::read(&config_path).await;
            deploy(&config, args).await
        }
        Commands::List => {
            let config = CliConfig::read(&config_path).await;
            list(&config).await
        }
    }
}

async fn init_config(path: &std::path::Path, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }

    let config = CliConfig::default();
    config.write(path).await?;
    tokio::fs::create_dir_all(config.sandbox_home())
        .await
        .with_context(|| format!("creating {}", config.sandbox_home().display()))?;

    println!("Wrote {}", path.display());
    println!("  sandbox home:   {}", config.sandbox_home().display());
    println!("  sandbox binary: {}", config.sandbox_binary().display());
    Ok(())
}

async fn deploy(config: &CliConfig, args: DeployArgs) -> Result<()> {
    let version: Version = args
        .version
        .parse()
        .with_context(|| format!("'{}' is not a version", args.version))?;

    let catalog = Arc::new(JsonCatalog::new(config.catalog()));
    let installed = catalog
        .installed_ports()
        .await
        .context("Failed to read the sandbox catalog")?;

    let auxiliary = if args.disable_aux || !version.at_least(&config.auxiliary.min_version) {
        AuxiliaryPorts::disabled()
    } else if config.auxiliary.optional {
        AuxiliaryPorts::optional()
    } else {
        AuxiliaryPorts::required()
    };

    let basedir = args
        .basedir
        .unwrap_or_else(|| config.sandbox_binary().join(version.to_string()));
    let sandbox_home = args.sandbox_home.unwrap_or_else(|| config.sandbox_home());
    let mode = if args.concurrent {
        ConcurrencyMode::Concurrent
    } else {
        ConcurrencyMode::Sequential
    };

    let mut request = SandboxBatchRequest::new(version, basedir, sandbox_home)
        .with_nodes(args.nodes.unwrap_or(config.nodes.count))
        .with_mode(mode)
        .with_installed_ports(installed)
        .with_auxiliary(auxiliary)
        .with_force(args.force);
    if let Some(port) = args.base_port {
        request = request.with_base_port(port);
    }
    if let Some(dir_name) = args.dir_name {
        request = request.with_dir_name(dir_name);
    }
    if let Some(log_file) = args.log_file {
        request = request.with_log_file(log_file);
    }

    let mut orchestrator_config = config.orchestrator_config();
    if args.max_parallelism.is_some() {
        orchestrator_config = orchestrator_config.with_max_parallelism(args.max_parallelism);
    }

    let scripts: Arc<dyn ScriptWriter> = Arc::new(TemplateScriptWriter::new());
    let installer = CommandNodeInstaller::new(config.commands.clone(), Arc::clone(&scripts));
    let bus = EventBus::new();
    let progress = tokio::spawn(print_progress(bus.subscribe()));
    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn(cancel_on_ctrl_c(cancel.clone()));
    let mut orchestrator =
        SandboxOrchestrator::new(orchestrator_config, Arc::new(installer), catalog, scripts)
            .with_event_bus(bus)
            .with_cancellation(cancel);

    let outcome = orchestrator.provision(&request).await;
    interrupt.abort();

    // Closes the channel so the progress printer drains and exits.
    drop(orchestrator);
    let _ = progress.await;

    match outcome {
        Ok(result) => {
            println!(
                "{} directory installed in {}",
                result.sandbox_type,
                result.sandbox_dir.display()
            );
            for node in &result.nodes {
                match node.auxiliary_port.filter(|_| node.auxiliary_enabled) {
                    Some(aux) => println!("  {:<8} port {} (auxiliary {})", node.label, node.port, aux),
                    None => println!("  {:<8} port {}", node.label, node.port),
                }
            }
            Ok(())
        }
        Err(e) => {
            for failure in e.cleanup_failures() {
                eprintln!(
                    "  not cleaned up: {} {} ({})",
                    failure.action, failure.target, failure.reason
                );
            }
            if e.kind() == ErrorKind::Cancelled {
                return Err(anyhow::Error::new(e).context("interrupted"));
            }
            Err(e.into())
        }
    }
}

/// Cancel the run on Ctrl-C. Steps already running are waited for and the
/// run rolls itself back.
async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("Interrupted, stopping after the running steps and rolling back");
        cancel.cancel();
    }
}

async fn print_progress(mut rx: broadcast::Receiver<EventEnvelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => match envelope.event {
                Event::StepFinished {
                    tier,
                    node,
                    step,
                    success,
                    error,
                    ..
                } => match error {
                    Some(reason) if !success => {
                        println!("  [tier {}] node{} {}: FAILED {}", tier, node, step, reason)
                    }
                    _ => println!("  [tier {}] node{} {}: ok", tier, node, step),
                },
                Event::CleanupInvoked {
                    action,
                    target,
                    success,
                    ..
                } => println!(
                    "  rollback {} {}: {}",
                    action,
                    target,
                    if success { "ok" } else { "FAILED" }
                ),
                _ => {}
            },
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn list(config: &CliConfig) -> Result<()> {
    let catalog = JsonCatalog::new(config.catalog());
    let items = catalog.list().await?;

    if items.is_empty() {
        println!("No sandboxes deployed.");
        return Ok(());
    }

    for item in &items {
        let ports = item
            .port
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{} {:<8} {} [{}] {}",
            item.version,
            item.sandbox_type,
            item.destination.display(),
            ports,
            item.nodes.join(" "),
        );
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dbsandbox=info,orchestrator=info".into()),
        )
        .init();
}
