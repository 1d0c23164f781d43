use anyhow::Context;
use clusterctl::broadcast::LoggingTransport;
use clusterctl::config::StoreKind;
use clusterctl::coordination::{CoordinationStore, FileCoordinationStore, MemoryCoordinationStore};
use clusterctl::observability::LogConfig;
use clusterctl::{Controller, ControllerConfig};
use std::sync::Arc;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command line arguments structure
struct CliArgs {
    config_path: Option<String>,
    id: Option<String>,
    show_help: bool,
    show_version: bool,
}

fn print_help() {
    println!("clusterctl v{} - cluster state controller", VERSION);
    println!();
    println!("USAGE:");
    println!("    clusterctl [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>    Path to configuration file (TOML format)");
    println!("        --id <ID>          Controller identity, overrides [controller].id");
    println!("    -h, --help             Print help information");
    println!("    -v, --version          Print version information");
    println!();
    println!("CONFIGURATION FILE:");
    println!();
    println!("    [controller]");
    println!("    id = \"controller-0\"");
    println!();
    println!("    [[fleet.groups]]");
    println!("    name = \"group0\"");
    println!("    nodes = [{{ index = 0 }}, {{ index = 1 }}]");
    println!();
    println!("    [coordination]");
    println!("    store = \"file\"       # or \"memory\"");
    println!("    path = \"./data/cluster-state.json\"");
    println!();
    println!("    [logging]");
    println!("    level = \"info\"       # trace, debug, info, warn, error");
    println!("    format = \"text\"      # or \"json\"");
}

/// Parse command line arguments
fn parse_args() -> anyhow::Result<CliArgs> {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        config_path: None,
        id: None,
        show_help: false,
        show_version: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                cli.show_help = true;
                return Ok(cli);
            }
            "-v" | "--version" => {
                cli.show_version = true;
                return Ok(cli);
            }
            "-c" | "--config" => {
                let path = args
                    .get(i + 1)
                    .with_context(|| format!("{} requires a file path argument", args[i]))?;
                cli.config_path = Some(path.clone());
                i += 1;
            }
            "--id" => {
                let id = args
                    .get(i + 1)
                    .with_context(|| format!("{} requires an identity argument", args[i]))?;
                cli.id = Some(id.clone());
                i += 1;
            }
            arg => anyhow::bail!("unknown option '{}'. Use --help for usage.", arg),
        }
        i += 1;
    }

    Ok(cli)
}

fn load_config(cli: &CliArgs) -> anyhow::Result<ControllerConfig> {
    let mut config = match &cli.config_path {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("failed to load config file '{}'", path))?,
        None => ControllerConfig::default(),
    };
    // CLI arguments override config file
    if let Some(id) = &cli.id {
        config.controller.id = id.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn open_store(config: &ControllerConfig) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    match config.coordination.store {
        StoreKind::Memory => {
            warn!("using in-memory coordination store, versions restart at 1 after a restart");
            Ok(Arc::new(MemoryCoordinationStore::new()))
        }
        StoreKind::File => {
            let path = &config.coordination.path;
            let store = FileCoordinationStore::open(path)
                .await
                .with_context(|| format!("failed to open state file '{}'", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

async fn run(cli: CliArgs) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    LogConfig::from_config(&config.logging)?.init();

    info!(
        "clusterctl v{} starting as '{}' over {} content nodes",
        VERSION,
        config.controller.id,
        config.fleet.node_count()
    );

    let store = open_store(&config).await?;
    let controller = Controller::new(config, store, Arc::new(LoggingTransport))?;
    let handle = controller.handle();
    let task = tokio::spawn(controller.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "controller already stopped");
    }
    task.await.context("controller task panicked")??;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    if cli.show_help {
        print_help();
        return;
    }
    if cli.show_version {
        println!("clusterctl {}", VERSION);
        return;
    }

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
