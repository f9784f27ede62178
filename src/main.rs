use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use corredor::config::{Config, ConfigError};
use corredor::utils::{format_bytes, format_latency};
use corredor::{ClusterMonitor, ConnectionFactory, HandshakeChecker, WireCodec};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "corredor")]
#[command(about = "Pipelined MongoDB wire-protocol transport with cluster awareness")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the configured servers and print the topology
    Inspect {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Keep checking the cluster and log topology changes until Ctrl-C
    Monitor {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate example configuration files
    Config {
        /// Deployment kind (standalone, replica-set or sharded)
        #[arg(short, long)]
        kind: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { config } => inspect(config).await,
        Commands::Monitor { config } => monitor(config).await,
        Commands::Config { kind, output } => generate_config(kind, output),
        Commands::Validate { config } => validate_config(config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn load_config(config_path: &PathBuf) -> Result<Config> {
    Config::load_from_file(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))
}

fn factory_for(config: &Config) -> Arc<ConnectionFactory<WireCodec>> {
    let codec = WireCodec::new(config.client.max_message_size);
    Arc::new(ConnectionFactory::new(config.clone(), codec))
}

async fn inspect(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    init_logging(&config)?;

    let factory = factory_for(&config);
    let seed = factory.connect().await.context("No configured server answered")?;
    seed.close().await;

    // Identify the remaining seeds as well so the table is complete.
    for address in &config.client.servers {
        if address == seed.address() {
            continue;
        }
        match factory.connect_to(address).await {
            Ok(connection) => {
                connection.close().await;
            }
            Err(e) => warn!("Handshake with {} failed: {}", address, e),
        }
    }

    let cluster = factory.cluster();
    println!("{:<28} {:<11} {:<10} {:>10} {:>12}  reachable", "server", "role", "set", "latency", "max message");
    for server in cluster.servers() {
        println!(
            "{:<28} {:<11} {:<10} {:>10} {:>12}  {}",
            server.address,
            server.role.to_string(),
            server.set_name.as_deref().unwrap_or("-"),
            format_latency(server.latency),
            format_bytes(server.max_message_size as u64),
            if server.reachable { "yes" } else { "no" },
        );
    }
    println!();
    println!("{}", cluster.stats());

    Ok(())
}

async fn monitor(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    init_logging(&config)?;

    if !config.monitor.enabled {
        bail!("Monitoring is disabled in {:?}", config_path);
    }

    info!("Starting corredor v{} monitor", corredor::VERSION);
    let factory = factory_for(&config);
    match factory.connect().await {
        Ok(seed) => {
            seed.close().await;
        }
        Err(e) => warn!("Initial connect failed, monitoring anyway: {}", e),
    }

    let checker = HandshakeChecker::new(Arc::clone(&factory), &config.monitor);
    let monitor = Arc::new(ClusterMonitor::new(
        Box::new(checker),
        Arc::clone(factory.cluster()),
    ));
    let task = Arc::clone(&monitor).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down monitor");
    task.abort();
    info!("Final topology: {}", monitor.cluster().stats());

    Ok(())
}

fn generate_config(kind: String, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", kind, output);

    Config::create_example_config(&output, &kind).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your deployment and run:");
    println!("  corredor inspect --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Selection policy: {:?}", config.selection.policy);
            println!("  Default routing: {}", config.selection.default_routing);
            println!(
                "  Queue depth per connection: {}",
                config.client.max_pending_operations_per_connection
            );
            println!("  Seed servers: {} instances", config.client.servers.len());
            for (i, server) in config.client.servers.iter().enumerate() {
                println!("    {}: {}", i + 1, server);
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("corredor v{}", corredor::VERSION);
    println!("Pipelined MongoDB wire-protocol transport with cluster awareness");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Pipelined connections with in-order reply matching");
    println!("  • Latency-window and round-robin server selection");
    println!("  • Reconnect with exponential backoff and request hand-off");
    println!("  • Background cluster monitoring");
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
