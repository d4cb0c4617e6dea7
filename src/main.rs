use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use riak_pool::commands::Ping;
use riak_pool::config::{Config, ConfigError};
use riak_pool::utils::format_duration;
use riak_pool::Cluster;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "riak-pool")]
#[command(about = "Connection pooling and failover core for Riak protocol-buffers clients")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ping the configured cluster
    Ping {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/riak.toml")]
        config: PathBuf,
        /// Number of pings to send
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
        /// Include a TLS/authentication section
        #[arg(long)]
        secure: bool,
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
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ping { config, count } => ping(config, count).await?,
        Commands::Config { output, secure } => generate_config(output, secure)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn ping(config_path: PathBuf, count: u32) -> anyhow::Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    init_logging(&config)?;

    info!("riak-pool v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);

    let cluster = Cluster::from_config(&config).context("Failed to build cluster")?;
    cluster.start()?;

    let mut failures = 0;
    for seq in 1..=count {
        let started = Instant::now();
        match cluster.execute(Ping::new()).await {
            Ok(()) => println!("ping {}: ok in {}", seq, format_duration(started.elapsed())),
            Err(e) => {
                failures += 1;
                println!("ping {}: {}", seq, e);
            }
        }
    }

    cluster.shutdown().await;
    if failures > 0 {
        anyhow::bail!("{} of {} pings failed", failures, count);
    }
    Ok(())
}

fn generate_config(output: PathBuf, secure: bool) -> anyhow::Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output, secure).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the node addresses and run:");
    println!("  riak-pool ping --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Selection: {:?}", config.cluster.selection);
            println!("  Retries: {}", config.cluster.execute_retry_count);
            println!("  Nodes: {}", config.nodes.len());
            for (i, node) in config.nodes.iter().enumerate() {
                println!(
                    "    {}: {} (connections {}..{}{})",
                    i + 1,
                    node.address,
                    node.min_connections,
                    node.max_connections,
                    if node.security.is_some() { ", tls" } else { "" }
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            Err(e.into())
        }
    }
}

fn show_version() {
    println!("riak-pool v{}", env!("CARGO_PKG_VERSION"));
    println!("Connection pooling and failover core for Riak protocol-buffers clients");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Length-prefixed protocol-buffers framing");
    println!("  • Per-node connection pools with health checking");
    println!("  • Round-robin and least-active node selection with failover");
    println!("  • StartTls upgrade and authentication via rustls");
}

/// RUST_LOG takes precedence over the configured level
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
