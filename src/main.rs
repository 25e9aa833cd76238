// ABOUTME: CLI entry point for warehouse-mirror
// ABOUTME: Loads configuration and routes to the run, plan, stale, and environments commands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use warehouse_mirror::commands;
use warehouse_mirror::config::Config;
use warehouse_mirror::postgres::ConnectOptions;

#[derive(Parser)]
#[command(name = "warehouse-mirror")]
#[command(about = "Mirror PostgreSQL tables into a warehouse with incremental merges", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to mirror.toml (defaults to ./mirror.toml, then ~/.warehouse-mirror/mirror.toml)
    #[arg(long, env = "MIRROR_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Warehouse connection URL, overriding [warehouse] url
    #[arg(long = "warehouse-url", env = "WAREHOUSE_URL", global = true)]
    warehouse_url: Option<String>,
    /// Webhook receiving alerts, overriding [notify] webhook_url
    #[arg(long = "webhook-url", env = "MIRROR_WEBHOOK_URL", global = true)]
    webhook_url: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror every environment, then check for stale tables (default)
    Run {
        /// Write a JSON report of the run to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Show which strategy each table would use without moving data
    Plan,
    /// Check staged tables for staleness and alert, without mirroring
    Stale,
    /// List configured environments (passwords masked)
    Environments,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    config.add_discovered_environments(|key| std::env::var(key).ok())?;
    if let Some(url) = cli.warehouse_url {
        config.warehouse.url = Some(url);
    }
    if let Some(url) = cli.webhook_url {
        config.notify.webhook_url = Some(url);
    }

    let options = ConnectOptions {
        allow_self_signed_certs: cli.allow_self_signed_certs,
        ..ConnectOptions::default()
    };
    if options.allow_self_signed_certs {
        tracing::warn!("Accepting self-signed TLS certificates");
    }

    match cli.command.unwrap_or(Commands::Run { report: None }) {
        Commands::Run { report } => {
            let pipeline = commands::build_pipeline(&config, options).await?;
            commands::run(&pipeline, report.as_deref()).await
        }
        Commands::Plan => {
            let pipeline = commands::build_pipeline(&config, options).await?;
            commands::plan(&pipeline).await
        }
        Commands::Stale => {
            let pipeline = commands::build_pipeline(&config, options).await?;
            commands::stale(&pipeline).await
        }
        Commands::Environments => commands::environments(&config),
    }
}
