use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use twinfix::config::{CONFIG_FILE, CliOverrides, TrackerConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "twinfix")]
#[command(version, about = "Facility repair tracker with real-time updates")]
pub struct Cli {
    /// Path to the config file (default: ./twinfix.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP + WebSocket server
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// Enable permissive CORS for a local frontend
        #[arg(long)]
        dev: bool,
    },
    /// Create the database schema and exit
    InitDb {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Report configuration warnings
    Validate,
}

fn init_tracing(verbose: bool, json: bool) -> Result<()> {
    let default = if verbose { "twinfix=debug" } else { "twinfix=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json)?;

    let config_path = cli.config.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let overrides = match &cli.command {
        Commands::Serve { port, db_path, dev } => CliOverrides {
            port: *port,
            db_path: db_path.clone(),
            dev_mode: *dev,
        },
        Commands::InitDb { db_path } => CliOverrides {
            db_path: db_path.clone(),
            ..CliOverrides::default()
        },
        Commands::Config { .. } => CliOverrides::default(),
    };
    let config = TrackerConfig::resolve(cli.config.as_deref(), &overrides)?;

    match cli.command {
        Commands::Serve { .. } => cmd::cmd_serve(config).await?,
        Commands::InitDb { .. } => cmd::cmd_init_db(&config)?,
        Commands::Config { command } => cmd::cmd_config(&config, &config_path, command)?,
    }

    Ok(())
}
