//! Grid bot binary
//!
//! Runs the grid market-making bot against the configured exchange:
//!
//! ```bash
//! cargo run --bin grid_bot -- run config.yaml --dry-run
//! ```
//!
//! Credentials come from `--api-key`/`--api-secret`, the `ASTER_API_KEY` /
//! `ASTER_API_SECRET` environment variables, or a `.env` file in the
//! working directory. Live trading requires both plus the `--live` flag
//! (or `dry_run: false` in config).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgGroup, Parser, Subcommand};
use log::{error, info};

use aster_grid_bot::{AsterRestClient, BotConfig, GridBot};

#[derive(Parser)]
#[command(
    name = "aster-grid-bot",
    about = "Grid market-making bot for Aster perpetual futures",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bot with the given configuration
    #[command(group(ArgGroup::new("run_mode").args(["dry_run", "live"])))]
    Run {
        /// Path to the YAML configuration file
        config: PathBuf,
        /// Force dry-run mode (no orders reach the exchange)
        #[arg(long)]
        dry_run: bool,
        /// Enable live trading mode
        #[arg(long)]
        live: bool,
        /// Override the configured log level (info, debug, ...)
        #[arg(long)]
        log_level: Option<String>,
        /// Write logs to this file instead of stderr
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// API key override
        #[arg(long)]
        api_key: Option<String>,
        /// API secret override
        #[arg(long)]
        api_secret: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before anything reads the environment; missing file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let Command::Run {
        config,
        dry_run,
        live,
        log_level,
        log_file,
        api_key,
        api_secret,
    } = cli.command;

    let mut cfg = match BotConfig::load(&config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Failed to load config {}: {err}", config.display());
            return ExitCode::FAILURE;
        }
    };
    if dry_run {
        cfg.dry_run = true;
    } else if live {
        cfg.dry_run = false;
    }
    if let Some(level) = log_level {
        cfg.log_level = level.to_uppercase();
    }

    init_logging(&cfg.log_level, log_file.as_deref());

    let client = match AsterRestClient::new(&cfg, api_key, api_secret) {
        Ok(client) => client,
        Err(err) => {
            error!("Failed to create REST client: {err}");
            return ExitCode::FAILURE;
        }
    };

    let bot = match GridBot::bootstrap(cfg, client).await {
        Ok(bot) => Arc::new(bot),
        Err(err) => {
            error!("Bootstrap failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    {
        let bot = Arc::clone(&bot);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted by user, shutting down...");
                bot.request_stop();
            }
        });
    }

    match Arc::clone(&bot).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Bot exited with error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str, log_file: Option<&std::path::Path>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.to_lowercase()));
    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(err) => eprintln!("Failed to open log file {}: {err}", path.display()),
        }
    }
    builder.init();
}
