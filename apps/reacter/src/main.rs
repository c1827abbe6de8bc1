//! Command-line entry point. The default mode runs the check engine piped
//! directly into the event router within one process; the subcommands run
//! each stage on its own.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use reacter::checks::CheckEngine;
use reacter::config::{self, DEFAULT_CONFIG_DIR, DEFAULT_CONFIG_FILE};
use reacter::handlers::router::{DEFAULT_CACHE_DIR, EventRouter};

#[derive(Parser)]
#[command(
    name = "reacter",
    version,
    about = "a tool for generating, consuming, and handling system monitoring events"
)]
struct Cli {
    /// Level of log output verbosity
    #[arg(short = 'L', long, global = true, default_value = "info", env = "LOGLEVEL")]
    log_level: String,

    /// The name of the node to use when reporting check output
    #[arg(short = 'n', long, global = true, env = "REACTER_ID")]
    node_name: Option<String>,

    /// Path to a unified YAML configuration file
    #[arg(
        short = 'f',
        long,
        global = true,
        default_value = DEFAULT_CONFIG_FILE,
        env = "REACTER_CONFIG"
    )]
    config_file: String,

    /// The directory containing YAML configuration files
    #[arg(
        short = 'c',
        long,
        global = true,
        default_value = DEFAULT_CONFIG_DIR,
        env = "REACTER_CONFIG_DIR"
    )]
    config_dir: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start performing checks on an interval and outputting the results
    Check {
        /// Print check events as JSON on standard output
        #[arg(short = 'j', long)]
        print_json: bool,

        /// Only emit events when the state is different than the previous one
        #[arg(short = 'C', long)]
        only_changes: bool,

        /// Do not emit events whose checks are flapping between okay and non-okay
        #[arg(short = 'F', long)]
        no_flapping: bool,
    },

    /// Receive check events on standard input and execute handlers
    Handle,

    /// Periodically execute handler queries and save their output to a cache directory
    Cacher {
        /// The location of the directory to save cache output to
        #[arg(short = 'C', long, default_value = DEFAULT_CACHE_DIR)]
        cache_dir: PathBuf,

        /// Regenerate the cache once and exit
        #[arg(short = 'o', long)]
        once: bool,

        /// How often the cache should be regenerated for each handler query command
        #[arg(short = 'I', long, default_value = "60s")]
        interval: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    logger::init_tracing(&cli.log_level);

    match cli.command.take() {
        Some(Command::Check { print_json, only_changes, no_flapping }) => {
            let mut engine = build_engine(&cli);
            engine.print_json = print_json;
            engine.only_print_changes = only_changes;
            engine.suppress_flapping = no_flapping;

            engine.run(None).await.context("checks")
        }

        Some(Command::Handle) => {
            let mut router = build_router(&cli, None);
            router.run(tokio::io::stdin()).await.context("handlers")
        }

        Some(Command::Cacher { cache_dir, once, interval }) => {
            let interval = if once {
                std::time::Duration::ZERO
            } else {
                config::parse_duration(&interval)
                    .map_err(|err| anyhow::anyhow!(err))
                    .context("invalid --interval")?
            };

            let mut router = build_router(&cli, Some(cache_dir));
            router.run_query_cacher(interval).await.context("cacher")
        }

        // wire check outputs directly to handler inputs
        None => {
            let (sink, source) = tokio::io::duplex(64 * 1024);
            let engine = build_engine(&cli);
            let mut router = build_router(&cli, None);

            tokio::select! {
                result = engine.run(Some(Box::new(sink))) => result.context("checks"),
                result = router.run(source) => result.context("handlers"),
            }
        }
    }
}

fn build_engine(cli: &Cli) -> CheckEngine {
    let node_name = cli.node_name.clone().unwrap_or_else(|| {
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    });

    info!("node name is '{node_name}'");

    let mut engine = CheckEngine::new(node_name);
    engine.config_file = cli.config_file.clone();
    engine.config_dir = cli.config_dir.clone();
    engine
}

fn build_router(cli: &Cli, cache_dir: Option<PathBuf>) -> EventRouter {
    let mut router = EventRouter::new();
    router.config_file = cli.config_file.clone();
    router.config_dir = cli.config_dir.clone();

    if let Some(cache_dir) = cache_dir {
        router.cache_dir = cache_dir;
    }

    router
}
