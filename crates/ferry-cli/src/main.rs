//! Ferry command-line driver
//!
//! Builds a bridge from `ferry.toml` with the sample `user` and `canvas`
//! surfaces installed and inspects or exercises it.

mod commands;
mod logger;
mod output;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ferry_runtime::BridgeConfig;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Guest/host call bridge toolkit", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./ferry.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Color output: auto, always, never
    #[arg(long, global = true)]
    color: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the configuration, translator and registered modules
    Info,

    /// List dispatch tables and operation field shapes
    Tables {
        /// Only this module (name or number)
        module: Option<String>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run the end-to-end scenarios against the reference backends
    Demo,

    /// Issue concurrent calls from several threads and verify the results
    Stress {
        /// Worker threads (defaults to the number of CPUs)
        #[arg(short, long)]
        threads: Option<usize>,
        /// Calls per thread
        #[arg(short = 'n', long, default_value_t = 10_000)]
        calls: u64,
        /// Seed for the randomized arguments
        #[arg(long)]
        seed: Option<u64>,
    },
}

const DEFAULT_CONFIG: &str = "ferry.toml";

fn load_config(path: Option<&Path>) -> anyhow::Result<BridgeConfig> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG).exists() => Path::new(DEFAULT_CONFIG),
        None => return Ok(BridgeConfig::default()),
    };
    BridgeConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let choice = output::resolve_color_choice(cli.color.as_deref());
    let env = std::env::var("FERRY_LOG").ok();
    logger::init(
        logger::resolve_level(cli.verbose, env.as_deref(), &config.log.level),
        choice,
    );

    match cli.command {
        Commands::Info => commands::info::execute(&config, choice),
        Commands::Tables { module, json } => {
            commands::tables::execute(&config, module.as_deref(), json, choice)
        }
        Commands::Demo => commands::demo::execute(&config, choice),
        Commands::Stress {
            threads,
            calls,
            seed,
        } => {
            let threads = threads.unwrap_or_else(num_cpus::get).max(1);
            commands::stress::execute(&config, threads, calls, seed, choice)
        }
    }
}
