//! dualmod CLI - resolve, link and run dual-format module graphs

#![warn(missing_docs)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use dualmod_loader::{LoadError, ModuleLoader};
use std::path::PathBuf;
use tracing::Level;

mod commands;
mod config;

use commands::{check, graph, resolve, run};

#[derive(Parser)]
#[command(name = "dualmod")]
#[command(about = "Dual-format module loader", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a specifier the way a module would
    Resolve {
        /// Specifier to resolve
        specifier: String,

        /// Requesting file (defaults to the current directory)
        #[arg(long)]
        from: Option<PathBuf>,

        /// Request kind
        #[arg(long, value_enum, default_value = "static")]
        mode: resolve::Mode,
    },

    /// Link an entry point without evaluating it
    Check {
        /// Entry module
        entry: PathBuf,
    },

    /// Print the dependency graph of an entry point
    Graph {
        /// Entry module
        entry: PathBuf,

        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// Link and evaluate an entry point
    Run {
        /// Entry module
        entry: PathBuf,

        /// Evaluate through the synchronous bridge
        #[arg(long)]
        sync: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = execute(cli).await {
        match error.downcast_ref::<LoadError>() {
            Some(load_error) => eprintln!("error[{}]: {}", load_error.code(), load_error),
            None => eprintln!("error: {:#}", error),
        }
        std::process::exit(1);
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config)?;
    let loader = ModuleLoader::new(config.loader.clone());

    match cli.command {
        Commands::Resolve {
            specifier,
            from,
            mode,
        } => resolve::resolve(&loader, &specifier, from, mode),
        Commands::Check { entry } => check::check(&loader, &entry, &config.output),
        Commands::Graph { entry, json } => graph::graph(&loader, &entry, json || config.output.json),
        Commands::Run { entry, sync } => run::run(&loader, &entry, sync).await,
    }
}
