//! PeerMesh CLI: run an endpoint node from the terminal.
//!
//! `peermesh run` signs a node in on TCP (optionally a local named pipe),
//! connects to peers from contact files or UDP discovery, and prints
//! connection events until Ctrl+C.

mod cli;
mod config;
mod node;

use crate::cli::{Cli, Commands};
use clap::Parser;

fn init_tracing_stderr(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr(cli.json_logs);

    match cli.command {
        Commands::Init { force } => {
            let path = cli.config.unwrap_or_else(config::default_config_path);
            match config::init_config(&path, force) {
                Ok(backup) => {
                    if let Some(backup) = backup {
                        println!("Previous config saved as {}", backup.display());
                    }
                    println!("Wrote {}", path.display());
                }
                Err(e) => {
                    eprintln!("Error: {e:#}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Config => {
            let resolved = config::load_config(cli.config.as_deref());
            for (key, value) in config::describe(&resolved) {
                println!("{key:<34} {value}");
            }
        }
        Commands::Run(args) => {
            let resolved = config::load_config(cli.config.as_deref());
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Failed to create Tokio runtime: {e}");
                    std::process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(node::run(resolved, args)) {
                eprintln!("Error: {e:#}");
                std::process::exit(1);
            }
        }
    }
}
