//! Clap CLI definitions for PeerMesh.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  peermesh init                                  Write ~/.peermesh/config.toml
  peermesh config                                Show the resolved protocol settings
  peermesh run -s sensors --announce-file a.json Sign in and publish this node's contact file
  peermesh run -s sensors --peer a.json          Sign in and connect to the node in a.json
  peermesh run -s sensors --udp                  Find peers by UDP broadcast";

/// PeerMesh: peer-to-peer endpoint node.
#[derive(Parser)]
#[command(name = "peermesh", version, about = "PeerMesh endpoint node", after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default config file.
    Init {
        /// Replace an existing file (the old one is kept as a backup).
        #[arg(long)]
        force: bool,
    },
    /// Print the resolved protocol settings.
    Config,
    /// Sign a node in and print connection events until Ctrl+C.
    Run(RunArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Communication subject this node serves (repeatable).
    #[arg(long = "subject", short = 's', default_value = "default")]
    pub subjects: Vec<String>,

    /// Contact file of a peer to connect to (repeatable).
    #[arg(long = "peer")]
    pub peers: Vec<PathBuf>,

    /// Write this node's contact file here after signing in.
    #[arg(long)]
    pub announce_file: Option<PathBuf>,

    /// Announce and discover peers over UDP broadcast.
    #[arg(long)]
    pub udp: bool,

    /// Also open a local named-pipe channel.
    #[arg(long)]
    pub pipe: bool,
}
