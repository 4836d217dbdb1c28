//! # CLI Interface
//!
//! Command-line arguments for `omega-node`, via `clap` derive. Every
//! subcommand works on the log stored under `--dir`.

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Omega log node.
///
/// Creates, appends to and inspects a local log, serves it to peers over
/// TCP, and clones logs from other nodes, verifying every block on the way
/// in.
#[derive(Parser, Debug)]
#[command(
    name = "omega-node",
    about = "Omega verifiable log node",
    version,
    propagate_version = true
)]
pub struct OmegaNodeCli {
    /// Directory holding the log and its keys.
    #[arg(long, short = 'd', env = "OMEGA_DIR", default_value = ".omega", global = true)]
    pub dir: PathBuf,

    /// How log lines are rendered.
    #[arg(
        long,
        value_enum,
        env = "OMEGA_LOG_FORMAT",
        default_value = "pretty",
        global = true
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new writable log and its signing key.
    Init(InitArgs),
    /// Append blocks. Each argument becomes one block; without arguments,
    /// each line of stdin does.
    Append(AppendArgs),
    /// Print one block.
    Get(GetArgs),
    /// Print a summary of the log.
    Info,
    /// Serve the log to peers and expose status and metrics over HTTP.
    Serve(ServeArgs),
    /// Replicate a log from a peer into `--dir`.
    Clone(CloneArgs),
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Skip key generation. Anyone holding a copy can extend an unsigned
    /// log, so only use this for local experiments.
    #[arg(long)]
    pub unsigned: bool,
}

#[derive(Args, Debug)]
pub struct AppendArgs {
    pub blocks: Vec<String>,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    pub index: u64,

    /// Print the block as hex instead of (lossy) UTF-8.
    #[arg(long)]
    pub hex: bool,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address for replication connections.
    #[arg(long, env = "OMEGA_LISTEN", default_value = "127.0.0.1:7400")]
    pub listen: SocketAddr,

    /// Address for the HTTP status and metrics API.
    #[arg(long, env = "OMEGA_API", default_value = "127.0.0.1:7401")]
    pub api: SocketAddr,
}

#[derive(Args, Debug)]
pub struct CloneArgs {
    /// Replication address of the node to clone from.
    pub peer: SocketAddr,

    /// Hex public key of the log's writer. Without it the clone trusts
    /// whatever tree the peer serves.
    #[arg(long, env = "OMEGA_KEY")]
    pub key: Option<String>,

    /// Fetch blocks in index order instead of in parallel.
    #[arg(long)]
    pub linear: bool,
}
