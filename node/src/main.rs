// Copyright (c) 2026 Omega Contributors. MIT License.
// See LICENSE for details.

//! # Omega Node
//!
//! Entry point for the `omega-node` binary. Every subcommand opens the log
//! under `--dir`:
//!
//! - `init`   creates the directory and, unless `--unsigned`, a writer key
//! - `append` adds blocks
//! - `get`    prints a block, fetching nothing
//! - `info`   prints a summary
//! - `serve`  accepts replication connections and serves the HTTP API
//! - `clone`  pulls a log from a peer, verifying every block
//!
//! ## Key files
//!
//! The directory's key file decides the log's authority. `writer.key` holds
//! a hex secret and makes the log writable; `reader.key` holds the writer's
//! hex public key and makes it a verifying replica. With neither, the log is
//! unsigned.

mod api;
mod cli;
mod logging;
mod metrics;
mod transport;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;

use omega_protocol::{
    Authority, Keypair, Omega, OmegaOptions, PublicKey, RangeRequest, SledStorage,
};

use cli::{Commands, OmegaNodeCli};
use metrics::NodeMetrics;

const WRITER_KEY_FILE: &str = "writer.key";
const READER_KEY_FILE: &str = "reader.key";
const DB_DIR: &str = "db";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = OmegaNodeCli::parse();
    logging::init_logging(
        "omega_node=info,omega_protocol=info,tower_http=debug",
        cli.log_format,
    )
    .context("failed to install logging")?;

    let dir = cli.dir.as_path();
    match cli.command {
        Commands::Init(args) => init_log(dir, args).await,
        Commands::Append(args) => append_blocks(dir, args).await,
        Commands::Get(args) => get_block(dir, args).await,
        Commands::Info => print_info(dir).await,
        Commands::Serve(args) => serve(dir, args).await,
        Commands::Clone(args) => clone_log(dir, args).await,
    }
}

// ---------------------------------------------------------------------------
// Log directory
// ---------------------------------------------------------------------------

fn load_authority(dir: &Path) -> Result<Authority> {
    let writer = dir.join(WRITER_KEY_FILE);
    if writer.exists() {
        let hex = std::fs::read_to_string(&writer)
            .with_context(|| format!("failed to read {}", writer.display()))?;
        let keypair = Keypair::from_hex(hex.trim())
            .with_context(|| format!("invalid writer key in {}", writer.display()))?;
        return Ok(Authority::Writer(keypair));
    }

    let reader = dir.join(READER_KEY_FILE);
    if reader.exists() {
        let hex = std::fs::read_to_string(&reader)
            .with_context(|| format!("failed to read {}", reader.display()))?;
        let public_key = PublicKey::from_hex(hex.trim())
            .with_context(|| format!("invalid public key in {}", reader.display()))?;
        return Ok(Authority::Reader(public_key));
    }

    Ok(Authority::Unsigned)
}

async fn open_log(dir: &Path) -> Result<Omega> {
    let authority = load_authority(dir)?;
    open_with(dir, authority).await
}

async fn open_with(dir: &Path, authority: Authority) -> Result<Omega> {
    let db_path = dir.join(DB_DIR);
    if !db_path.exists() {
        bail!(
            "no log at {} (run `omega-node init` or `omega-node clone` first)",
            dir.display()
        );
    }
    let storage = SledStorage::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let log = Omega::open(Arc::new(storage), OmegaOptions::with_authority(authority))
        .await
        .with_context(|| format!("failed to open log at {}", dir.display()))?;
    tracing::debug!(dir = %dir.display(), length = log.length(), "log opened");
    Ok(log)
}

fn create_dir(dir: &Path) -> Result<()> {
    if dir.join(DB_DIR).exists() {
        bail!("a log already exists at {}", dir.display());
    }
    std::fs::create_dir_all(dir.join(DB_DIR))
        .with_context(|| format!("failed to create {}", dir.display()))
}

fn write_key_file(path: &Path, contents: &str, private: bool) -> Result<()> {
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if private {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    Ok(())
}

// ---------------------------------------------------------------------------
// Local commands
// ---------------------------------------------------------------------------

async fn init_log(dir: &Path, args: cli::InitArgs) -> Result<()> {
    create_dir(dir)?;

    let authority = if args.unsigned {
        Authority::Unsigned
    } else {
        let keypair = Keypair::generate();
        write_key_file(&dir.join(WRITER_KEY_FILE), &keypair.secret_key_hex(), true)?;
        Authority::Writer(keypair)
    };

    let log = open_with(dir, authority).await?;
    tracing::info!(dir = %dir.display(), signed = !args.unsigned, "log initialized");

    println!("Log initialized.");
    println!("  Directory     : {}", dir.display());
    match log.key() {
        Some(key) => {
            println!("  Public key    : {}", key.to_hex());
            if let Some(discovery) = log.discovery_key() {
                println!("  Discovery key : {}", hex::encode(discovery));
            }
        }
        None => println!("  Public key    : (unsigned)"),
    }
    Ok(())
}

async fn append_blocks(dir: &Path, args: cli::AppendArgs) -> Result<()> {
    let blocks = if args.blocks.is_empty() {
        std::io::stdin()
            .lock()
            .lines()
            .collect::<std::io::Result<Vec<String>>>()
            .context("failed to read blocks from stdin")?
    } else {
        args.blocks
    };
    if blocks.is_empty() {
        bail!("nothing to append");
    }

    let log = open_log(dir).await?;
    let count = blocks.len();
    let length = log.append(blocks).await.context("append failed")?;
    tracing::info!(count, length, byte_length = log.byte_length(), "blocks appended");
    println!("{}", length);
    Ok(())
}

async fn get_block(dir: &Path, args: cli::GetArgs) -> Result<()> {
    let log = open_log(dir).await?;
    // No peers are connected here, so only stored blocks can be printed.
    if !log.has(args.index).await? {
        bail!(
            "block {} is not stored locally (log length {})",
            args.index,
            log.length()
        );
    }
    let block = log.get(args.index).await?;
    if args.hex {
        println!("{}", hex::encode(&block));
    } else {
        println!("{}", String::from_utf8_lossy(&block));
    }
    Ok(())
}

async fn print_info(dir: &Path) -> Result<()> {
    let log = open_log(dir).await?;
    println!("{}", log.info().await?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Networked commands
// ---------------------------------------------------------------------------

async fn serve(dir: &Path, args: cli::ServeArgs) -> Result<()> {
    let log = open_log(dir).await?;
    let metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    metrics.log_length.set(log.length() as i64);
    metrics.log_byte_length.set(log.byte_length() as i64);

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind replication listener on {}", args.listen))?;
    tracing::info!(addr = %args.listen, length = log.length(), "replication listening");

    let api_listener = TcpListener::bind(args.api)
        .await
        .with_context(|| format!("failed to bind API listener on {}", args.api))?;
    tracing::info!(addr = %args.api, "API server listening");

    let router = api::create_router(api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        log: log.clone(),
        metrics: Arc::clone(&metrics),
    });

    let mut events = log.subscribe();
    let metrics_ref = Arc::clone(&metrics);
    let event_loop = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => metrics_ref.observe(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "metrics fell behind the event stream");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let accept_log = log.clone();
    let accept_metrics = Arc::clone(&metrics);
    let accept_loop = async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let session = accept_log.replicate();
            let metrics = Arc::clone(&accept_metrics);
            tokio::spawn(async move {
                metrics.connected_peers.inc();
                tracing::info!(%addr, "peer connected");
                if let Err(e) = transport::run(stream, session).await {
                    tracing::debug!(%addr, error = %e, "connection closed with error");
                }
                metrics.connected_peers.dec();
                tracing::info!(%addr, "peer disconnected");
            });
        }
    };

    tokio::select! {
        res = axum::serve(api_listener, router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        _ = accept_loop => {}
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    event_loop.abort();
    tracing::info!("omega-node stopped");
    Ok(())
}

async fn clone_log(dir: &Path, args: cli::CloneArgs) -> Result<()> {
    let authority = match &args.key {
        Some(hex) => {
            Authority::Reader(PublicKey::from_hex(hex.trim()).context("invalid --key")?)
        }
        None => Authority::Unsigned,
    };

    let fresh = !dir.join(DB_DIR).exists();
    if fresh {
        create_dir(dir)?;
        if let Authority::Reader(public_key) = &authority {
            write_key_file(&dir.join(READER_KEY_FILE), &public_key.to_hex(), false)?;
        }
    }
    let log = if fresh {
        open_with(dir, authority).await?
    } else {
        open_log(dir).await?
    };

    let stream = TcpStream::connect(args.peer)
        .await
        .with_context(|| format!("failed to connect to {}", args.peer))?;
    tracing::info!(peer = %args.peer, "connected");
    let session = log.replicate();
    let connection = tokio::spawn(async move {
        if let Err(e) = transport::run(stream, session).await {
            tracing::warn!(error = %e, "connection closed with error");
        }
    });

    let grew = log.update().await.context("failed to fetch the peer's tree")?;
    tracing::info!(grew, length = log.length(), "tree updated");

    let range = RangeRequest {
        linear: args.linear,
        ..RangeRequest::new(0, log.length())
    };
    let report = log.download(range).wait().await?;
    connection.abort();

    for (index, error) in &report.failed {
        tracing::error!(index, error = %error, "block failed");
    }
    println!(
        "Cloned {} of {} blocks ({} failed).",
        report.downloaded.len(),
        log.length(),
        report.failed.len()
    );
    if !report.is_complete() {
        bail!("{} blocks could not be downloaded", report.failed.len());
    }
    Ok(())
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// If a handler can't be installed, that branch never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
