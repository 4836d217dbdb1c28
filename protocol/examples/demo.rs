//! Terminal walkthrough of Omega replication.
//!
//! A writer appends a few blocks, a reader replicates only the ones it asks
//! for, a second reader learns everything from the first, and a forged proof
//! bounces off.
//!
//! Run with:
//!   cargo run --example demo --release

use std::sync::Arc;
use std::time::Instant;

use omega_protocol::crypto::keys::{Authority, Keypair};
use omega_protocol::network::connect;
use omega_protocol::{Error, MemoryStorage, Omega, OmegaOptions, ProofRequest, RangeRequest};

// ---------------------------------------------------------------------------
// ANSI color constants
// ---------------------------------------------------------------------------

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";

// ---------------------------------------------------------------------------
// Display helpers
// ---------------------------------------------------------------------------

fn section(num: u32, title: &str) {
    println!();
    println!("{BOLD}{CYAN}===[{YELLOW} Step {num} {CYAN}]========================================{RESET}");
    println!("{BOLD}{WHITE}  {title}{RESET}");
}

fn success(text: &str) {
    println!("{GREEN}  [OK] {text}{RESET}");
}

fn info(label: &str, value: impl std::fmt::Display) {
    println!("{WHITE}  {BOLD}{label}:{RESET} {YELLOW}{value}{RESET}");
}

fn timing(label: &str, started: Instant) {
    let ms = started.elapsed().as_secs_f64() * 1000.0;
    println!("{DIM}  [{label}: {ms:.2} ms]{RESET}");
}

async fn open(authority: Authority) -> Result<Omega, Error> {
    Omega::open(
        Arc::new(MemoryStorage::new()),
        OmegaOptions::with_authority(authority),
    )
    .await
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Error> {
    println!("{BOLD}{WHITE}OMEGA PROTOCOL  --  verifiable append-only log{RESET}");

    section(1, "Writer appends a poem");
    let keypair = Keypair::generate();
    let public_key = keypair.public_key();
    let writer = open(Authority::Writer(keypair)).await?;
    let lines = [
        "so much depends",
        "upon",
        "a red wheel",
        "barrow",
        "glazed with rain",
        "water",
    ];
    let started = Instant::now();
    writer.append(lines).await?;
    timing("append", started);
    info("length", writer.length());
    info("byte length", writer.byte_length());
    if let Some(key) = writer.discovery_key() {
        info("discovery key", hex::encode(key));
    }

    section(2, "Reader fetches a single block");
    let reader = open(Authority::Reader(public_key)).await?;
    connect(writer.replicate(), reader.replicate());
    let started = Instant::now();
    let block = reader.get(2).await?;
    timing("get(2)", started);
    success(&format!("verified \"{}\"", String::from_utf8_lossy(&block)));
    info("stored locally", reader.info().await?.stored);

    section(3, "Reader resolves a byte offset");
    let (index, offset) = reader.seek(20).await?;
    success(&format!("byte 20 is block {index}, offset {offset}"));

    section(4, "A relay learns everything from the reader");
    reader.download(RangeRequest::new(0, 6)).wait().await?;
    let relay = open(Authority::Reader(public_key)).await?;
    connect(reader.replicate(), relay.replicate());
    let report = relay.download(RangeRequest::linear(0, 6)).wait().await?;
    success(&format!("relay downloaded {} blocks", report.downloaded.len()));
    println!("{DIM}{}{RESET}", relay.info().await?);

    section(5, "A forged block is rejected");
    let mut proof = writer.proof(&ProofRequest::block(3, 0)).await?;
    if let Some(block) = proof.block.as_mut() {
        block.value = Some(b"wheelbarrow".to_vec());
    }
    let stranger = open(Authority::Reader(public_key)).await?;
    match stranger.verify(proof, None).await {
        Err(e) => println!("{RED}  [REJECTED] {e}{RESET}"),
        Ok(()) => println!("{RED}  forged proof accepted?!{RESET}"),
    }
    info("stranger length", stranger.length());

    Ok(())
}
