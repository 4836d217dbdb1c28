// Copyright (c) 2026 Omega Contributors. MIT License.
// See LICENSE for details.

//! # Omega Protocol - Core Library
//!
//! A verifiable append-only log that peers can replicate partially. Anyone
//! can ask anyone else for a block or a byte range and check the answer
//! against a Merkle root before trusting a single byte of it. No peer has to
//! be honest, and nobody has to download the whole log.
//!
//! ## Architecture
//!
//! - **tree** - Merkle tree over the block sequence. Proofs, staged batches,
//!   byte-offset seeking.
//! - **block_store** - Raw payloads at offsets the tree computes.
//! - **bitfield** - Which blocks are verified and stored here.
//! - **network** - The replication protocol: sessions, requests, retries.
//! - **omega** - The facade tying the above together under one lock.
//! - **storage** - Byte-addressed backends: memory, files, sled.
//! - **crypto** - BLAKE3 hashing and Ed25519 tree signatures.
//! - **config** - Layout constants and tunables.
//!
//! ## Design Philosophy
//!
//! 1. Verify before you store. A proof that doesn't hash up to a trusted root
//!    changes nothing.
//! 2. The disk is the source of truth. Bits are set only after the bytes
//!    they vouch for are durable.
//! 3. The network is hostile and flaky. Every request has a timeout and
//!    every failure has another peer to try.

pub mod bitfield;
pub mod block_store;
pub mod config;
pub mod crypto;
pub mod error;
pub mod inspect;
pub mod network;
pub mod omega;
pub mod storage;
pub mod tree;

pub use config::{OmegaOptions, ReplicatorConfig};
pub use crypto::{Authority, Keypair, PublicKey};
pub use error::{Error, Result, Target};
pub use inspect::LogInfo;
pub use network::{connect, Download, DownloadReport, Message, ProtocolStream, RangeRequest};
pub use omega::{Event, Omega};
pub use storage::{FileStorage, MemoryStorage, SledStorage, Storage};
pub use tree::{Proof, ProofRequest};
