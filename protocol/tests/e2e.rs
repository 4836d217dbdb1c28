//! End-to-end tests for the Omega protocol.
//!
//! These wire whole logs together over in-process streams and check the
//! properties that matter to applications: appends are readable at once,
//! replicas fetch exactly what they ask for, bad data never lands, and
//! everything survives a restart.
//!
//! Each test builds its own logs on fresh storage. No shared state.

use std::sync::Arc;
use std::time::Duration;

use omega_protocol::crypto::keys::{Authority, Keypair};
use omega_protocol::network::connect;
use omega_protocol::{
    Error, Event, FileStorage, MemoryStorage, Omega, OmegaOptions, ProofRequest, RangeRequest,
    ReplicatorConfig, SledStorage, Storage, Target,
};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn memory() -> Arc<dyn Storage> {
    Arc::new(MemoryStorage::new())
}

async fn log_with(options: OmegaOptions) -> Omega {
    Omega::open(memory(), options).await.expect("open log")
}

async fn log() -> Omega {
    log_with(OmegaOptions::default()).await
}

/// Options with short network timeouts, for tests that expect failure.
fn impatient(authority: Authority) -> OmegaOptions {
    OmegaOptions {
        authority,
        replicator: ReplicatorConfig {
            request_timeout_ms: 500,
            availability_timeout_ms: 500,
            max_attempts: 2,
            ..ReplicatorConfig::default()
        },
        ..OmegaOptions::default()
    }
}

/// Wait until `log` has at least `peers` open sessions.
async fn until_connected(log: &Omega, peers: usize) {
    while log.peer_count() < peers {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// 1. Local Append
// ---------------------------------------------------------------------------

#[tokio::test]
async fn append_then_read_locally() {
    let log = log().await;
    log.append(["a", "b", "c"]).await.unwrap();

    assert_eq!(log.length(), 3);
    assert_eq!(log.byte_length(), 3);
    for index in 0..3 {
        assert!(log.has(index).await.unwrap());
    }
    assert_eq!(log.get(1).await.unwrap(), b"b");
    assert_eq!(log.requests_sent(), 0);
}

#[tokio::test]
async fn lengths_track_every_append() {
    let log = log().await;
    let blocks: Vec<Vec<u8>> = (0..37).map(|i| vec![b'x'; i % 7 + 1]).collect();
    let total: usize = blocks.iter().map(Vec::len).sum();

    for chunk in blocks.chunks(5) {
        log.append(chunk).await.unwrap();
    }
    assert_eq!(log.length(), blocks.len() as u64);
    assert_eq!(log.byte_length(), total as u64);
    for (index, block) in blocks.iter().enumerate() {
        assert_eq!(&log.get(index as u64).await.unwrap(), block);
    }
}

// ---------------------------------------------------------------------------
// 2. Proof Round Trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn proof_from_one_log_verifies_on_another() {
    let source = log().await;
    source.append(["a", "b"]).await.unwrap();

    let replica = log().await;
    let proof = source.proof(&ProofRequest::block(1, 0)).await.unwrap();
    replica.verify(proof, None).await.unwrap();

    assert_eq!(replica.length(), 2);
    assert_eq!(replica.byte_length(), source.byte_length());
    assert_eq!(replica.get(1).await.unwrap(), b"b");
    assert!(!replica.has(0).await.unwrap());
}

#[tokio::test]
async fn tampered_proof_changes_nothing() {
    let source = log().await;
    source.append(["a", "b", "c", "d"]).await.unwrap();
    let good = source.proof(&ProofRequest::block(1, 0)).await.unwrap();

    let sibling_count = good.block.as_ref().unwrap().nodes.len();
    for position in 0..sibling_count {
        let mut bad = good.clone();
        bad.block.as_mut().unwrap().nodes[position].hash[0] ^= 0xff;

        let replica = log().await;
        let err = replica.verify(bad, None).await.unwrap_err();
        assert!(matches!(err, Error::VerificationFailed(_)), "{err}");
        assert_eq!(replica.length(), 0);
        assert_eq!(replica.byte_length(), 0);
        assert!(!replica.has(1).await.unwrap());
    }
}

// ---------------------------------------------------------------------------
// 3. Replication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_download_arrives_in_order() {
    let source = log().await;
    source.append(["a", "b", "c"]).await.unwrap();
    let replica = log().await;
    let mut events = replica.subscribe();
    connect(source.replicate(), replica.replicate());

    let report = replica
        .download(RangeRequest::linear(0, 3))
        .wait()
        .await
        .unwrap();
    assert_eq!(report.downloaded, vec![0, 1, 2]);
    assert!(report.is_complete());

    let mut order = Vec::new();
    while order.len() < 3 {
        if let Event::Download { index, value, .. } = events.recv().await.unwrap() {
            assert_eq!(value, [b"a", b"b", b"c"][index as usize]);
            order.push(index);
        }
    }
    assert_eq!(order, vec![0, 1, 2]);
}

#[tokio::test]
async fn concurrent_gets_send_one_request() {
    let source = log().await;
    source
        .append((0..10u8).map(|i| vec![i; 4]))
        .await
        .unwrap();
    let replica = log().await;
    connect(source.replicate(), replica.replicate());

    let (a, b) = tokio::join!(replica.get(5), replica.get(5));
    assert_eq!(a.unwrap(), vec![5u8; 4]);
    assert_eq!(b.unwrap(), vec![5u8; 4]);
    assert_eq!(replica.requests_sent(), 1);
}

#[tokio::test]
async fn get_waits_for_a_block_that_does_not_exist_yet() {
    let source = log().await;
    source.append(["a", "b", "c"]).await.unwrap();
    let replica = log().await;
    connect(source.replicate(), replica.replicate());
    assert_eq!(replica.get(0).await.unwrap(), b"a");

    let pending = tokio::spawn({
        let replica = replica.clone();
        async move { replica.get(3).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    source.append(["d"]).await.unwrap();

    assert_eq!(pending.await.unwrap().unwrap(), b"d");
    assert_eq!(replica.length(), 4);
}

#[tokio::test]
async fn range_fans_out_across_peers() {
    let origin = log().await;
    let blocks: Vec<String> = (0..40).map(|i| format!("block-{i}")).collect();
    origin.append(&blocks).await.unwrap();

    let mirror = log().await;
    connect(origin.replicate(), mirror.replicate());
    let report = mirror
        .download(RangeRequest::new(0, 40))
        .wait()
        .await
        .unwrap();
    assert!(report.is_complete());

    let reader = log().await;
    connect(origin.replicate(), reader.replicate());
    connect(mirror.replicate(), reader.replicate());
    until_connected(&reader, 2).await;

    let mut report = reader
        .download(RangeRequest::new(0, 40))
        .wait()
        .await
        .unwrap();
    assert!(report.is_complete(), "{:?}", report.failed);
    report.downloaded.sort_unstable();
    assert_eq!(report.downloaded, (0..40).collect::<Vec<_>>());
    for (index, block) in blocks.iter().enumerate() {
        assert_eq!(reader.get(index as u64).await.unwrap(), block.as_bytes());
    }
}

#[tokio::test]
async fn seek_fetches_missing_nodes() {
    let source = log().await;
    source.append(["hello", "world", "!"]).await.unwrap();
    let replica = log().await;
    connect(source.replicate(), replica.replicate());
    until_connected(&replica, 1).await;

    assert_eq!(replica.seek(7).await.unwrap(), (1, 2));
    assert_eq!(replica.length(), 3);
    assert_eq!(replica.seek(10).await.unwrap(), (2, 0));
    assert!(matches!(
        replica.seek(11).await,
        Err(Error::OutOfBounds(11))
    ));
    // Seeking proves tree nodes, not payloads.
    assert!(!replica.has(1).await.unwrap());
}

#[tokio::test]
async fn update_pulls_the_longest_tree() {
    let source = log().await;
    source.append(["a", "b", "c", "d", "e"]).await.unwrap();
    let replica = log().await;
    connect(source.replicate(), replica.replicate());
    until_connected(&replica, 1).await;

    assert!(replica.update().await.unwrap());
    assert_eq!(replica.length(), 5);
    assert_eq!(replica.byte_length(), 5);
    assert!(!replica.update().await.unwrap());
}

// ---------------------------------------------------------------------------
// 4. Signed Logs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn signed_log_replicates_to_readers() {
    let keypair = Keypair::generate();
    let public_key = keypair.public_key();
    let writer = log_with(OmegaOptions::with_authority(Authority::Writer(keypair))).await;
    writer.append(["x", "y", "z"]).await.unwrap();

    let reader = log_with(OmegaOptions::with_authority(Authority::Reader(public_key))).await;
    connect(writer.replicate(), reader.replicate());
    assert_eq!(reader.get(2).await.unwrap(), b"z");
    assert_eq!(reader.discovery_key(), writer.discovery_key());

    // A second reader that only ever talks to the first one.
    let relay = log_with(OmegaOptions::with_authority(Authority::Reader(public_key))).await;
    connect(reader.replicate(), relay.replicate());
    assert_eq!(relay.get(2).await.unwrap(), b"z");
    assert!(relay.info().await.unwrap().signed);
}

#[tokio::test]
async fn reader_of_another_key_rejects_the_tree() {
    let writer = log_with(OmegaOptions::with_authority(Authority::Writer(
        Keypair::generate(),
    )))
    .await;
    writer.append(["x", "y"]).await.unwrap();

    let stranger = Keypair::generate().public_key();
    let reader = log_with(impatient(Authority::Reader(stranger))).await;
    connect(writer.replicate(), reader.replicate());

    let err = reader.get(0).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Unavailable {
            target: Target::Block(0),
            ..
        }
    ));
    assert_eq!(reader.length(), 0);
}

// ---------------------------------------------------------------------------
// 5. Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn file_backed_log_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let keypair = Keypair::from_seed(&[9u8; 32]);
    {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path()));
        let log = Omega::open(
            storage,
            OmegaOptions::with_authority(Authority::Writer(keypair.clone())),
        )
        .await
        .unwrap();
        log.append(["first", "second"]).await.unwrap();
        log.append(["third"]).await.unwrap();
    }

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path()));
    let log = Omega::open(storage, OmegaOptions::with_authority(Authority::Writer(keypair)))
        .await
        .unwrap();
    assert_eq!(log.length(), 3);
    assert_eq!(log.byte_length(), 16);
    assert_eq!(log.get(1).await.unwrap(), b"second");
    assert_eq!(log.append(["fourth"]).await.unwrap(), 4);
}

#[tokio::test]
async fn sparse_replica_survives_reopen() {
    let source = log().await;
    source.append(["a", "b", "c", "d"]).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    {
        let storage: Arc<dyn Storage> = Arc::new(SledStorage::open(dir.path()).unwrap());
        let replica = Omega::open(storage, OmegaOptions::default()).await.unwrap();
        connect(source.replicate(), replica.replicate());
        assert_eq!(replica.get(2).await.unwrap(), b"c");
    }
    // Give the dropped sessions a moment to release the database.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let storage: Arc<dyn Storage> = Arc::new(SledStorage::open(dir.path()).unwrap());
    let replica = Omega::open(storage, impatient(Authority::Unsigned))
        .await
        .unwrap();
    assert_eq!(replica.length(), 4);
    assert!(replica.has(2).await.unwrap());
    assert!(!replica.has(1).await.unwrap());
    assert_eq!(replica.get(2).await.unwrap(), b"c");
    assert!(matches!(
        replica.get(1).await,
        Err(Error::NoPeer(Target::Block(1)))
    ));
}

#[tokio::test]
async fn corrupt_header_is_rejected() {
    let storage = MemoryStorage::new();
    let log = Omega::open(Arc::new(storage.clone()), OmegaOptions::default())
        .await
        .unwrap();
    log.append(["a"]).await.unwrap();
    drop(log);

    storage.poke("tree", 0, b"XXXX");
    let reopened = Omega::new(Arc::new(storage), OmegaOptions::default());
    assert!(matches!(reopened.ready().await, Err(Error::Corrupt(_))));
}
