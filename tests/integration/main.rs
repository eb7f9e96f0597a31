//! RAID-PIR integration test harness.
//!
//! Everything runs in-process: mirrors and the vendor are spawned as tokio
//! tasks on ephemeral loopback ports and the client library talks to them
//! over real TCP. No privileges or external fixtures are needed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::net::{TcpListener, TcpStream};

use raidpir_client::{build_plan, retrieve_blocks, RequestorError};
use raidpir_core::hashes::HashSpec;
use raidpir_core::manifest::{create_manifest, Manifest};
use raidpir_core::params::SessionParams;
use raidpir_core::wire::{self, MirrorInfo, MirrorRequest};
use raidpir_core::fetch;
use raidpir_mirror::MirrorService;
use raidpir_store::populate::populate_from_files;
use raidpir_store::XorDatastore;
use raidpir_vendor::{MirrorRegistry, VendorService};

// ── Fixtures ──────────────────────────────────────────────────────────────────

/// A release directory with one patterned data file, and its manifest.
struct Release {
    dir: tempfile::TempDir,
    manifest: Arc<Manifest>,
    content: Vec<u8>,
}

impl Release {
    /// `num_blocks` blocks of `block_size` bytes of seeded pseudorandom data.
    fn new(block_size: usize, num_blocks: usize, seed: u64) -> Self {
        let mut content = vec![0u8; block_size * num_blocks];
        StdRng::seed_from_u64(seed).fill_bytes(&mut content);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.bin"), &content).unwrap();
        let spec: HashSpec = "sha256-raw".parse().unwrap();
        let manifest =
            create_manifest(dir.path(), spec, block_size, "127.0.0.1", 62293).unwrap();
        assert_eq!(manifest.block_count, num_blocks);
        Self {
            dir,
            manifest: Arc::new(manifest),
            content,
        }
    }

    fn files_dir(&self) -> &Path {
        self.dir.path()
    }

    fn block(&self, blocknum: usize) -> &[u8] {
        let block_size = self.manifest.block_size;
        &self.content[blocknum * block_size..(blocknum + 1) * block_size]
    }

    fn datastore(&self, precompute: bool) -> XorDatastore {
        let mut store =
            XorDatastore::new_ram(self.manifest.block_size, self.manifest.block_count).unwrap();
        populate_from_files(&self.manifest, &mut store, self.files_dir()).unwrap();
        if precompute {
            store.finalize();
        }
        store
    }
}

/// Spawn a mirror service on an ephemeral loopback port.
async fn start_mirror(release: &Release, precompute: bool) -> MirrorInfo {
    let store = release.datastore(precompute);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(MirrorService::new(store).serve(listener));
    MirrorInfo {
        ip: "127.0.0.1".to_string(),
        port,
    }
}

/// A mirror that accepts connections and immediately drops them.
async fn start_dead_mirror() -> MirrorInfo {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => drop(stream),
                Err(_) => return,
            }
        }
    });
    MirrorInfo {
        ip: "127.0.0.1".to_string(),
        port,
    }
}

/// Spawn a vendor on an ephemeral loopback port.
async fn start_vendor(raw_manifest: Vec<u8>, expiry: Duration) -> (String, Arc<VendorService>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let service = VendorService::new(raw_manifest, MirrorRegistry::new(expiry), 10240, false);
    tokio::spawn(service.clone().serve(listener));
    (format!("127.0.0.1:{port}"), service)
}

/// Retrieve `blocks` with the given scheme and check them against the
/// release contents.
async fn retrieve_and_check(
    release: &Release,
    mirrors: Vec<MirrorInfo>,
    blocks: &[usize],
    k: usize,
    redundancy: Option<usize>,
    rng_expand: bool,
    parallel: bool,
    batch: bool,
) {
    let plan = build_plan(
        blocks,
        release.manifest.block_count,
        k,
        redundancy,
        rng_expand,
        parallel,
        batch,
        &mut rand::thread_rng(),
    )
    .unwrap();
    let retrieved = retrieve_blocks(plan, release.manifest.clone(), mirrors)
        .await
        .unwrap();
    assert_eq!(retrieved.len(), blocks.len());
    for &blocknum in blocks {
        assert_eq!(
            retrieved[&blocknum],
            release.block(blocknum),
            "block {blocknum} mismatch"
        );
    }
}

// ══════════════════════════════════════════════════════════════════════════════
//  End-to-end retrieval across the query schemes
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn chor_retrieval_end_to_end() {
    let release = Release::new(64, 100, 1);
    let mut mirrors = Vec::new();
    for _ in 0..3 {
        mirrors.push(start_mirror(&release, false).await);
    }
    retrieve_and_check(&release, mirrors, &[0, 57, 99], 3, None, false, false, false).await;
}

#[tokio::test]
async fn chunked_retrieval_end_to_end() {
    let release = Release::new(64, 400, 2);
    let mut mirrors = Vec::new();
    for _ in 0..4 {
        mirrors.push(start_mirror(&release, false).await);
    }
    retrieve_and_check(
        &release,
        mirrors,
        &[0, 95, 96, 200, 399],
        4,
        Some(2),
        false,
        false,
        false,
    )
    .await;
}

#[tokio::test]
async fn chunked_rng_retrieval_end_to_end() {
    // k=4, r=2, seed expansion: the S4 configuration
    let release = Release::new(256, 400, 3);
    let mut mirrors = Vec::new();
    for _ in 0..4 {
        mirrors.push(start_mirror(&release, false).await);
    }
    retrieve_and_check(
        &release,
        mirrors,
        &[150, 0, 399],
        4,
        Some(2),
        true,
        false,
        false,
    )
    .await;
}

#[tokio::test]
async fn parallel_retrieval_one_round_trip() {
    // S5: k=2, r=2, parallel; blocks 10 and 250 fall in different chunks,
    // so a single round answers both
    let release = Release::new(256, 400, 4);
    let mirrors = vec![
        start_mirror(&release, false).await,
        start_mirror(&release, false).await,
    ];
    let plan = build_plan(
        &[10, 250],
        400,
        2,
        Some(2),
        true,
        true,
        false,
        &mut rand::thread_rng(),
    )
    .unwrap();
    assert_eq!(plan.slot_queries[0].len(), 1, "one round expected");
    let retrieved = retrieve_blocks(plan, release.manifest.clone(), mirrors)
        .await
        .unwrap();
    assert_eq!(retrieved[&10], release.block(10));
    assert_eq!(retrieved[&250], release.block(250));
}

#[tokio::test]
async fn precomputed_mirrors_answer_identically() {
    let release = Release::new(64, 120, 5);
    // one mirror with the four-Russians table, one without
    let mirrors = vec![
        start_mirror(&release, true).await,
        start_mirror(&release, false).await,
    ];
    retrieve_and_check(&release, mirrors, &[7, 64, 119], 2, None, false, false, false).await;
}

#[tokio::test]
async fn file_reconstruction_via_vendor_discovery() {
    // the full client flow: manifest and mirror list from the vendor, then
    // private retrieval and file extraction
    let release = Release::new(64, 100, 6);
    let raw_manifest = release.manifest.to_bytes().unwrap();
    let (vendor, _service) = start_vendor(raw_manifest.clone(), Duration::from_secs(300)).await;

    for _ in 0..2 {
        let mirror = start_mirror(&release, false).await;
        fetch::advertise_mirror(&vendor, 62293, &mirror).await.unwrap();
    }

    let fetched = fetch::retrieve_raw_manifest(&vendor, 62293).await.unwrap();
    assert_eq!(fetched.as_ref(), &raw_manifest[..]);
    let manifest = Arc::new(Manifest::parse(&fetched).unwrap());

    let mirrors = fetch::retrieve_mirror_list(&vendor, 62293).await.unwrap();
    assert_eq!(mirrors.len(), 2);

    let needed = manifest.blocks_for_file("blob.bin").unwrap();
    let plan = build_plan(
        &needed,
        manifest.block_count,
        2,
        None,
        false,
        false,
        false,
        &mut rand::thread_rng(),
    )
    .unwrap();
    let blocks: HashMap<usize, Vec<u8>> =
        retrieve_blocks(plan, manifest.clone(), mirrors).await.unwrap();
    let data = manifest.extract_file("blob.bin", &blocks).unwrap();
    assert_eq!(data, release.content);
    let info = manifest.file_info("blob.bin").unwrap();
    assert!(manifest.hash_algorithm.verify(&data, &info.hash));
}

// ══════════════════════════════════════════════════════════════════════════════
//  Batch mode
// ══════════════════════════════════════════════════════════════════════════════

/// Drive one raw session: handshake, pipeline all queries, read all replies.
async fn drive_session(
    mirror: &MirrorInfo,
    params: SessionParams,
    queries: &[MirrorRequest],
) -> Vec<Vec<u8>> {
    let mut stream = TcpStream::connect((mirror.ip.as_str(), mirror.port))
        .await
        .unwrap();
    wire::send_message(
        &mut stream,
        &MirrorRequest::Params(params).encode().unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(
        wire::recv_message(&mut stream).await.unwrap().as_ref(),
        wire::PARAMS_OK
    );
    for query in queries {
        wire::send_message(&mut stream, &query.encode().unwrap())
            .await
            .unwrap();
    }
    let mut replies = Vec::with_capacity(queries.len());
    for _ in 0..queries.len() {
        replies.push(wire::recv_message(&mut stream).await.unwrap().to_vec());
    }
    wire::send_message(&mut stream, &MirrorRequest::Quit.encode().unwrap())
        .await
        .unwrap();
    replies
}

#[tokio::test]
async fn batch_replies_equal_serial_replies() {
    let release = Release::new(64, 100, 7);
    let mirror = start_mirror(&release, false).await;

    let mut rng = StdRng::seed_from_u64(99);
    let queries: Vec<MirrorRequest> = (0..20)
        .map(|_| {
            let mut mask = vec![0u8; 13];
            rng.fill_bytes(&mut mask);
            MirrorRequest::FullBitstring(mask)
        })
        .collect();

    let serial = drive_session(&mirror, SessionParams::chor(2, false), &queries).await;
    let batched = drive_session(&mirror, SessionParams::chor(2, true), &queries).await;
    assert_eq!(serial, batched, "batch mode must not change any reply");
}

#[tokio::test]
async fn batched_parallel_retrieval() {
    let release = Release::new(256, 400, 8);
    let mirrors = vec![
        start_mirror(&release, false).await,
        start_mirror(&release, false).await,
    ];
    // several rounds, replies deferred through the batch task
    retrieve_and_check(
        &release,
        mirrors,
        &[10, 11, 250, 251],
        2,
        Some(2),
        true,
        true,
        true,
    )
    .await;
}

#[tokio::test]
async fn batched_chor_retrieval() {
    let release = Release::new(64, 100, 9);
    let mirrors = vec![
        start_mirror(&release, false).await,
        start_mirror(&release, false).await,
    ];
    retrieve_and_check(&release, mirrors, &[1, 2, 3, 50, 99], 2, None, false, false, true).await;
}

// ══════════════════════════════════════════════════════════════════════════════
//  Privacy and query algebra
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn chor_query_sum_and_marginal_uniformity() {
    // S3: N=100, k=3, target 57. The three bitstrings always XOR to e_57,
    // and each observed position of any single mirror's bitstring is
    // unbiased across samples.
    const SAMPLES: usize = 10_000;
    let mut rng = StdRng::seed_from_u64(0x57);
    let mut expected = vec![0u8; 13];
    raidpir_core::bits::set_bit(&mut expected, 57, true);

    let mut counts = [[0u32; 100]; 2];
    for _ in 0..SAMPLES {
        let plan = build_plan(&[57], 100, 3, None, false, false, false, &mut rng).unwrap();
        let mut acc = vec![0u8; 13];
        for slot in 0..3 {
            let MirrorRequest::FullBitstring(mask) = &plan.slot_queries[slot][0] else {
                panic!("chor plans carry full bitstrings");
            };
            raidpir_core::bits::xor_into(&mut acc, mask);
            if slot < 2 {
                for (bit, count) in counts[slot].iter_mut().enumerate() {
                    if raidpir_core::bits::get_bit(mask, bit) {
                        *count += 1;
                    }
                }
            }
        }
        assert_eq!(acc, expected);
    }

    // per-position chi-square against the fair coin, df = 1. The bound sits
    // near five standard deviations so 200 positions stay comfortably clear
    // of it under the null hypothesis.
    let expected_count = SAMPLES as f64 / 2.0;
    for (slot, slot_counts) in counts.iter().enumerate() {
        for (bit, &count) in slot_counts.iter().enumerate() {
            let observed = count as f64;
            let chi2 = (observed - expected_count).powi(2) / expected_count
                + ((SAMPLES as f64 - observed) - expected_count).powi(2) / expected_count;
            assert!(
                chi2 < 25.0,
                "slot {slot} bit {bit}: chi-square {chi2:.2} (count {count})"
            );
        }
    }
}

#[tokio::test]
async fn rng_payload_shape_matches_s4() {
    // S4: k=4, r=2, seed expansion, 400 blocks. Each mirror's request
    // payload is exactly one primary chunk of the expected length, plus the
    // seed carried once in the session parameters.
    let mut rng = StdRng::seed_from_u64(4);
    let plan = build_plan(&[150], 400, 4, Some(2), true, false, false, &mut rng).unwrap();
    let geometry = plan.geometry.unwrap();
    assert_eq!(geometry.chunk_bits, 96);

    for slot in 0..4 {
        let params = &plan.slot_params[slot];
        assert_eq!(params.s.map(|s| s.len()), Some(16));
        let MirrorRequest::ChunkedRng(chunks) = &plan.slot_queries[slot][0] else {
            panic!("rng plans carry ChunkedRng requests");
        };
        assert_eq!(chunks.len(), 1);
        let primary = params.cn[0];
        assert_eq!(
            chunks[&primary].len(),
            geometry.bytes_of(primary as usize)
        );
    }
}

// ══════════════════════════════════════════════════════════════════════════════
//  Vendor registry
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn mirror_expiry_and_extension() {
    // S6 with timings scaled to milliseconds: advertise, still listed
    // before expiry, extended by a re-advertisement, gone after silence
    let (vendor, _service) = start_vendor(b"m".to_vec(), Duration::from_millis(300)).await;
    let mirror = MirrorInfo {
        ip: "127.0.0.1".to_string(),
        port: 62294,
    };

    fetch::advertise_mirror(&vendor, 62293, &mirror).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fetch::retrieve_mirror_list(&vendor, 62293).await.unwrap().len(), 1);

    // re-advertise: the entry's clock restarts
    fetch::advertise_mirror(&vendor, 62293, &mirror).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fetch::retrieve_mirror_list(&vendor, 62293).await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fetch::retrieve_mirror_list(&vendor, 62293).await.unwrap().is_empty());
}

#[tokio::test]
async fn vendor_answers_hello() {
    let (vendor, _service) = start_vendor(b"m".to_vec(), Duration::from_secs(300)).await;
    let reply = fetch::vendor_query(
        &vendor,
        62293,
        &raidpir_core::wire::VendorRequest::Hello,
    )
    .await
    .unwrap();
    assert_eq!(reply.as_ref(), b"VENDORHI!");
}

// ══════════════════════════════════════════════════════════════════════════════
//  Failure handling
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn failover_replaces_dead_mirrors() {
    // two dead mirrors in a pool of four: whichever the random pick lands
    // on, the backups absorb the failures and retrieval still succeeds
    let release = Release::new(64, 100, 10);
    let mirrors = vec![
        start_dead_mirror().await,
        start_mirror(&release, false).await,
        start_dead_mirror().await,
        start_mirror(&release, false).await,
    ];
    retrieve_and_check(&release, mirrors, &[3, 42], 2, None, false, false, false).await;
}

#[tokio::test]
async fn all_mirrors_dead_is_insufficient() {
    let release = Release::new(64, 100, 11);
    let mirrors = vec![
        start_dead_mirror().await,
        start_dead_mirror().await,
        start_dead_mirror().await,
    ];
    let plan = build_plan(&[5], 100, 2, None, false, false, false, &mut rand::thread_rng())
        .unwrap();
    let result = retrieve_blocks(plan, release.manifest.clone(), mirrors).await;
    assert!(matches!(
        result,
        Err(RequestorError::InsufficientMirrors { .. })
    ));
}

#[tokio::test]
async fn corrupt_mirror_is_an_integrity_failure() {
    // a mirror serving different data makes block hashes fail: fatal, not
    // silently retried
    let good = Release::new(64, 100, 12);
    let evil = Release::new(64, 100, 13);
    let mirrors = vec![
        start_mirror(&good, false).await,
        start_mirror(&evil, false).await,
    ];
    let plan = build_plan(&[5], 100, 2, None, false, false, false, &mut rand::thread_rng())
        .unwrap();
    let result = retrieve_blocks(plan, good.manifest.clone(), mirrors).await;
    assert!(matches!(
        result,
        Err(RequestorError::BlockHashMismatch(5))
    ));
}

#[tokio::test]
async fn protocol_error_only_kills_the_offending_session() {
    let release = Release::new(64, 100, 14);
    let mirror = start_mirror(&release, false).await;

    // a garbage first message gets an error string and a closed session
    let mut bad = TcpStream::connect((mirror.ip.as_str(), mirror.port))
        .await
        .unwrap();
    wire::send_message(&mut bad, b"NONSENSE").await.unwrap();
    let reply = wire::recv_message(&mut bad).await.unwrap();
    assert!(reply.starts_with(b"Invalid request type"));
    assert!(matches!(
        wire::recv_message(&mut bad).await,
        Err(wire::WireError::PeerClosed)
    ));

    // the mirror still serves fresh sessions
    let replies = drive_session(
        &mirror,
        SessionParams::chor(2, false),
        &[MirrorRequest::Hello],
    )
    .await;
    assert_eq!(replies, vec![b"HI!".to_vec()]);
}

#[tokio::test]
async fn chunk_with_wrong_length_is_rejected() {
    let release = Release::new(64, 400, 15);
    let mirror = start_mirror(&release, false).await;

    let mut stream = TcpStream::connect((mirror.ip.as_str(), mirror.port))
        .await
        .unwrap();
    let geometry = raidpir_core::bits::ChunkGeometry::new(400, 4).unwrap();
    let params = SessionParams::chunked(
        vec![0, 1],
        4,
        2,
        &geometry,
        false,
        false,
        None,
    );
    wire::send_message(
        &mut stream,
        &MirrorRequest::Params(params).encode().unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(
        wire::recv_message(&mut stream).await.unwrap().as_ref(),
        wire::PARAMS_OK
    );

    let mut chunks = wire::ChunkMap::new();
    chunks.insert(0, vec![0u8; 3]); // chunk 0 must be 12 bytes
    wire::send_message(
        &mut stream,
        &MirrorRequest::Chunked(chunks).encode().unwrap(),
    )
    .await
    .unwrap();
    let reply = wire::recv_message(&mut stream).await.unwrap();
    let text = String::from_utf8_lossy(&reply);
    assert!(text.contains("expected"), "unexpected reply: {text}");
}

#[tokio::test]
async fn compute_time_is_tracked_per_session() {
    let release = Release::new(64, 100, 16);
    let mirror = start_mirror(&release, false).await;
    let replies = drive_session(
        &mirror,
        SessionParams::chor(2, false),
        &[
            MirrorRequest::FullBitstring(vec![0xffu8; 13]),
            MirrorRequest::ComputeTime,
        ],
    )
    .await;
    assert_eq!(replies[0].len(), 64);
    let text = String::from_utf8(replies[1].clone()).unwrap();
    assert!(text.starts_with('T'));
    let seconds: f64 = text[1..].parse().unwrap();
    assert!(seconds >= 0.0);
}
