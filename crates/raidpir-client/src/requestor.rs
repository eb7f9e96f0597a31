//! Driving k mirror sessions and reassembling blocks.
//!
//! Each mirror slot gets its own task: it connects, performs the parameter
//! handshake, pipelines the slot's whole query queue, and reads replies in
//! order (mirror streams are FIFO, which batch mode relies on). Received
//! pieces land in a shared table keyed by queue position; when all k pieces
//! of a position are present the block (or the round's blocks, in parallel
//! mode) is XOR-combined, hash-verified against the manifest, and filed.
//!
//! A socket error on a slot swaps in a backup mirror and replays the slot's
//! queue from the start — replayed payloads are identical, and pieces for
//! already-completed positions are ignored. A hash mismatch is fatal: one of
//! the mirrors or the manifest is corrupt, and retrying elsewhere would not
//! tell us which.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use raidpir_core::codec::{self, CodecError};
use raidpir_core::manifest::Manifest;
use raidpir_core::wire::{self, ChunkMap, MirrorInfo, MirrorRequest, WireError};

use crate::builder::{QueryMode, QueryPlan};

#[derive(Debug, thiserror::Error)]
pub enum RequestorError {
    #[error("requested the use of {needed} mirrors, but only {available} were available")]
    InsufficientMirrors { needed: usize, available: usize },
    #[error("cannot connect to mirror {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("mirror rejected parameters: {0}")]
    ParamsRejected(String),
    #[error("mirror protocol error: {0}")]
    Protocol(String),
    #[error("block {0} failed hash verification: a mirror or the manifest is corrupt")]
    BlockHashMismatch(usize),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("mirror task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RequestorError {
    /// Errors that justify swapping the mirror for a backup, rather than
    /// failing the whole request.
    fn triggers_failover(&self) -> bool {
        matches!(
            self,
            RequestorError::Connect { .. } | RequestorError::Wire(_)
        )
    }
}

/// One slot's contribution to a queue position.
enum Piece {
    Block(Vec<u8>),
    Chunks(ChunkMap),
}

struct Pending {
    /// position -> slot -> piece
    pieces: HashMap<usize, HashMap<usize, Piece>>,
    /// positions already reconstructed
    done: HashSet<usize>,
    finished: HashMap<usize, Vec<u8>>,
    backups: Vec<MirrorInfo>,
}

struct Shared {
    plan: QueryPlan,
    manifest: Arc<Manifest>,
    pending: Mutex<Pending>,
}

impl Shared {
    async fn insert_piece(
        &self,
        position: usize,
        slot: usize,
        piece: Piece,
    ) -> Result<(), RequestorError> {
        let mut pending = self.pending.lock().await;
        if pending.done.contains(&position) {
            return Ok(());
        }
        let slots = pending.pieces.entry(position).or_default();
        slots.insert(slot, piece);
        if slots.len() < self.plan.k {
            return Ok(());
        }
        let slots = pending.pieces.remove(&position).expect("just inserted");
        pending.done.insert(position);
        for (blocknum, block) in self.reconstruct(position, &slots)? {
            if !self
                .manifest
                .hash_algorithm
                .verify(&block, &self.manifest.block_hashes[blocknum])
            {
                return Err(RequestorError::BlockHashMismatch(blocknum));
            }
            pending.finished.insert(blocknum, block);
        }
        Ok(())
    }

    /// XOR the k pieces of `position` back into plaintext blocks.
    fn reconstruct(
        &self,
        position: usize,
        slots: &HashMap<usize, Piece>,
    ) -> Result<Vec<(usize, Vec<u8>)>, RequestorError> {
        let block_size = self.manifest.block_size;
        let blocks = &self.plan.round_blocks[position];
        match self.plan.mode {
            QueryMode::Chor | QueryMode::Chunked | QueryMode::ChunkedRng => {
                let mut combined = vec![0u8; block_size];
                for piece in slots.values() {
                    let Piece::Block(data) = piece else {
                        return Err(RequestorError::Protocol(
                            "chunk-map reply on a serial session".to_string(),
                        ));
                    };
                    raidpir_core::bits::xor_into(&mut combined, data);
                }
                Ok(vec![(blocks[0], combined)])
            }
            QueryMode::ChunkedRngParallel => {
                let geometry = self.plan.geometry.expect("parallel plans carry geometry");
                let mut out = Vec::with_capacity(blocks.len());
                for &blocknum in blocks {
                    let chunk = geometry.chunk_of_block(blocknum) as u32;
                    let mut combined = vec![0u8; block_size];
                    for piece in slots.values() {
                        let Piece::Chunks(map) = piece else {
                            return Err(RequestorError::Protocol(
                                "raw-block reply on a parallel session".to_string(),
                            ));
                        };
                        if let Some(data) = map.get(&chunk) {
                            raidpir_core::bits::xor_into(&mut combined, data);
                        }
                    }
                    out.push((blocknum, combined));
                }
                Ok(out)
            }
        }
    }
}

/// Retrieve every block in `plan` from `mirrors`, privately.
///
/// `mirrors` is the vendor's list; k of them are chosen at random and the
/// rest are kept as failover backups. Returns blocknum -> contents.
pub async fn retrieve_blocks(
    plan: QueryPlan,
    manifest: Arc<Manifest>,
    mut mirrors: Vec<MirrorInfo>,
) -> Result<HashMap<usize, Vec<u8>>, RequestorError> {
    let k = plan.k;
    if mirrors.len() < k {
        return Err(RequestorError::InsufficientMirrors {
            needed: k,
            available: mirrors.len(),
        });
    }
    mirrors.shuffle(&mut rand::thread_rng());
    let backups = mirrors.split_off(k);

    let shared = Arc::new(Shared {
        plan,
        manifest,
        pending: Mutex::new(Pending {
            pieces: HashMap::new(),
            done: HashSet::new(),
            finished: HashMap::new(),
            backups,
        }),
    });

    let mut tasks = JoinSet::new();
    for (slot, mirror) in mirrors.into_iter().enumerate() {
        let shared = shared.clone();
        tasks.spawn(async move { run_slot(shared, slot, mirror).await });
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined? {
            tasks.abort_all();
            return Err(err);
        }
    }

    let mut pending = shared.pending.lock().await;
    Ok(std::mem::take(&mut pending.finished))
}

/// Serve one slot to completion, failing over to backups on socket errors.
async fn run_slot(
    shared: Arc<Shared>,
    slot: usize,
    mut mirror: MirrorInfo,
) -> Result<(), RequestorError> {
    loop {
        match serve_queue(&shared, slot, &mirror).await {
            Ok(()) => return Ok(()),
            Err(err) if err.triggers_failover() => {
                tracing::warn!(slot, mirror = %mirror, error = %err, "mirror failed");
                let replacement = shared.pending.lock().await.backups.pop();
                match replacement {
                    Some(next) => {
                        tracing::info!(slot, mirror = %next, "failing over to backup mirror");
                        mirror = next;
                    }
                    None => {
                        return Err(RequestorError::InsufficientMirrors {
                            needed: shared.plan.k,
                            available: shared.plan.k - 1,
                        })
                    }
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// One pass over the slot's query queue against one mirror.
async fn serve_queue(
    shared: &Shared,
    slot: usize,
    mirror: &MirrorInfo,
) -> Result<(), RequestorError> {
    let addr = format!("{}:{}", mirror.ip, mirror.port);
    let stream = raidpir_core::fetch::connect(&addr)
        .await
        .map_err(|source| RequestorError::Connect {
            addr: addr.clone(),
            source,
        })?;
    let (mut reader, mut writer) = stream.into_split();

    // parameter handshake
    let params = MirrorRequest::Params(shared.plan.slot_params[slot].clone());
    wire::send_message(&mut writer, &params.encode()?).await?;
    let reply = wire::recv_message(&mut reader).await?;
    if reply.as_ref() != wire::PARAMS_OK {
        return Err(RequestorError::ParamsRejected(
            String::from_utf8_lossy(&reply).into_owned(),
        ));
    }

    // pipeline every query, reading replies concurrently so neither side's
    // socket buffer can stall the other
    let queries = shared.plan.slot_queries[slot].clone();
    let expected = queries.len();
    let writer_task: tokio::task::JoinHandle<Result<OwnedWriteHalf, RequestorError>> =
        tokio::spawn(async move {
            for query in &queries {
                wire::send_message(&mut writer, &query.encode()?).await?;
            }
            Ok(writer)
        });

    let mut result = Ok(());
    for position in 0..expected {
        let payload = match wire::recv_message(&mut reader).await {
            Ok(payload) => payload,
            Err(err) => {
                result = Err(err.into());
                break;
            }
        };
        let piece = match parse_piece(shared, &payload) {
            Ok(piece) => piece,
            Err(err) => {
                result = Err(err);
                break;
            }
        };
        if let Err(err) = shared.insert_piece(position, slot, piece).await {
            result = Err(err);
            break;
        }
    }

    let writer = match writer_task.await? {
        Ok(writer) => Some(writer),
        Err(err) => {
            // keep the first error; a write failure usually surfaced on the
            // read side already
            if result.is_ok() {
                result = Err(err);
            }
            None
        }
    };
    if let (Ok(()), Some(mut writer)) = (&result, writer) {
        // graceful goodbye once every reply is in; a failure here is moot,
        // the data is already ours
        if let Ok(goodbye) = MirrorRequest::Quit.encode() {
            let _ = wire::send_message(&mut writer, &goodbye).await;
        }
        let _ = wire::send_close(&mut writer).await;
    }
    result
}

fn parse_piece(shared: &Shared, payload: &[u8]) -> Result<Piece, RequestorError> {
    let block_size = shared.manifest.block_size;
    match shared.plan.mode {
        QueryMode::Chor | QueryMode::Chunked | QueryMode::ChunkedRng => {
            if payload.len() != block_size {
                // a wrong-sized reply is the mirror's error string
                return Err(RequestorError::Protocol(
                    String::from_utf8_lossy(payload).into_owned(),
                ));
            }
            Ok(Piece::Block(payload.to_vec()))
        }
        QueryMode::ChunkedRngParallel => {
            let map: ChunkMap = codec::decode(payload).map_err(|_| {
                RequestorError::Protocol(String::from_utf8_lossy(payload).into_owned())
            })?;
            for data in map.values() {
                if data.len() != block_size {
                    return Err(RequestorError::Protocol(format!(
                        "parallel reply block has {} bytes, expected {block_size}",
                        data.len()
                    )));
                }
            }
            Ok(Piece::Chunks(map))
        }
    }
}
