//! Query construction.
//!
//! For a target block t and privacy threshold k, the k per-mirror payloads
//! must XOR to the unit vector e_t while any k-1 of them (r-1 in the
//! chunked schemes) are independently uniform. Three schemes, increasingly
//! thrifty with bandwidth:
//!
//! - Chor: k full-length bitstrings, k-1 of them random, the last their XOR
//!   with bit t flipped.
//! - Chunked: the bitstring splits into k chunks; each mirror covers r of
//!   them (its primary plus r-1 secondaries). Secondaries are random; each
//!   primary is the XOR of every other mirror's contribution to that chunk,
//!   bit-flipped when the target falls inside it.
//! - Chunked+RNG: secondaries come from a per-mirror AES-CTR stream seeded
//!   at session setup, so only the primary chunk travels. With the parallel
//!   flag, one round retrieves up to one block from every chunk at once.

use std::collections::BTreeMap;

use rand::RngCore;

use raidpir_core::bits::{self, ChunkGeometry, GeometryError};
use raidpir_core::params::SessionParams;
use raidpir_core::prg::{SeedStream, SEED_BYTES};
use raidpir_core::wire::{ChunkMap, MirrorRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Chor,
    Chunked,
    ChunkedRng,
    ChunkedRngParallel,
}

/// Everything the requestor needs to drive k mirror sessions.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub mode: QueryMode,
    pub k: usize,
    pub num_blocks: usize,
    pub geometry: Option<ChunkGeometry>,
    /// Session parameters per mirror slot.
    pub slot_params: Vec<SessionParams>,
    /// Ordered query queue per mirror slot. Every slot has the same length.
    pub slot_queries: Vec<Vec<MirrorRequest>>,
    /// Blocks retrieved by queue position i: a single block in the serial
    /// modes, the round's group in parallel mode.
    pub round_blocks: Vec<Vec<usize>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuilderError {
    #[error("privacy threshold k must be at least 2, got {0}")]
    ThresholdTooSmall(usize),
    #[error("redundancy {r} out of range 2..={k}")]
    RedundancyOutOfRange { r: usize, k: usize },
    #[error("seed expansion and parallel queries require a redundancy parameter")]
    FlagsRequireRedundancy,
    #[error("parallel queries without seed expansion are not supported")]
    ParallelWithoutRng,
    #[error("block {0} out of range for {1} blocks")]
    BlockOutOfRange(usize, usize),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

/// The chunk numbers mirror slot `slot` covers: its primary chunk first,
/// then the next r-1 chunks cyclically.
fn chunk_numbers(slot: usize, k: usize, r: usize) -> Vec<u32> {
    (0..r).map(|j| ((slot + j) % k) as u32).collect()
}

/// Build the per-mirror query plan for `blocks`.
///
/// `redundancy = None` selects Chor mode; otherwise chunking with the given
/// r, optionally with seed expansion (`rng_expand`) and parallel rounds.
pub fn build_plan(
    blocks: &[usize],
    num_blocks: usize,
    k: usize,
    redundancy: Option<usize>,
    rng_expand: bool,
    parallel: bool,
    batch: bool,
    rng: &mut impl RngCore,
) -> Result<QueryPlan, BuilderError> {
    if k < 2 {
        return Err(BuilderError::ThresholdTooSmall(k));
    }
    if let Some(&bad) = blocks.iter().find(|&&b| b >= num_blocks) {
        return Err(BuilderError::BlockOutOfRange(bad, num_blocks));
    }
    let Some(r) = redundancy else {
        if rng_expand || parallel {
            return Err(BuilderError::FlagsRequireRedundancy);
        }
        return Ok(build_chor(blocks, num_blocks, k, batch, rng));
    };
    if r < 2 || r > k {
        return Err(BuilderError::RedundancyOutOfRange { r, k });
    }
    if parallel && !rng_expand {
        return Err(BuilderError::ParallelWithoutRng);
    }
    let geometry = ChunkGeometry::new(num_blocks, k)?;
    if parallel {
        Ok(build_parallel(blocks, &geometry, r, batch, rng))
    } else {
        Ok(build_chunked(blocks, &geometry, r, rng_expand, batch, rng))
    }
}

fn build_chor(
    blocks: &[usize],
    num_blocks: usize,
    k: usize,
    batch: bool,
    rng: &mut impl RngCore,
) -> QueryPlan {
    let mut slot_queries = vec![Vec::with_capacity(blocks.len()); k];
    for &target in blocks {
        let mut derived = vec![0u8; bits::bits_to_bytes(num_blocks)];
        for queries in slot_queries.iter_mut().take(k - 1) {
            let mask = bits::random_bits(rng, num_blocks);
            bits::xor_into(&mut derived, &mask);
            queries.push(MirrorRequest::FullBitstring(mask));
        }
        bits::flip_bit(&mut derived, target);
        slot_queries[k - 1].push(MirrorRequest::FullBitstring(derived));
    }
    QueryPlan {
        mode: QueryMode::Chor,
        k,
        num_blocks,
        geometry: None,
        slot_params: vec![SessionParams::chor(k as u32, batch); k],
        slot_queries,
        round_blocks: blocks.iter().map(|&b| vec![b]).collect(),
    }
}

/// Per-round scratch state: each slot's chunk map for this round.
///
/// Secondary chunks are drawn first for every slot; each primary is then the
/// XOR of all *other* slots' values for that chunk (each chunk index is
/// primary for exactly one slot).
struct Round {
    maps: Vec<ChunkMap>,
}

impl Round {
    fn draw_secondaries(
        slots: &[Vec<u32>],
        geometry: &ChunkGeometry,
        streams: &mut Option<Vec<SeedStream>>,
        rng: &mut impl RngCore,
    ) -> Self {
        let maps = slots
            .iter()
            .enumerate()
            .map(|(slot, cn)| {
                let mut map = ChunkMap::new();
                for &c in &cn[1..] {
                    let len = geometry.bits_of(c as usize);
                    let data = match streams {
                        Some(streams) => streams[slot].next_bits(len),
                        None => bits::random_bits(rng, len),
                    };
                    map.insert(c, data);
                }
                map
            })
            .collect();
        Round { maps }
    }

    /// Compute a primary chunk value: the XOR of every other slot's
    /// contribution to that chunk, with the target bit flipped when given.
    fn derive_primary(
        &self,
        primary: u32,
        geometry: &ChunkGeometry,
        flip: Option<usize>,
    ) -> Vec<u8> {
        let mut value = vec![0u8; geometry.bytes_of(primary as usize)];
        for map in &self.maps {
            if let Some(other) = map.get(&primary) {
                bits::xor_into(&mut value, other);
            }
        }
        if let Some(bit) = flip {
            bits::flip_bit(&mut value, bit);
        }
        value
    }
}

fn build_chunked(
    blocks: &[usize],
    geometry: &ChunkGeometry,
    r: usize,
    rng_expand: bool,
    batch: bool,
    rng: &mut impl RngCore,
) -> QueryPlan {
    let k = geometry.k;
    let slots: Vec<Vec<u32>> = (0..k).map(|s| chunk_numbers(s, k, r)).collect();
    let seeds: Option<Vec<[u8; SEED_BYTES]>> = rng_expand.then(|| {
        (0..k)
            .map(|_| {
                let mut seed = [0u8; SEED_BYTES];
                rng.fill_bytes(&mut seed);
                seed
            })
            .collect()
    });
    let mut streams = seeds
        .as_ref()
        .map(|seeds| seeds.iter().map(SeedStream::new).collect::<Vec<_>>());

    let mut slot_queries = vec![Vec::with_capacity(blocks.len()); k];
    for &target in blocks {
        let round = Round::draw_secondaries(&slots, geometry, &mut streams, rng);
        for (slot, cn) in slots.iter().enumerate() {
            let primary = cn[0];
            let flip = (geometry.chunk_of_block(target) == primary as usize)
                .then(|| geometry.offset_in_chunk(target, primary as usize));
            let value = round.derive_primary(primary, geometry, flip);
            let mut payload = if rng_expand {
                ChunkMap::new()
            } else {
                round.maps[slot].clone()
            };
            payload.insert(primary, value);
            slot_queries[slot].push(if rng_expand {
                MirrorRequest::ChunkedRng(payload)
            } else {
                MirrorRequest::Chunked(payload)
            });
        }
    }

    let slot_params = slots
        .iter()
        .enumerate()
        .map(|(slot, cn)| {
            SessionParams::chunked(
                cn.clone(),
                k as u32,
                r as u32,
                geometry,
                batch,
                false,
                seeds.as_ref().map(|s| s[slot]),
            )
        })
        .collect();

    QueryPlan {
        mode: if rng_expand {
            QueryMode::ChunkedRng
        } else {
            QueryMode::Chunked
        },
        k,
        num_blocks: geometry.num_blocks,
        geometry: Some(*geometry),
        slot_params,
        slot_queries,
        round_blocks: blocks.iter().map(|&b| vec![b]).collect(),
    }
}

fn build_parallel(
    blocks: &[usize],
    geometry: &ChunkGeometry,
    r: usize,
    batch: bool,
    rng: &mut impl RngCore,
) -> QueryPlan {
    let k = geometry.k;
    let slots: Vec<Vec<u32>> = (0..k).map(|s| chunk_numbers(s, k, r)).collect();
    let seeds: Vec<[u8; SEED_BYTES]> = (0..k)
        .map(|_| {
            let mut seed = [0u8; SEED_BYTES];
            rng.fill_bytes(&mut seed);
            seed
        })
        .collect();
    let mut streams = Some(seeds.iter().map(SeedStream::new).collect::<Vec<_>>());

    // group the requested blocks by the chunk each falls in
    let mut by_chunk: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for &block in blocks {
        by_chunk
            .entry(geometry.chunk_of_block(block) as u32)
            .or_default()
            .push(block);
    }

    let mut slot_queries = vec![Vec::new(); k];
    let mut round_blocks = Vec::new();
    // each round pulls at most one block out of every non-empty chunk
    while !by_chunk.is_empty() {
        let round = Round::draw_secondaries(&slots, geometry, &mut streams, rng);
        let mut group = Vec::new();
        for (slot, cn) in slots.iter().enumerate() {
            let primary = cn[0];
            let flip = match by_chunk.get_mut(&primary) {
                Some(queue) => {
                    let block = queue.remove(0);
                    if queue.is_empty() {
                        by_chunk.remove(&primary);
                    }
                    group.push(block);
                    Some(geometry.offset_in_chunk(block, primary as usize))
                }
                None => None,
            };
            let value = round.derive_primary(primary, geometry, flip);
            let mut payload = ChunkMap::new();
            payload.insert(primary, value);
            slot_queries[slot].push(MirrorRequest::ChunkedRngParallel(payload));
        }
        round_blocks.push(group);
    }

    let slot_params = slots
        .iter()
        .enumerate()
        .map(|(slot, cn)| {
            SessionParams::chunked(
                cn.clone(),
                k as u32,
                r as u32,
                geometry,
                batch,
                true,
                Some(seeds[slot]),
            )
        })
        .collect();

    QueryPlan {
        mode: QueryMode::ChunkedRngParallel,
        k,
        num_blocks: geometry.num_blocks,
        geometry: Some(*geometry),
        slot_params,
        slot_queries,
        round_blocks,
    }
}
