//! Session parameters, fixed per client↔mirror connection by the `P`
//! handshake.
//!
//! A chunked session carries the mirror's chunk-number list (primary chunk
//! first), the privacy threshold k, the redundancy r, and the chunk
//! geometry. A Chor session (no chunking) is encoded as `r = 0` with empty
//! `cn` and zero chunk lengths; such a session may only issue `X` requests.

use serde::{Deserialize, Serialize};

use crate::bits::ChunkGeometry;
use crate::prg::SEED_BYTES;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    /// Chunk numbers this mirror covers, primary first. Length r.
    pub cn: Vec<u32>,
    /// Privacy threshold: number of mirrors queried.
    pub k: u32,
    /// Redundancy: chunks per mirror. 0 encodes a Chor session.
    pub r: u32,
    /// Chunk length in bits (multiple of 8) for chunks 0..k-2.
    pub cl: usize,
    /// Last chunk length in bits, >= cl.
    pub lcl: usize,
    /// Batch mode: defer replies through the batch-answer task.
    #[serde(default)]
    pub b: bool,
    /// Parallel queries: `M` requests answering one block per chunk.
    #[serde(default)]
    pub p: bool,
    /// Seed for AES-CTR expansion of secondary chunks (`R`/`M` sessions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<[u8; SEED_BYTES]>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("privacy threshold k must be at least 2, got {0}")]
    ThresholdTooSmall(u32),
    #[error("redundancy {r} out of range for k = {k}")]
    RedundancyOutOfRange { r: u32, k: u32 },
    #[error("chunk number list has {got} entries, expected {expected}")]
    ChunkListLength { got: usize, expected: usize },
    #[error("chunk number {0} out of range")]
    ChunkOutOfRange(u32),
    #[error("duplicate chunk number {0}")]
    DuplicateChunk(u32),
    #[error("chunk length {0} is not a positive multiple of 8")]
    BadChunkLength(usize),
    #[error("chunk lengths {cl}*({k}-1)+{lcl} do not cover {num_blocks} blocks")]
    GeometryMismatch {
        cl: usize,
        lcl: usize,
        k: u32,
        num_blocks: usize,
    },
    #[error("chor session must not carry chunk parameters")]
    ChorWithChunks,
    #[error("parallel queries require a seed")]
    ParallelWithoutSeed,
}

impl SessionParams {
    /// Parameters for a Chor (unchunked) session.
    pub fn chor(k: u32, batch: bool) -> Self {
        Self {
            cn: Vec::new(),
            k,
            r: 0,
            cl: 0,
            lcl: 0,
            b: batch,
            p: false,
            s: None,
        }
    }

    /// Parameters for a chunked session.
    pub fn chunked(
        cn: Vec<u32>,
        k: u32,
        r: u32,
        geometry: &ChunkGeometry,
        batch: bool,
        parallel: bool,
        seed: Option<[u8; SEED_BYTES]>,
    ) -> Self {
        Self {
            cn,
            k,
            r,
            cl: geometry.chunk_bits,
            lcl: geometry.last_chunk_bits,
            b: batch,
            p: parallel,
            s: seed,
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.r != 0
    }

    /// Validate against the datastore's block count.
    pub fn validate(&self, num_blocks: usize) -> Result<(), ParamsError> {
        if self.k < 2 {
            return Err(ParamsError::ThresholdTooSmall(self.k));
        }
        if !self.is_chunked() {
            if !self.cn.is_empty() || self.cl != 0 || self.lcl != 0 || self.p {
                return Err(ParamsError::ChorWithChunks);
            }
            return Ok(());
        }
        if self.r < 2 || self.r > self.k {
            return Err(ParamsError::RedundancyOutOfRange {
                r: self.r,
                k: self.k,
            });
        }
        if self.cn.len() != self.r as usize {
            return Err(ParamsError::ChunkListLength {
                got: self.cn.len(),
                expected: self.r as usize,
            });
        }
        let mut seen = vec![false; self.k as usize];
        for &c in &self.cn {
            if c >= self.k {
                return Err(ParamsError::ChunkOutOfRange(c));
            }
            if std::mem::replace(&mut seen[c as usize], true) {
                return Err(ParamsError::DuplicateChunk(c));
            }
        }
        if self.cl == 0 || self.cl % 8 != 0 {
            return Err(ParamsError::BadChunkLength(self.cl));
        }
        if self.lcl < self.cl || self.cl * (self.k as usize - 1) + self.lcl != num_blocks {
            return Err(ParamsError::GeometryMismatch {
                cl: self.cl,
                lcl: self.lcl,
                k: self.k,
                num_blocks,
            });
        }
        if self.p && self.s.is_none() {
            return Err(ParamsError::ParallelWithoutSeed);
        }
        Ok(())
    }

    /// The geometry this session describes. Only meaningful when chunked.
    pub fn geometry(&self, num_blocks: usize) -> ChunkGeometry {
        ChunkGeometry {
            num_blocks,
            k: self.k as usize,
            chunk_bits: self.cl,
            last_chunk_bits: self.lcl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn chunked_params() -> SessionParams {
        let geometry = ChunkGeometry::new(400, 4).unwrap();
        SessionParams::chunked(
            vec![1, 2],
            4,
            2,
            &geometry,
            false,
            false,
            Some([9u8; 16]),
        )
    }

    #[test]
    fn chor_params_validate() {
        SessionParams::chor(3, true).validate(100).unwrap();
    }

    #[test]
    fn chor_params_reject_chunk_fields() {
        let mut params = SessionParams::chor(3, false);
        params.cl = 8;
        assert_eq!(params.validate(100), Err(ParamsError::ChorWithChunks));
    }

    #[test]
    fn chunked_params_validate() {
        chunked_params().validate(400).unwrap();
    }

    #[test]
    fn chunked_params_reject_geometry_mismatch() {
        assert!(matches!(
            chunked_params().validate(500),
            Err(ParamsError::GeometryMismatch { .. })
        ));
    }

    #[test]
    fn chunked_params_reject_bad_chunk_lists() {
        let mut params = chunked_params();
        params.cn = vec![1, 1];
        assert_eq!(params.validate(400), Err(ParamsError::DuplicateChunk(1)));

        let mut params = chunked_params();
        params.cn = vec![1, 7];
        assert_eq!(params.validate(400), Err(ParamsError::ChunkOutOfRange(7)));

        let mut params = chunked_params();
        params.cn = vec![1];
        assert!(matches!(
            params.validate(400),
            Err(ParamsError::ChunkListLength { .. })
        ));
    }

    #[test]
    fn parallel_requires_seed() {
        let mut params = chunked_params();
        params.p = true;
        params.s = None;
        assert_eq!(params.validate(400), Err(ParamsError::ParallelWithoutSeed));
    }

    #[test]
    fn params_round_trip_as_msgpack() {
        let params = chunked_params();
        let bytes = codec::encode(&params).unwrap();
        let back: SessionParams = codec::decode(&bytes).unwrap();
        assert_eq!(params, back);
    }

    #[test]
    fn seed_is_optional_on_the_wire() {
        let params = SessionParams::chor(2, false);
        let bytes = codec::encode(&params).unwrap();
        let back: SessionParams = codec::decode(&bytes).unwrap();
        assert_eq!(back.s, None);
    }
}
