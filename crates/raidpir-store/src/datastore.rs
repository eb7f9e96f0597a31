//! The XOR datastore and its kernels.
//!
//! The masked-XOR kernel is the throughput ceiling of the whole system: a
//! mirror answers every query with one scan over the database. Blocks are a
//! multiple of 64 bytes so the kernel can run in 64-bit strides without a
//! remainder loop. The scan visits all N mask bits no matter how many are
//! set, so response timing does not depend on the query.

use raidpir_core::bits;

use crate::container;

/// Block sizes must be a multiple of this many bytes.
pub const BLOCK_ALIGN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("block size must be positive")]
    BlockSizeNotPositive,
    #[error("block size {0} is not a multiple of {BLOCK_ALIGN} bytes")]
    BlockSizeUnaligned(usize),
    #[error("number of blocks must be positive")]
    BlockCountNotPositive,
    #[error("offset {offset} + {len} bytes overflows the datastore of {capacity} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("mask has {got} bytes, expected {expected}")]
    MaskLength { got: usize, expected: usize },
    #[error("concatenated masks have {got} bytes, expected {expected} for {count} requests")]
    MultiMaskLength {
        got: usize,
        expected: usize,
        count: usize,
    },
    #[error("the memory-mapped backend is read-only")]
    ReadOnlyBackend,
    #[error(transparent)]
    Container(#[from] container::ContainerError),
}

enum Backend {
    Ram(Vec<u8>),
    Mmap(memmap2::Mmap),
}

impl Backend {
    fn data(&self) -> &[u8] {
        match self {
            Backend::Ram(buf) => buf,
            Backend::Mmap(map) => &map[container::MAGIC.len()..],
        }
    }
}

pub struct XorDatastore {
    block_size: usize,
    num_blocks: usize,
    backend: Backend,
    /// Four-Russians table: one 256-entry row of precomputed subset XORs per
    /// group of 8 consecutive blocks. Built by `finalize`, read-only after.
    precompute: Option<Vec<u8>>,
}

fn check_dimensions(block_size: usize, num_blocks: usize) -> Result<(), StoreError> {
    if block_size == 0 {
        return Err(StoreError::BlockSizeNotPositive);
    }
    if block_size % BLOCK_ALIGN != 0 {
        return Err(StoreError::BlockSizeUnaligned(block_size));
    }
    if num_blocks == 0 {
        return Err(StoreError::BlockCountNotPositive);
    }
    Ok(())
}

impl XorDatastore {
    /// Allocate a zeroed in-memory datastore.
    pub fn new_ram(block_size: usize, num_blocks: usize) -> Result<Self, StoreError> {
        check_dimensions(block_size, num_blocks)?;
        Ok(Self {
            block_size,
            num_blocks,
            backend: Backend::Ram(vec![0u8; block_size * num_blocks]),
            precompute: None,
        })
    }

    /// Memory-map an existing container file read-only.
    pub fn open_mmap(
        block_size: usize,
        num_blocks: usize,
        path: &std::path::Path,
    ) -> Result<Self, StoreError> {
        check_dimensions(block_size, num_blocks)?;
        let map = container::open_container(path, block_size * num_blocks)?;
        Ok(Self {
            block_size,
            num_blocks,
            backend: Backend::Mmap(map),
            precompute: None,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn total_bytes(&self) -> usize {
        self.block_size * self.num_blocks
    }

    /// Wire length of a query mask: ⌈N/8⌉ bytes.
    pub fn mask_len(&self) -> usize {
        bits::bits_to_bytes(self.num_blocks)
    }

    fn block(&self, blocknum: usize) -> &[u8] {
        let start = blocknum * self.block_size;
        &self.backend.data()[start..start + self.block_size]
    }

    /// Write raw bytes at a byte offset, crossing block boundaries freely.
    /// RAM backend only; the mmap backend is populated by the container tool.
    pub fn set_data(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        let capacity = self.total_bytes();
        if offset.checked_add(data.len()).map_or(true, |end| end > capacity) {
            return Err(StoreError::OutOfRange {
                offset,
                len: data.len(),
                capacity,
            });
        }
        match &mut self.backend {
            Backend::Ram(buf) => {
                buf[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
            Backend::Mmap(_) => Err(StoreError::ReadOnlyBackend),
        }
    }

    /// Read raw bytes, ignoring block layout.
    pub fn get_data(&self, offset: usize, len: usize) -> Result<Vec<u8>, StoreError> {
        let capacity = self.total_bytes();
        if offset.checked_add(len).map_or(true, |end| end > capacity) {
            return Err(StoreError::OutOfRange {
                offset,
                len,
                capacity,
            });
        }
        Ok(self.backend.data()[offset..offset + len].to_vec())
    }

    /// XOR together every block whose mask bit is set.
    ///
    /// The mask must be exactly ⌈N/8⌉ bytes; bits past N are ignored. An
    /// all-zero mask yields an all-zero block.
    pub fn produce_xor(&self, mask: &[u8]) -> Result<Vec<u8>, StoreError> {
        if mask.len() != self.mask_len() {
            return Err(StoreError::MaskLength {
                got: mask.len(),
                expected: self.mask_len(),
            });
        }
        let mut result = vec![0u8; self.block_size];
        self.xor_into(mask, &mut result);
        Ok(result)
    }

    /// M masked-XOR passes in one call: `masks` is M concatenated masks and
    /// the result is M concatenated blocks, in order.
    pub fn produce_xor_multiple(&self, masks: &[u8], count: usize) -> Result<Vec<u8>, StoreError> {
        let expected = self.mask_len() * count;
        if masks.len() != expected {
            return Err(StoreError::MultiMaskLength {
                got: masks.len(),
                expected,
                count,
            });
        }
        let mut result = vec![0u8; self.block_size * count];
        for (mask, out) in masks
            .chunks_exact(self.mask_len())
            .zip(result.chunks_exact_mut(self.block_size))
        {
            self.xor_into(mask, out);
        }
        Ok(result)
    }

    fn xor_into(&self, mask: &[u8], out: &mut [u8]) {
        match &self.precompute {
            Some(table) => {
                let row = 256 * self.block_size;
                for (group, &pattern) in mask.iter().enumerate() {
                    // pattern 0 rows are zero, so no data-dependent branch
                    let start = group * row + pattern as usize * self.block_size;
                    xor_words(out, &table[start..start + self.block_size]);
                }
            }
            None => {
                for blocknum in 0..self.num_blocks {
                    if bits::get_bit(mask, blocknum) {
                        xor_words(out, self.block(blocknum));
                    }
                }
            }
        }
    }

    /// Build the four-Russians table: for every group of 8 consecutive
    /// blocks and every 8-bit pattern, the XOR of the selected subset.
    /// Costs 32x the database in memory and turns the per-query scan into
    /// one table lookup per mask byte.
    pub fn finalize(&mut self) {
        if self.precompute.is_some() {
            return;
        }
        let groups = self.mask_len();
        let block_size = self.block_size;
        let mut table = vec![0u8; groups * 256 * block_size];
        for group in 0..groups {
            let row = &mut table[group * 256 * block_size..(group + 1) * 256 * block_size];
            for pattern in 1usize..256 {
                // peel the lowest set bit and reuse the already-built entry
                let low = pattern & pattern.wrapping_neg();
                let rest = pattern ^ low;
                // bit j of the pattern (MSB first) selects block 8*group + j
                let blocknum = group * 8 + (7 - low.trailing_zeros() as usize);
                let (before, from_pattern) = row.split_at_mut(pattern * block_size);
                let entry = &mut from_pattern[..block_size];
                entry.copy_from_slice(&before[rest * block_size..(rest + 1) * block_size]);
                if blocknum < self.num_blocks {
                    xor_words(entry, self.block(blocknum));
                }
            }
        }
        tracing::info!(
            groups,
            table_bytes = table.len(),
            "four-Russians table built"
        );
        self.precompute = Some(table);
    }
}

/// XOR `src` into `dst` in 64-bit strides. Both lengths are a multiple of
/// 64 bytes by construction.
fn xor_words(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.chunks_exact_mut(8).zip(src.chunks_exact(8)) {
        let word = u64::from_ne_bytes(d.try_into().unwrap()) ^ u64::from_ne_bytes(s.try_into().unwrap());
        d.copy_from_slice(&word.to_ne_bytes());
    }
}
