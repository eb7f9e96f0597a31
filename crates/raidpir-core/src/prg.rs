//! Seed expansion: AES-128-CTR keystream shared between client and mirror.
//!
//! Both ends construct the stream from the 16-byte session seed and consume
//! it in lockstep (secondary chunks, in chunk-list order, per request). Any
//! divergence in consumption order desynchronizes the masks, so the draw
//! sizes are part of the protocol, not an implementation detail.

use aes::cipher::{KeyIvInit, StreamCipher};

use crate::bits;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

pub const SEED_BYTES: usize = 16;

pub struct SeedStream {
    cipher: Aes128Ctr,
}

impl SeedStream {
    pub fn new(seed: &[u8; SEED_BYTES]) -> Self {
        let iv = [0u8; 16];
        Self {
            cipher: Aes128Ctr::new(seed.into(), &iv.into()),
        }
    }

    /// Draw `bitlen` pseudorandom bits. Trailing bits past `bitlen` are zero,
    /// matching `bits::random_bits`. Always consumes whole keystream bytes.
    pub fn next_bits(&mut self, bitlen: usize) -> Vec<u8> {
        let mut buf = vec![0u8; bits::bits_to_bytes(bitlen)];
        self.cipher.apply_keystream(&mut buf);
        bits::clear_trailing_bits(&mut buf, bitlen);
        buf
    }
}
