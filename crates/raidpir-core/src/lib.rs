//! raidpir-core — shared protocol plumbing for RAID-PIR.
//!
//! Everything the client, mirror, and vendor agree on lives here: the
//! length-prefixed message framing, the msgpack codec, the manifest format,
//! bitstring arithmetic, the AES-CTR seed expansion, and the session
//! parameter record. The XOR datastore itself is in `raidpir-store`.

pub mod bits;
pub mod codec;
pub mod fetch;
pub mod hashes;
pub mod manifest;
pub mod params;
pub mod prg;
pub mod wire;

/// Protocol version string, spoken by all three binaries.
pub const PIR_VERSION: &str = "v0.9.3";

/// Default vendor port.
pub const DEFAULT_VENDOR_PORT: u16 = 62293;

/// Default mirror PIR port.
pub const DEFAULT_MIRROR_PORT: u16 = 62294;
