//! raidpir-store — the XOR datastore.
//!
//! Holds the block-aligned replicated database and answers masked-XOR
//! queries. Two backends: an in-memory buffer populated from the manifest's
//! file list, and a read-only memory map over the on-disk container. An
//! optional four-Russians table trades memory for lookup-sized XOR strides.

pub mod container;
pub mod datastore;
pub mod populate;

pub use datastore::{StoreError, XorDatastore, BLOCK_ALIGN};
