//! Manifest-driven datastore population.
//!
//! The mirror loads every file named by the manifest into the RAM backend,
//! verifying file sizes and hashes as it goes, then re-derives the per-block
//! hash list and compares it against the manifest. Matching file hashes with
//! a mismatching block hash means the manifest itself is corrupt.

use std::path::{Component, Path};

use raidpir_core::manifest::{DatastoreLayout, Manifest};

use crate::datastore::{StoreError, XorDatastore};

#[derive(Debug, thiserror::Error)]
pub enum PopulateError {
    #[error("file '{0}' listed in the manifest cannot be found under '{1}'")]
    FileNotFound(String, String),
    #[error("file '{0}' in manifest escapes the files root")]
    PathEscapesRoot(String),
    #[error("file '{file}' has {got} bytes, manifest says {expected}")]
    WrongSize {
        file: String,
        got: u64,
        expected: u64,
    },
    #[error("file '{0}' has the wrong hash")]
    WrongFileHash(String),
    #[error("block {0} has an invalid hash: corrupt manifest or dirty datastore")]
    BlockHashMismatch(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Load the manifest's files into `store` and verify every block hash.
pub fn populate_from_files(
    manifest: &Manifest,
    store: &mut XorDatastore,
    root: &Path,
) -> Result<(), PopulateError> {
    for info in &manifest.files {
        let relative = Path::new(&info.filename);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(PopulateError::PathEscapesRoot(info.filename.clone()));
        }
        let path = root.join(relative);
        if !path.exists() {
            return Err(PopulateError::FileNotFound(
                info.filename.clone(),
                root.display().to_string(),
            ));
        }
        let data = std::fs::read(&path).map_err(|source| PopulateError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if data.len() as u64 != info.length {
            return Err(PopulateError::WrongSize {
                file: info.filename.clone(),
                got: data.len() as u64,
                expected: info.length,
            });
        }
        if !manifest.hash_algorithm.verify(&data, &info.hash) {
            return Err(PopulateError::WrongFileHash(info.filename.clone()));
        }

        match manifest.layout {
            DatastoreLayout::NoGaps => {
                store.set_data(info.offset.unwrap_or(0) as usize, &data)?;
            }
            DatastoreLayout::EqDist => {
                for (piece, &offset) in data
                    .chunks(manifest.block_size)
                    .zip(info.offsets.iter().flatten())
                {
                    store.set_data(offset as usize, piece)?;
                }
            }
        }
    }

    verify_block_hashes(manifest, store)
}

/// Re-derive the block hash list from `store` and compare to the manifest.
/// Rejects on the first mismatch.
pub fn verify_block_hashes(
    manifest: &Manifest,
    store: &XorDatastore,
) -> Result<(), PopulateError> {
    for blocknum in 0..manifest.block_count {
        let block = store.get_data(blocknum * manifest.block_size, manifest.block_size)?;
        if !manifest
            .hash_algorithm
            .verify(&block, &manifest.block_hashes[blocknum])
        {
            return Err(PopulateError::BlockHashMismatch(blocknum));
        }
    }
    Ok(())
}
