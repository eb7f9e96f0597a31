//! The manifest: the vendor-distributed ground truth describing the
//! database layout, the file list, and the per-block hash list.
//!
//! Two schema generations exist in the wild: older manifests omit
//! `datastore_layout` (implying `nogaps`) and may omit `manifesthash`. Both
//! are accepted on parse; serialization always writes the layout.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::hashes::HashSpec;

pub const MANIFEST_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatastoreLayout {
    /// Files packed back to back at cumulative offsets.
    #[serde(rename = "nogaps")]
    NoGaps,
    /// Files scattered across block-aligned offsets.
    #[serde(rename = "eqdist")]
    EqDist,
}

fn default_layout() -> DatastoreLayout {
    DatastoreLayout::NoGaps
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    /// Length in bytes.
    pub length: u64,
    /// Whole-file hash under the manifest's hash algorithm.
    pub hash: Vec<u8>,
    /// Byte offset into the datastore (`nogaps`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Block-aligned byte offsets, one per occupied block (`eqdist`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offsets: Option<Vec<u64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "manifestversion")]
    pub version: String,
    #[serde(rename = "hashalgorithm")]
    pub hash_algorithm: HashSpec,
    #[serde(rename = "blocksize")]
    pub block_size: usize,
    #[serde(rename = "blockcount")]
    pub block_count: usize,
    #[serde(rename = "vendorhostname")]
    pub vendor_hostname: String,
    #[serde(rename = "vendorport")]
    pub vendor_port: u16,
    #[serde(rename = "datastore_layout", default = "default_layout")]
    pub layout: DatastoreLayout,
    #[serde(rename = "fileinfolist")]
    pub files: Vec<FileInfo>,
    #[serde(rename = "blockhashlist")]
    pub block_hashes: Vec<Vec<u8>>,
    #[serde(
        rename = "manifesthash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub manifest_hash: Option<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest does not decode: {0}")]
    Codec(#[from] CodecError),
    #[error("manifest has {hashes} block hashes for {blocks} blocks")]
    HashListLength { hashes: usize, blocks: usize },
    #[error("manifest field invalid: {0}")]
    InvalidField(&'static str),
    #[error("file '{0}' is not listed in the manifest")]
    FileNotFound(String),
    #[error("block {0} missing from the reconstructed set")]
    MissingBlock(usize),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl Manifest {
    /// Parse and validate raw manifest bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Manifest = codec::decode(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.block_size == 0 {
            return Err(ManifestError::InvalidField("blocksize"));
        }
        if self.block_count == 0 {
            return Err(ManifestError::InvalidField("blockcount"));
        }
        if self.block_hashes.len() != self.block_count {
            return Err(ManifestError::HashListLength {
                hashes: self.block_hashes.len(),
                blocks: self.block_count,
            });
        }
        for info in &self.files {
            let placed = match self.layout {
                DatastoreLayout::NoGaps => info.offset.is_some(),
                DatastoreLayout::EqDist => info.offsets.is_some(),
            };
            if !placed {
                return Err(ManifestError::InvalidField("fileinfolist offsets"));
            }
        }
        Ok(())
    }

    /// Stamp `manifesthash`: the hash of the manifest serialized without it.
    pub fn seal(&mut self) -> Result<(), CodecError> {
        let mut unsealed = self.clone();
        unsealed.manifest_hash = None;
        let raw = codec::encode(&unsealed)?;
        self.manifest_hash = Some(self.hash_algorithm.hash(&raw));
        Ok(())
    }

    /// Check `manifesthash` if present. Manifests without one pass.
    pub fn verify_seal(&self) -> Result<bool, CodecError> {
        let Some(expected) = &self.manifest_hash else {
            return Ok(true);
        };
        let mut unsealed = self.clone();
        unsealed.manifest_hash = None;
        let raw = codec::encode(&unsealed)?;
        Ok(&self.hash_algorithm.hash(&raw) == expected)
    }

    pub fn file_info(&self, filename: &str) -> Option<&FileInfo> {
        self.files.iter().find(|f| f.filename == filename)
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.filename.as_str())
    }

    /// The blocks needed to reconstruct `filename`, in read order.
    pub fn blocks_for_file(&self, filename: &str) -> Result<Vec<usize>, ManifestError> {
        let info = self
            .file_info(filename)
            .ok_or_else(|| ManifestError::FileNotFound(filename.to_string()))?;
        let block_size = self.block_size as u64;
        match self.layout {
            DatastoreLayout::NoGaps => {
                let offset = info.offset.unwrap_or(0);
                if info.length == 0 {
                    return Ok(Vec::new());
                }
                let first = offset / block_size;
                let last = (offset + info.length - 1) / block_size;
                Ok((first..=last).map(|b| b as usize).collect())
            }
            DatastoreLayout::EqDist => Ok(info
                .offsets
                .iter()
                .flatten()
                .map(|&off| (off / block_size) as usize)
                .collect()),
        }
    }

    /// Reassemble `filename` from retrieved blocks.
    pub fn extract_file(
        &self,
        filename: &str,
        blocks: &HashMap<usize, Vec<u8>>,
    ) -> Result<Vec<u8>, ManifestError> {
        let info = self
            .file_info(filename)
            .ok_or_else(|| ManifestError::FileNotFound(filename.to_string()))?;
        let block_size = self.block_size as u64;
        let get = |blocknum: usize| {
            blocks
                .get(&blocknum)
                .ok_or(ManifestError::MissingBlock(blocknum))
        };

        match self.layout {
            DatastoreLayout::NoGaps => {
                let offset = info.offset.unwrap_or(0);
                let mut data = Vec::with_capacity(info.length as usize);
                let mut remaining = info.length;
                let mut position = offset;
                while remaining > 0 {
                    let blocknum = (position / block_size) as usize;
                    let start = (position % block_size) as usize;
                    let take = ((block_size as usize - start) as u64).min(remaining) as usize;
                    let block = get(blocknum)?;
                    data.extend_from_slice(&block[start..start + take]);
                    position += take as u64;
                    remaining -= take as u64;
                }
                Ok(data)
            }
            DatastoreLayout::EqDist => {
                let mut data = Vec::with_capacity(info.length as usize);
                let mut remaining = info.length;
                for &off in info.offsets.iter().flatten() {
                    let blocknum = (off / block_size) as usize;
                    let take = (block_size as u64).min(remaining) as usize;
                    let block = get(blocknum)?;
                    data.extend_from_slice(&block[..take]);
                    remaining -= take as u64;
                }
                Ok(data)
            }
        }
    }
}

// ── Manifest creation ─────────────────────────────────────────────────────────

/// Build a `nogaps` manifest from every file under `root`.
///
/// Files are placed at cumulative offsets in sorted relative-path order, so
/// the same tree always yields the same manifest.
pub fn create_manifest(
    root: &Path,
    hash_algorithm: HashSpec,
    block_size: usize,
    vendor_hostname: &str,
    vendor_port: u16,
) -> Result<Manifest, ManifestError> {
    if block_size == 0 {
        return Err(ManifestError::InvalidField("blocksize"));
    }

    let mut paths = Vec::new();
    walk(root, root, &mut paths)?;
    paths.sort();

    let mut files = Vec::new();
    let mut contents = Vec::new();
    let mut offset = 0u64;
    for relative in &paths {
        let full = root.join(relative);
        let data = std::fs::read(&full).map_err(|source| ManifestError::Io {
            path: full.display().to_string(),
            source,
        })?;
        files.push(FileInfo {
            filename: relative.clone(),
            length: data.len() as u64,
            hash: hash_algorithm.hash(&data),
            offset: Some(offset),
            offsets: None,
        });
        offset += data.len() as u64;
        contents.push(data);
    }

    let total: u64 = offset;
    let block_count = (total as usize).div_ceil(block_size).max(1);

    // lay the files out contiguously and hash block by block
    let mut datastore = vec![0u8; block_count * block_size];
    let mut cursor = 0usize;
    for data in &contents {
        datastore[cursor..cursor + data.len()].copy_from_slice(data);
        cursor += data.len();
    }
    let block_hashes = datastore
        .chunks(block_size)
        .map(|block| hash_algorithm.hash(block))
        .collect();

    let mut manifest = Manifest {
        version: MANIFEST_VERSION.to_string(),
        hash_algorithm,
        block_size,
        block_count,
        vendor_hostname: vendor_hostname.to_string(),
        vendor_port,
        layout: DatastoreLayout::NoGaps,
        files,
        block_hashes,
        manifest_hash: None,
    };
    manifest.seal()?;
    Ok(manifest)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), ManifestError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ManifestError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ManifestError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, out)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .expect("walk stays under root")
                .to_string_lossy()
                .into_owned();
            out.push(relative);
        }
    }
    Ok(())
}
