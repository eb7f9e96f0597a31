//! The on-disk database container for the memory-mapped backend.
//!
//! Layout: the 16-byte ASCII magic, then the file contents concatenated in
//! manifest-offset order, zero-padded to the full N·B bytes. The mirror maps
//! the file read-only; population happens offline through `write_container`.

use std::io::Write;
use std::path::Path;

use raidpir_core::manifest::{DatastoreLayout, Manifest};
use static_assertions::const_assert_eq;

pub const MAGIC: &[u8; 16] = b"RAIDPIRDB_v0.9.3";
const_assert_eq!(MAGIC.len(), 16);

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("{0} is not a RAID-PIR database container (bad magic)")]
    BadMagic(String),
    #[error("container {path} has {got} data bytes, expected {expected}")]
    Truncated {
        path: String,
        got: usize,
        expected: usize,
    },
    #[error("container layout must be nogaps")]
    UnsupportedLayout,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ContainerError + '_ {
    move |source| ContainerError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Write a container for `manifest` from the files under `root`.
pub fn write_container(
    manifest: &Manifest,
    root: &Path,
    out_path: &Path,
) -> Result<(), ContainerError> {
    if manifest.layout != DatastoreLayout::NoGaps {
        return Err(ContainerError::UnsupportedLayout);
    }
    let total = manifest.block_size * manifest.block_count;
    let mut out = std::fs::File::create(out_path).map_err(io_err(out_path))?;
    out.write_all(MAGIC).map_err(io_err(out_path))?;

    let mut written = 0usize;
    for info in &manifest.files {
        let path = root.join(&info.filename);
        let data = std::fs::read(&path).map_err(io_err(&path))?;
        out.write_all(&data).map_err(io_err(out_path))?;
        written += data.len();
    }
    // pad the final partial block
    out.write_all(&vec![0u8; total - written])
        .map_err(io_err(out_path))?;
    out.flush().map_err(io_err(out_path))
}

/// Map an existing container read-only and validate magic and size.
pub(crate) fn open_container(
    path: &Path,
    expected_data_len: usize,
) -> Result<memmap2::Mmap, ContainerError> {
    let file = std::fs::File::open(path).map_err(io_err(path))?;
    // Safety: the container is opened read-only and never truncated while
    // mapped; the mirror owns it for the process lifetime.
    let map = unsafe { memmap2::Mmap::map(&file) }.map_err(io_err(path))?;
    if map.len() < MAGIC.len() || &map[..MAGIC.len()] != MAGIC {
        return Err(ContainerError::BadMagic(path.display().to_string()));
    }
    let got = map.len() - MAGIC.len();
    if got < expected_data_len {
        return Err(ContainerError::Truncated {
            path: path.display().to_string(),
            got,
            expected: expected_data_len,
        });
    }
    Ok(map)
}
