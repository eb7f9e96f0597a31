//! Hash algorithm registry.
//!
//! Manifests name their hash as `algorithm-encoding`, e.g. `sha256-hex` or
//! `blake3-raw`. The special value `noop` skips hashing entirely and exists
//! for benchmarking only.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Digest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Noop,
    Sha256,
    Sha384,
    Sha512,
    Blake3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashEncoding {
    Hex,
    Raw,
}

/// Parsed `algorithm-encoding` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashSpec {
    pub algorithm: HashAlgorithm,
    pub encoding: HashEncoding,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HashError {
    #[error("unknown hash algorithm: '{0}'")]
    UnknownAlgorithm(String),
    #[error("unknown hash encoding: '{0}'")]
    UnknownEncoding(String),
}

impl HashSpec {
    pub const NOOP: HashSpec = HashSpec {
        algorithm: HashAlgorithm::Noop,
        encoding: HashEncoding::Raw,
    };

    /// Hash `data`. Hex encodings return the ASCII hex digest bytes, raw
    /// encodings the digest itself, noop an empty vector.
    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        let digest: Vec<u8> = match self.algorithm {
            HashAlgorithm::Noop => return Vec::new(),
            HashAlgorithm::Sha256 => sha2::Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => sha2::Sha384::digest(data).to_vec(),
            HashAlgorithm::Sha512 => sha2::Sha512::digest(data).to_vec(),
            HashAlgorithm::Blake3 => blake3::hash(data).as_bytes().to_vec(),
        };
        match self.encoding {
            HashEncoding::Raw => digest,
            HashEncoding::Hex => hex::encode(digest).into_bytes(),
        }
    }

    /// Hash `data` and compare against an expected value.
    pub fn verify(&self, data: &[u8], expected: &[u8]) -> bool {
        self.hash(data) == expected
    }
}

impl FromStr for HashSpec {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, HashError> {
        if s == "noop" || s == "none" {
            return Ok(HashSpec::NOOP);
        }
        let (name, encoding) = match s.split_once('-') {
            Some((name, enc)) => (name, enc),
            None => (s, "hex"),
        };
        let algorithm = match name {
            "sha256" => HashAlgorithm::Sha256,
            "sha384" => HashAlgorithm::Sha384,
            "sha512" => HashAlgorithm::Sha512,
            "blake3" => HashAlgorithm::Blake3,
            other => return Err(HashError::UnknownAlgorithm(other.to_string())),
        };
        let encoding = match encoding {
            "hex" => HashEncoding::Hex,
            "raw" => HashEncoding::Raw,
            other => return Err(HashError::UnknownEncoding(other.to_string())),
        };
        Ok(HashSpec {
            algorithm,
            encoding,
        })
    }
}

impl fmt::Display for HashSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.algorithm {
            HashAlgorithm::Noop => return f.write_str("noop"),
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Blake3 => "blake3",
        };
        let encoding = match self.encoding {
            HashEncoding::Hex => "hex",
            HashEncoding::Raw => "raw",
        };
        write!(f, "{name}-{encoding}")
    }
}

// On the wire a HashSpec is just its display string.
impl Serialize for HashSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HashSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
