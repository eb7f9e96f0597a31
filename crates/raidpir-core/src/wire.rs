//! RAID-PIR wire format — message framing and request opcodes.
//!
//! Every client↔mirror and client↔vendor exchange is framed as a 4-byte
//! big-endian *signed* length followed by that many payload bytes. A length
//! of -1 tells the peer this side is closing; 0 is an empty message; any
//! other negative length is a protocol error.
//!
//! The first bytes of a payload carry the opcode. Structured opcodes (`P`,
//! `C`, `R`, `M`, `MIRRORADVERTISE`) are followed by msgpack; `X` is followed
//! by the raw bitstring.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{self, CodecError};
use crate::params::SessionParams;

/// Sent by a peer announcing it will close the connection.
const CLOSE_SENTINEL: i32 = -1;

// ── Framing ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("bad message length: {0}")]
    BadLength(i32),
    #[error("message of {0} bytes exceeds the framing limit")]
    MessageTooLarge(usize),
}

/// Send one length-prefixed message.
pub async fn send_message<W>(writer: &mut W, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let len: i32 = payload
        .len()
        .try_into()
        .map_err(|_| WireError::MessageTooLarge(payload.len()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Announce closure to the peer (length -1, no payload).
pub async fn send_close<W>(writer: &mut W) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&CLOSE_SENTINEL.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive one length-prefixed message.
///
/// Returns `PeerClosed` on the close sentinel and on EOF mid-frame, so a
/// peer that disappears without the courtesy -1 looks the same to callers.
pub async fn recv_message<R>(reader: &mut R) -> Result<Bytes, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(WireError::PeerClosed);
        }
        return Err(e.into());
    }
    let len = i32::from_be_bytes(len_buf);
    if len == CLOSE_SENTINEL {
        return Err(WireError::PeerClosed);
    }
    if len < 0 {
        return Err(WireError::BadLength(len));
    }
    let mut payload = BytesMut::zeroed(len as usize);
    if let Err(e) = reader.read_exact(&mut payload).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(WireError::PeerClosed);
        }
        return Err(e.into());
    }
    Ok(payload.freeze())
}

// ── Reply strings ─────────────────────────────────────────────────────────────

pub const PARAMS_OK: &[u8] = b"PARAMS OK";
pub const MIRROR_HI: &[u8] = b"HI!";
pub const VENDOR_HI: &[u8] = b"VENDORHI!";
pub const ADVERTISE_OK: &[u8] = b"OK";

// ── Mirror requests ───────────────────────────────────────────────────────────

/// A chunk map: chunk index → chunk bytes.
pub type ChunkMap = BTreeMap<u32, Vec<u8>>;

/// One request on a client↔mirror session. The wire opcode byte dispatches
/// to exactly one of these; each variant carries its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorRequest {
    /// `P` — parameter handshake, first message of every session.
    Params(SessionParams),
    /// `X` — raw full bitstring of ⌈N/8⌉ bytes.
    FullBitstring(Vec<u8>),
    /// `C` — chunk map, no seed expansion.
    Chunked(ChunkMap),
    /// `R` — primary chunk only; mirror fills secondary chunks from the
    /// session keystream.
    ChunkedRng(ChunkMap),
    /// `M` — like `R`, but answered with one block per covered chunk.
    ChunkedRngParallel(ChunkMap),
    /// `T` — report accumulated compute time.
    ComputeTime,
    /// `HELLO` — liveness probe.
    Hello,
    /// `Q` — half-close the session.
    Quit,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("empty request")]
    Empty,
    #[error("unknown opcode")]
    UnknownOpcode,
    #[error("undecodable request payload: {0}")]
    Codec(#[from] CodecError),
}

impl MirrorRequest {
    pub fn parse(raw: &[u8]) -> Result<Self, RequestError> {
        match raw {
            [] => Err(RequestError::Empty),
            b"T" => Ok(MirrorRequest::ComputeTime),
            b"HELLO" => Ok(MirrorRequest::Hello),
            b"Q" => Ok(MirrorRequest::Quit),
            [b'P', rest @ ..] => Ok(MirrorRequest::Params(codec::decode(rest)?)),
            [b'X', rest @ ..] => Ok(MirrorRequest::FullBitstring(rest.to_vec())),
            [b'C', rest @ ..] => Ok(MirrorRequest::Chunked(codec::decode(rest)?)),
            [b'R', rest @ ..] => Ok(MirrorRequest::ChunkedRng(codec::decode(rest)?)),
            [b'M', rest @ ..] => Ok(MirrorRequest::ChunkedRngParallel(codec::decode(rest)?)),
            _ => Err(RequestError::UnknownOpcode),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(match self {
            MirrorRequest::Params(params) => prefixed(b'P', &codec::encode(params)?),
            MirrorRequest::FullBitstring(bits) => prefixed(b'X', bits),
            MirrorRequest::Chunked(chunks) => prefixed(b'C', &codec::encode(chunks)?),
            MirrorRequest::ChunkedRng(chunks) => prefixed(b'R', &codec::encode(chunks)?),
            MirrorRequest::ChunkedRngParallel(chunks) => prefixed(b'M', &codec::encode(chunks)?),
            MirrorRequest::ComputeTime => b"T".to_vec(),
            MirrorRequest::Hello => b"HELLO".to_vec(),
            MirrorRequest::Quit => b"Q".to_vec(),
        })
    }
}

fn prefixed(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(opcode);
    buf.extend_from_slice(payload);
    buf
}

// ── Mirror info ───────────────────────────────────────────────────────────────

/// How a mirror identifies itself to the vendor, and how clients reach it.
/// Registry entries are keyed by `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MirrorInfo {
    pub ip: String,
    pub port: u16,
}

impl MirrorInfo {
    pub fn key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl std::fmt::Display for MirrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

// ── Vendor requests ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum VendorRequest {
    /// `GET MANIFEST` — raw manifest bytes.
    GetManifest,
    /// `GET MIRRORLIST` — serialized list of live mirrors.
    GetMirrorList,
    /// `MIRRORADVERTISE` — mirror liveness advertisement. The payload stays
    /// raw here; the vendor applies its own size and schema validation.
    Advertise(Vec<u8>),
    /// `HELLO` — liveness probe.
    Hello,
}

const ADVERTISE_PREFIX: &[u8] = b"MIRRORADVERTISE";

impl VendorRequest {
    pub fn parse(raw: &[u8]) -> Result<Self, RequestError> {
        match raw {
            [] => Err(RequestError::Empty),
            b"GET MANIFEST" => Ok(VendorRequest::GetManifest),
            b"GET MIRRORLIST" => Ok(VendorRequest::GetMirrorList),
            b"HELLO" => Ok(VendorRequest::Hello),
            _ if raw.starts_with(ADVERTISE_PREFIX) => Ok(VendorRequest::Advertise(
                raw[ADVERTISE_PREFIX.len()..].to_vec(),
            )),
            _ => Err(RequestError::UnknownOpcode),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            VendorRequest::GetManifest => b"GET MANIFEST".to_vec(),
            VendorRequest::GetMirrorList => b"GET MIRRORLIST".to_vec(),
            VendorRequest::Advertise(payload) => {
                let mut buf = ADVERTISE_PREFIX.to_vec();
                buf.extend_from_slice(payload);
                buf
            }
            VendorRequest::Hello => b"HELLO".to_vec(),
        }
    }
}
