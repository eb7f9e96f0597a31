//! One-shot vendor queries, shared by the client and the mirror.
//!
//! Each call opens a fresh connection, issues a single request, reads the
//! reply, and announces closure. Vendor locations are `host` or `host:port`
//! strings; a missing port falls back to the caller's default.

use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;

use crate::codec::{self, CodecError};
use crate::wire::{self, MirrorInfo, VendorRequest, WireError};

/// Give up on unresponsive servers rather than hanging a whole retrieval.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// `TcpStream::connect` with the protocol-wide connect timeout.
pub async fn connect(addr: &str) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        )),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("bad server location '{0}'")]
    BadLocation(String),
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("vendor refused: {0}")]
    Refused(String),
}

/// Split `host` or `host:port`, applying `default_port` when absent.
pub fn parse_location(location: &str, default_port: u16) -> Result<(String, u16), FetchError> {
    let mut parts = location.split(':');
    let host = parts.next().unwrap_or_default();
    if host.is_empty() {
        return Err(FetchError::BadLocation(location.to_string()));
    }
    let port = match parts.next() {
        Some(p) => p
            .parse()
            .map_err(|_| FetchError::BadLocation(location.to_string()))?,
        None => default_port,
    };
    if parts.next().is_some() {
        return Err(FetchError::BadLocation(location.to_string()));
    }
    Ok((host.to_string(), port))
}

/// Issue one request and return the raw reply.
pub async fn vendor_query(
    location: &str,
    default_port: u16,
    request: &VendorRequest,
) -> Result<Bytes, FetchError> {
    let (host, port) = parse_location(location, default_port)?;
    let addr = format!("{host}:{port}");
    let mut stream = connect(&addr)
        .await
        .map_err(|source| FetchError::Connect { addr, source })?;
    wire::send_message(&mut stream, &request.encode()).await?;
    let reply = wire::recv_message(&mut stream).await?;
    let _ = wire::send_close(&mut stream).await;
    Ok(reply)
}

/// Fetch the raw manifest bytes (unparsed; callers validate).
pub async fn retrieve_raw_manifest(
    location: &str,
    default_port: u16,
) -> Result<Bytes, FetchError> {
    vendor_query(location, default_port, &VendorRequest::GetManifest).await
}

/// Fetch and decode the current mirror list.
pub async fn retrieve_mirror_list(
    location: &str,
    default_port: u16,
) -> Result<Vec<MirrorInfo>, FetchError> {
    let raw = vendor_query(location, default_port, &VendorRequest::GetMirrorList).await?;
    Ok(codec::decode(&raw)?)
}

/// Advertise a mirror to the vendor. Anything but `OK` is a refusal.
pub async fn advertise_mirror(
    location: &str,
    default_port: u16,
    info: &MirrorInfo,
) -> Result<(), FetchError> {
    let payload = codec::encode(info)?;
    let reply = vendor_query(
        location,
        default_port,
        &VendorRequest::Advertise(payload),
    )
    .await?;
    if reply.as_ref() != wire::ADVERTISE_OK {
        return Err(FetchError::Refused(
            String::from_utf8_lossy(&reply).into_owned(),
        ));
    }
    Ok(())
}
