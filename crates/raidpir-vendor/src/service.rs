//! Vendor request handling.
//!
//! Every connection carries exactly one request. `GET MANIFEST` answers the
//! raw manifest bytes as distributed; `GET MIRRORLIST` sweeps and serializes
//! the registry; `MIRRORADVERTISE` validates and upserts. Validation
//! failures answer a specific error string and drop the connection.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use raidpir_core::codec;
use raidpir_core::wire::{self, MirrorInfo, VendorRequest, WireError};

use crate::registry::MirrorRegistry;

pub struct VendorService {
    raw_manifest: Vec<u8>,
    registry: MirrorRegistry,
    /// Largest serialized mirror info we accept.
    max_mirror_info: usize,
    /// Require the advertised ip to equal the connecting peer's address.
    check_mirror_ip: bool,
}

impl VendorService {
    pub fn new(
        raw_manifest: Vec<u8>,
        registry: MirrorRegistry,
        max_mirror_info: usize,
        check_mirror_ip: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            raw_manifest,
            registry,
            max_mirror_info,
            check_mirror_ip,
        })
    }

    pub fn registry(&self) -> &MirrorRegistry {
        &self.registry
    }

    /// Accept loop: one short-lived task per request.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((mut stream, peer)) => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        let (reader, writer) = stream.split();
                        if let Err(err) =
                            service.handle_request(reader, writer, Some(peer.ip())).await
                        {
                            tracing::debug!(%peer, error = %err, "request failed");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                }
            }
        }
    }

    /// Serve one request. Generic over the transport for in-process tests.
    pub async fn handle_request<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        peer_ip: Option<IpAddr>,
    ) -> Result<(), WireError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let raw = wire::recv_message(&mut reader).await?;
        let request = match VendorRequest::parse(&raw) {
            Ok(request) => request,
            Err(_) => {
                return wire::send_message(&mut writer, b"Invalid request type").await;
            }
        };
        match request {
            VendorRequest::GetManifest => {
                tracing::info!(peer = ?peer_ip, "manifest request");
                wire::send_message(&mut writer, &self.raw_manifest).await
            }
            VendorRequest::GetMirrorList => {
                let mirrors = self.registry.live_mirrors();
                tracing::info!(peer = ?peer_ip, mirrors = mirrors.len(), "mirrorlist request");
                let reply = codec::encode(&mirrors).expect("mirror list always encodes");
                wire::send_message(&mut writer, &reply).await
            }
            VendorRequest::Advertise(payload) => {
                let reply = self.validate_advertisement(&payload, peer_ip);
                wire::send_message(&mut writer, reply.as_bytes()).await
            }
            VendorRequest::Hello => wire::send_message(&mut writer, wire::VENDOR_HI).await,
        }
    }

    /// Validate a mirror advertisement; the returned string is the reply.
    fn validate_advertisement(&self, payload: &[u8], peer_ip: Option<IpAddr>) -> String {
        if payload.len() > self.max_mirror_info {
            tracing::warn!(bytes = payload.len(), "mirrorinfo too large");
            return "Error, mirrorinfo too large!".to_string();
        }
        let info: MirrorInfo = match codec::decode(payload) {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(error = %err, "cannot unpack mirrorinfo");
                return "Error, mirrorinfo has an invalid format.".to_string();
            }
        };
        if self.check_mirror_ip {
            let advertised: Option<IpAddr> = info.ip.parse().ok();
            if advertised.is_none() || advertised != peer_ip {
                tracing::warn!(advertised = %info.ip, peer = ?peer_ip, "mirrorinfo from the wrong IP");
                return "Error, must provide mirrorinfo from the mirror's IP".to_string();
            }
        }
        self.registry.upsert(info);
        "OK".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn service(check_ip: bool) -> Arc<VendorService> {
        VendorService::new(
            b"rawmanifest".to_vec(),
            MirrorRegistry::new(Duration::from_secs(300)),
            10240,
            check_ip,
        )
    }

    async fn call(service: &VendorService, request: &VendorRequest) -> Vec<u8> {
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let (reader, writer) = tokio::io::split(server);
        wire::send_message(&mut client, &request.encode()).await.unwrap();
        service
            .handle_request(reader, writer, Some("10.0.0.1".parse().unwrap()))
            .await
            .unwrap();
        wire::recv_message(&mut client).await.unwrap().to_vec()
    }

    fn advertise_payload(ip: &str, port: u16) -> Vec<u8> {
        codec::encode(&MirrorInfo {
            ip: ip.to_string(),
            port,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn manifest_and_hello() {
        let service = service(false);
        assert_eq!(
            call(&service, &VendorRequest::GetManifest).await,
            b"rawmanifest"
        );
        assert_eq!(call(&service, &VendorRequest::Hello).await, b"VENDORHI!");
    }

    #[tokio::test]
    async fn advertise_then_list() {
        let service = service(false);
        let reply = call(
            &service,
            &VendorRequest::Advertise(advertise_payload("10.0.0.1", 62294)),
        )
        .await;
        assert_eq!(reply, b"OK");

        let raw = call(&service, &VendorRequest::GetMirrorList).await;
        let mirrors: Vec<MirrorInfo> = codec::decode(&raw).unwrap();
        assert_eq!(mirrors.len(), 1);
        assert_eq!(mirrors[0].port, 62294);
    }

    #[tokio::test]
    async fn oversized_advertisement_is_refused() {
        let service = VendorService::new(
            Vec::new(),
            MirrorRegistry::new(Duration::from_secs(300)),
            8,
            false,
        );
        let reply = call(
            &service,
            &VendorRequest::Advertise(advertise_payload("10.0.0.1", 62294)),
        )
        .await;
        assert_eq!(reply, b"Error, mirrorinfo too large!");
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn undecodable_advertisement_is_refused() {
        let service = service(false);
        let reply = call(&service, &VendorRequest::Advertise(vec![0xc1, 0x00])).await;
        assert_eq!(reply, b"Error, mirrorinfo has an invalid format.");
    }

    #[tokio::test]
    async fn mismatched_ip_is_refused_when_checking() {
        let service = service(true);
        let reply = call(
            &service,
            &VendorRequest::Advertise(advertise_payload("10.9.9.9", 62294)),
        )
        .await;
        assert_eq!(reply, b"Error, must provide mirrorinfo from the mirror's IP");

        // matching IP passes
        let reply = call(
            &service,
            &VendorRequest::Advertise(advertise_payload("10.0.0.1", 62294)),
        )
        .await;
        assert_eq!(reply, b"OK");
    }

    #[tokio::test]
    async fn unknown_request_is_rejected() {
        let service = service(false);
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let (reader, writer) = tokio::io::split(server);
        wire::send_message(&mut client, b"DELETE EVERYTHING").await.unwrap();
        service.handle_request(reader, writer, None).await.unwrap();
        assert_eq!(
            wire::recv_message(&mut client).await.unwrap().to_vec(),
            b"Invalid request type"
        );
    }
}
