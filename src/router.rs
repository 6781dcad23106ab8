use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use tokio_util::sync::CancellationToken;

/// Which of the two bridged tracks a producer carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// A published media track registered with the routing engine.
///
/// The id is assigned by the router and opaque to the bridge. [closed] is
/// cancelled when the underlying transport goes away; the bridge watches it
/// to drop the producer from its slots.
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    pub id: String,
    pub kind: MediaKind,
    pub closed: CancellationToken,
}

/// How an egress endpoint learns where to send RTP
#[derive(Debug, Clone, Copy)]
pub enum RemoteAddr {
    /// Lock onto the source address of the first received packet
    AutoDetect,
    /// Send to a fixed, well-known address
    Fixed(SocketAddr),
}

/// Request for a plain (non-ICE, non-SRTP) RTP egress endpoint
#[derive(Debug, Clone)]
pub struct EndpointRequest {
    /// Address the router binds its side of the endpoint to
    pub listen_ip: IpAddr,
    /// Reuse the RTP port for the control channel (RTCP)
    pub rtcp_mux: bool,
    pub remote: RemoteAddr,
}

/// Codec the router negotiated for one consumer
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerCodec {
    pub payload_type: u8,
    /// e.g. "video/VP8" or "audio/opus"
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    /// Codec specific format parameters
    pub parameters: Vec<(String, String)>,
}

/// Capability surface of the media routing engine.
///
/// ICE/DTLS/SRTP, RTP routing and codec negotiation all live behind this
/// seam; the bridge only ever asks it for egress endpoints.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    async fn create_egress_endpoint(
        &self,
        request: EndpointRequest,
    ) -> Result<Box<dyn EgressEndpoint>>;
}

/// A plain RTP endpoint handing one producer's packets to a local process
#[async_trait]
pub trait EgressEndpoint: Send + Sync {
    /// Address the router side is bound to
    fn local_addr(&self) -> SocketAddr;

    /// Attach a consumer forwarding [producer_id] at its native codec.
    /// Consumers start paused; the caller resumes once the receiver is up.
    async fn consume(&self, producer_id: &str) -> Result<Box<dyn RtpConsumer>>;

    async fn close(&self);
}

#[async_trait]
pub trait RtpConsumer: Send + Sync {
    fn codec(&self) -> ConsumerCodec;

    async fn resume(&self) -> Result<()>;

    async fn close(&self);
}
