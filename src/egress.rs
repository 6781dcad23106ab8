use crate::error::BridgeError;
use crate::router::{
    ConsumerCodec, EgressEndpoint, EndpointRequest, MediaKind, MediaRouter, ProducerHandle,
    RemoteAddr, RtpConsumer,
};
use crate::settings::RtpSettings;
use anyhow::{Context, Result};
use log::debug;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// The tuple one transcoder input is described by: where the RTP arrives
/// and what is inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct RtpEndpoint {
    pub kind: MediaKind,
    pub ip: IpAddr,
    pub port: u16,
    pub payload_type: u8,
    /// Codec name as it appears in an rtpmap line, e.g. "VP8"
    pub codec: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    pub parameters: Vec<(String, String)>,
}

/// One provisioned track: the descriptive tuple plus the live router
/// objects needed for resume and symmetric teardown.
pub struct ProvisionedTrack {
    pub rtp: RtpEndpoint,
    endpoint: Box<dyn EgressEndpoint>,
    consumer: Box<dyn RtpConsumer>,
}

impl std::fmt::Debug for ProvisionedTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionedTrack")
            .field("rtp", &self.rtp)
            .finish_non_exhaustive()
    }
}

impl ProvisionedTrack {
    /// Unpause the consumer so media starts flowing to the endpoint
    pub async fn resume(&self) -> Result<()> {
        self.consumer.resume().await
    }

    /// Close consumer and endpoint
    pub async fn release(self) {
        self.consumer.close().await;
        self.endpoint.close().await;
    }
}

/// Creates an RTP egress endpoint + paused consumer per track of one
/// conversion attempt.
pub struct EndpointProvisioner {
    router: Arc<dyn MediaRouter>,
    rtp: RtpSettings,
}

impl EndpointProvisioner {
    pub fn new(router: Arc<dyn MediaRouter>, rtp: RtpSettings) -> Self {
        Self { router, rtp }
    }

    /// Fixed address the transcoder reads this kind from
    pub fn destination(&self, kind: MediaKind) -> SocketAddr {
        let port = match kind {
            MediaKind::Video => self.rtp.video_port,
            MediaKind::Audio => self.rtp.audio_port,
        };
        SocketAddr::new(self.rtp.listen_ip, port)
    }

    /// Provision the endpoint and consumer for one producer and derive the
    /// endpoint tuple from the codec the router negotiated.
    pub async fn provision(
        &self,
        producer: &ProducerHandle,
    ) -> Result<ProvisionedTrack, BridgeError> {
        self.try_provision(producer)
            .await
            .map_err(|e| BridgeError::EndpointProvision {
                producer_id: producer.id.clone(),
                kind: producer.kind,
                reason: format!("{e:#}"),
            })
    }

    async fn try_provision(&self, producer: &ProducerHandle) -> Result<ProvisionedTrack> {
        let dest = self.destination(producer.kind);
        let endpoint = self
            .router
            .create_egress_endpoint(EndpointRequest {
                listen_ip: self.rtp.listen_ip,
                rtcp_mux: self.rtp.rtcp_mux,
                remote: RemoteAddr::Fixed(dest),
            })
            .await
            .context("create endpoint")?;
        debug!(
            "egress endpoint for {} producer {} bound on {}, sending to {}",
            producer.kind,
            producer.id,
            endpoint.local_addr(),
            dest
        );

        let consumer = match endpoint.consume(&producer.id).await.context("create consumer") {
            Ok(c) => c,
            Err(e) => {
                endpoint.close().await;
                return Err(e);
            }
        };

        let codec = consumer.codec();
        let rtp = RtpEndpoint {
            kind: producer.kind,
            ip: dest.ip(),
            port: dest.port(),
            payload_type: codec.payload_type,
            codec: codec_name(&codec),
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            parameters: codec.parameters.clone(),
        };
        Ok(ProvisionedTrack {
            rtp,
            endpoint,
            consumer,
        })
    }
}

/// "video/VP8" -> "VP8"
fn codec_name(codec: &ConsumerCodec) -> String {
    codec
        .mime_type
        .split_once('/')
        .map(|(_, subtype)| subtype.to_string())
        .unwrap_or_else(|| codec.mime_type.clone())
}
