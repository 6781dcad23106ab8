use crate::egress::RtpEndpoint;
use crate::router::MediaKind;
use itertools::Itertools;
use std::fmt::Write;
use std::net::IpAddr;

/// Build the session description binding the transcoder's two inputs to
/// the egress endpoints.
///
/// Pure and total: identical endpoint pairs synthesize identical bytes,
/// and any syntactically valid pair produces a document. Directionality is
/// receive-only from the transcoder's perspective.
pub fn synthesize(video: &RtpEndpoint, audio: &RtpEndpoint) -> String {
    let mut out = String::new();
    out.push_str("v=0\n");
    out.push_str("o=- 0 0 IN IP4 127.0.0.1\n");
    out.push_str("s=hls-bridge\n");
    out.push_str("t=0 0\n");
    media_section(&mut out, video);
    media_section(&mut out, audio);
    out
}

fn media_section(out: &mut String, ep: &RtpEndpoint) {
    let media = match ep.kind {
        MediaKind::Video => "video",
        MediaKind::Audio => "audio",
    };
    let _ = writeln!(out, "m={} {} RTP/AVP {}", media, ep.port, ep.payload_type);
    let _ = writeln!(out, "c=IN {} {}", addr_type(&ep.ip), ep.ip);
    match ep.kind {
        MediaKind::Video => {
            let _ = writeln!(out, "a=rtpmap:{} {}/{}", ep.payload_type, ep.codec, ep.clock_rate);
        }
        MediaKind::Audio => {
            let _ = writeln!(
                out,
                "a=rtpmap:{} {}/{}/{}",
                ep.payload_type,
                ep.codec,
                ep.clock_rate,
                ep.channels.unwrap_or(2)
            );
        }
    }
    if !ep.parameters.is_empty() {
        let params = ep
            .parameters
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .join(";");
        let _ = writeln!(out, "a=fmtp:{} {}", ep.payload_type, params);
    }
    out.push_str("a=recvonly\n");
}

fn addr_type(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    }
}
