use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Where to store output (static files)
    pub output_dir: String,

    /// Binding address for the http server serving files from [output_dir]
    pub listen_http: String,

    /// Plain RTP egress addressing
    #[serde(default)]
    pub rtp: RtpSettings,

    /// External transcoder invocation
    #[serde(default)]
    pub transcoder: TranscoderSettings,

    /// Controller timing knobs
    #[serde(default)]
    pub bridge: BridgeSettings,
}

impl Settings {
    /// Load from a YAML file, with APP_* environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("APP"))
            .build()?;
        Ok(builder.try_deserialize()?)
    }
}

/// Fixed addressing for the two RTP legs between router and transcoder.
///
/// The ports are well-known on purpose: exactly one conversion may be live
/// at a time, and the controller enforces that before they get bound again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpSettings {
    /// Address the egress endpoints bind to and the transcoder listens on
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,

    /// RTP port the transcoder reads video from
    #[serde(default = "default_video_port")]
    pub video_port: u16,

    /// RTP port the transcoder reads audio from
    #[serde(default = "default_audio_port")]
    pub audio_port: u16,

    /// Reuse each RTP port for its control channel
    #[serde(default = "default_true")]
    pub rtcp_mux: bool,
}

impl Default for RtpSettings {
    fn default() -> Self {
        Self {
            listen_ip: default_listen_ip(),
            video_port: default_video_port(),
            audio_port: default_audio_port(),
            rtcp_mux: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderSettings {
    /// Transcoder binary, resolved via PATH when not absolute
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Segment length in seconds
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: f32,

    /// Number of segments kept in the playlist sliding window
    #[serde(default = "default_window_size")]
    pub window_size: u16,

    /// Video re-encode target bitrate in kbps
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate_kbps: u32,

    /// Audio re-encode target bitrate in kbps
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,

    /// How long a termination signal may go unanswered before the
    /// subprocess is killed outright
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl TranscoderSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for TranscoderSettings {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            segment_seconds: default_segment_seconds(),
            window_size: default_window_size(),
            video_bitrate_kbps: default_video_bitrate(),
            audio_bitrate_kbps: default_audio_bitrate(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// How long producer registrations are coalesced before a start attempt
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Upper bound on waiting for the RTP ports to be released
    #[serde(default = "default_port_wait_ms")]
    pub port_wait_ms: u64,
}

impl BridgeSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn port_wait(&self) -> Duration {
        Duration::from_millis(self.port_wait_ms)
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            port_wait_ms: default_port_wait_ms(),
        }
    }
}

fn default_listen_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_video_port() -> u16 {
    5004
}

fn default_audio_port() -> u16 {
    5006
}

fn default_true() -> bool {
    true
}

fn default_binary() -> String {
    "ffmpeg".to_string()
}

fn default_segment_seconds() -> f32 {
    2.0
}

fn default_window_size() -> u16 {
    5
}

fn default_video_bitrate() -> u32 {
    2000
}

fn default_audio_bitrate() -> u32 {
    128
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_port_wait_ms() -> u64 {
    2000
}
