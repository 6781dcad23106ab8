use crate::error::BridgeError;
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::watch;
use uuid::Uuid;

pub mod ffmpeg;

/// Everything the supervisor needs to start one conversion
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    /// Conversion attempt id, carried through log lines
    pub id: Uuid,
    /// Session description binding the inputs to the egress endpoints
    pub sdp: String,
}

/// Exit code of the subprocess, None while it is still running.
/// Signal terminations surface as -1.
pub type ExitCode = Option<i32>;

/// Spawns and terminates transcoder subprocesses.
///
/// Restart policy does not live here. The supervisor observes exits and
/// reports them; the bridge controller decides what happens next.
#[async_trait]
pub trait TranscodeSupervisor: Send + Sync {
    async fn start(&self, job: TranscodeJob) -> Result<Box<dyn TranscodeHandle>, BridgeError>;
}

/// One live transcoder subprocess
#[async_trait]
pub trait TranscodeHandle: Send + Sync {
    /// Exit observation; the value flips from None exactly once
    fn exit_watch(&self) -> watch::Receiver<ExitCode>;

    /// Terminate the subprocess and wait until it is gone. Calling this on
    /// an already exited process is a no-op.
    async fn stop(&mut self) -> Result<()>;

    /// The playlist this conversion writes
    fn playlist(&self) -> PathBuf;
}
