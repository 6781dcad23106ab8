use super::{ExitCode, TranscodeHandle, TranscodeJob, TranscodeSupervisor};
use crate::error::BridgeError;
use crate::settings::TranscoderSettings;
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Playlist filename inside the output directory
pub const PLAYLIST_NAME: &str = "live.m3u8";
/// Segment filename pattern; numeric so the sliding window deletes cleanly
pub const SEGMENT_PATTERN: &str = "seg_%05d.ts";
/// Session description filename
pub const SDP_NAME: &str = "input.sdp";

/// Drives one ffmpeg process per conversion: cleans the output directory,
/// writes the session description and babysits the subprocess until exit.
pub struct FfmpegSupervisor {
    settings: TranscoderSettings,
    out_dir: PathBuf,
}

impl FfmpegSupervisor {
    pub fn new(settings: TranscoderSettings, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            out_dir: out_dir.into(),
        }
    }

    /// Create the output directory and delete playlist/segment/description
    /// leftovers from a previous run.
    async fn prepare_out_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.out_dir).await?;
        let mut entries = tokio::fs::read_dir(&self.out_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let stale = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("m3u8") | Some("ts") | Some("sdp")
            );
            if stale {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("failed to remove stale {}: {}", path.display(), e);
                }
            }
        }
        Ok(())
    }

    fn build_args(&self, sdp_path: &Path) -> Vec<String> {
        let s = &self.settings;
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostats".into(),
            "-loglevel".into(),
            "info".into(),
            // input: plain RTP described by the session description
            "-protocol_whitelist".into(),
            "file,udp,rtp".into(),
            "-f".into(),
            "sdp".into(),
            "-i".into(),
            sdp_path.display().to_string(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a:0".into(),
            // low latency re-encode; the browser codecs are not HLS friendly
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-tune".into(),
            "zerolatency".into(),
            "-profile:v".into(),
            "baseline".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-g".into(),
            "60".into(),
            "-b:v".into(),
            format!("{}k", s.video_bitrate_kbps),
            "-c:a".into(),
            "aac".into(),
            "-ar".into(),
            "48000".into(),
            "-ac".into(),
            "2".into(),
            "-b:a".into(),
            format!("{}k", s.audio_bitrate_kbps),
            // rolling window output, expired segments deleted by the muxer
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            s.segment_seconds.to_string(),
            "-hls_list_size".into(),
            s.window_size.to_string(),
            "-hls_flags".into(),
            "delete_segments".into(),
            "-hls_segment_filename".into(),
            self.out_dir.join(SEGMENT_PATTERN).display().to_string(),
        ];
        args.push(self.out_dir.join(PLAYLIST_NAME).display().to_string());
        args
    }

    fn spawn_err(&self, e: impl std::fmt::Display) -> BridgeError {
        BridgeError::Spawn {
            binary: self.settings.binary.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl TranscodeSupervisor for FfmpegSupervisor {
    async fn start(&self, job: TranscodeJob) -> Result<Box<dyn TranscodeHandle>, BridgeError> {
        self.prepare_out_dir().await.map_err(|e| self.spawn_err(e))?;

        // written after cleaning so it cannot be swept away itself
        let sdp_path = self.out_dir.join(SDP_NAME);
        tokio::fs::write(&sdp_path, job.sdp.as_bytes())
            .await
            .map_err(|e| self.spawn_err(e))?;

        let args = self.build_args(&sdp_path);
        debug!("[{}] {} {}", job.id, self.settings.binary, args.join(" "));

        let mut child = Command::new(&self.settings.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_err(e))?;

        let pid = child.id();
        info!("[{}] transcoder started (pid {:?})", job.id, pid);

        // diagnostics go to the log, not to the terminal
        if let Some(stderr) = child.stderr.take() {
            let id = job.id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "ffmpeg", "[{id}] {line}");
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let id = job.id;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        let code = match status {
                            Ok(s) => s.code().unwrap_or(-1),
                            Err(e) => {
                                warn!("[{id}] failed waiting on transcoder: {e}");
                                -1
                            }
                        };
                        info!("[{id}] transcoder exited with status {code}");
                        let _ = exit_tx.send(Some(code));
                        break;
                    }
                    Some(_) = kill_rx.recv() => {
                        if let Err(e) = child.start_kill() {
                            warn!("[{id}] failed to kill transcoder: {e}");
                        }
                    }
                }
            }
        });

        Ok(Box::new(FfmpegHandle {
            id: job.id,
            pid,
            exit_rx,
            kill_tx,
            stop_timeout: self.settings.stop_timeout(),
            playlist: self.out_dir.join(PLAYLIST_NAME),
        }))
    }
}

pub struct FfmpegHandle {
    id: Uuid,
    pid: Option<u32>,
    exit_rx: watch::Receiver<ExitCode>,
    kill_tx: mpsc::Sender<()>,
    stop_timeout: Duration,
    playlist: PathBuf,
}

impl FfmpegHandle {
    async fn wait_exit(&mut self) {
        if self.exit_rx.borrow().is_some() {
            return;
        }
        let _ = self.exit_rx.changed().await;
    }
}

#[async_trait]
impl TranscodeHandle for FfmpegHandle {
    fn exit_watch(&self) -> watch::Receiver<ExitCode> {
        self.exit_rx.clone()
    }

    async fn stop(&mut self) -> Result<()> {
        if self.exit_rx.borrow().is_some() {
            return Ok(());
        }
        match self.pid {
            Some(pid) => {
                // polite first; the muxer gets to finalize the playlist
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if rc != 0 {
                    warn!(
                        "[{}] SIGTERM failed: {}",
                        self.id,
                        std::io::Error::last_os_error()
                    );
                }
            }
            None => {
                let _ = self.kill_tx.send(()).await;
            }
        }
        match tokio::time::timeout(self.stop_timeout, self.wait_exit()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(
                    "[{}] transcoder ignored SIGTERM for {:?}, killing it",
                    self.id, self.stop_timeout
                );
                let _ = self.kill_tx.send(()).await;
                self.wait_exit().await;
                Ok(())
            }
        }
    }

    fn playlist(&self) -> PathBuf {
        self.playlist.clone()
    }
}
