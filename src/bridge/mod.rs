//! The bridge controller: tracks which producers currently represent the
//! stream's video and audio, and drives conversions in response to
//! producer churn and operator commands.
//!
//! All state lives in one task. Commands are handled strictly in order and
//! every suspension happens inside the handler, so a second start can
//! never overlap an in-flight one and a stop always lets an in-flight
//! start settle before tearing its result down.

use crate::egress::{EndpointProvisioner, ProvisionedTrack};
use crate::error::BridgeError;
use crate::ports;
use crate::router::{MediaKind, MediaRouter, ProducerHandle};
use crate::sdp;
use crate::settings::Settings;
use crate::transcode::{ExitCode, TranscodeHandle, TranscodeJob, TranscodeSupervisor};
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug)]
pub enum BridgeCommand {
    /// A producer was published for one of the two slots
    SetProducer(ProducerHandle),
    /// A producer went away; the id guards against clearing a replacement
    ClearProducer { kind: MediaKind, id: String },
    /// Stop the conversion, keep tracked producers
    Stop,
    /// Operator escape hatch: stop, then start again right away
    Restart,
    /// Clear both producer slots and stop
    Reset,
    /// Stop everything and end the controller task
    Shutdown,
}

/// Operator-visible snapshot, published on every state change
#[derive(Debug, Clone, Default, Serialize)]
pub struct BridgeStatus {
    pub running: bool,
    pub has_video: bool,
    pub has_audio: bool,
    pub video_id: Option<String>,
    pub audio_id: Option<String>,
    /// When the live conversion started
    pub started_at: Option<DateTime<Utc>>,
}

/// Cheap clonable handle to the controller task
#[derive(Clone)]
pub struct HlsBridge {
    tx: UnboundedSender<BridgeCommand>,
    status: watch::Receiver<BridgeStatus>,
}

impl HlsBridge {
    /// Spawn the controller task. The join handle resolves once
    /// [BridgeCommand::Shutdown] was processed.
    pub fn spawn(
        settings: &Settings,
        router: Arc<dyn MediaRouter>,
        supervisor: Arc<dyn TranscodeSupervisor>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = unbounded_channel();
        let (status_tx, status_rx) = watch::channel(BridgeStatus::default());
        let controller = Controller {
            provisioner: EndpointProvisioner::new(router, settings.rtp.clone()),
            supervisor,
            debounce: settings.bridge.debounce(),
            port_wait: settings.bridge.port_wait(),
            tx: tx.clone(),
            rx,
            status_tx,
            video: None,
            audio: None,
            active: None,
            deadline: None,
            shutdown: CancellationToken::new(),
        };
        let task = tokio::spawn(controller.run());
        (
            Self {
                tx,
                status: status_rx,
            },
            task,
        )
    }

    pub fn set_producer(&self, producer: ProducerHandle) {
        let _ = self.tx.send(BridgeCommand::SetProducer(producer));
    }

    pub fn clear_producer(&self, kind: MediaKind, id: &str) {
        let _ = self.tx.send(BridgeCommand::ClearProducer {
            kind,
            id: id.to_string(),
        });
    }

    pub fn stop(&self) {
        let _ = self.tx.send(BridgeCommand::Stop);
    }

    pub fn restart(&self) {
        let _ = self.tx.send(BridgeCommand::Restart);
    }

    pub fn reset(&self) {
        let _ = self.tx.send(BridgeCommand::Reset);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(BridgeCommand::Shutdown);
    }

    /// Current state; never blocks on an in-flight operation
    pub fn state(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }
}

struct ActiveConversion {
    id: Uuid,
    video: ProvisionedTrack,
    audio: ProvisionedTrack,
    handle: Box<dyn TranscodeHandle>,
    exit: watch::Receiver<ExitCode>,
    started_at: DateTime<Utc>,
}

enum Tick {
    Cmd(Option<BridgeCommand>),
    Debounce,
    Exited,
}

struct Controller {
    provisioner: EndpointProvisioner,
    supervisor: Arc<dyn TranscodeSupervisor>,
    debounce: Duration,
    port_wait: Duration,
    tx: UnboundedSender<BridgeCommand>,
    rx: UnboundedReceiver<BridgeCommand>,
    status_tx: watch::Sender<BridgeStatus>,
    video: Option<ProducerHandle>,
    audio: Option<ProducerHandle>,
    active: Option<ActiveConversion>,
    /// Single debounce slot, overwritten on every producer event
    deadline: Option<Instant>,
    shutdown: CancellationToken,
}

impl Controller {
    async fn run(mut self) {
        loop {
            let tick = {
                let deadline = self.deadline;
                let exit = self.active.as_mut().map(|a| &mut a.exit);
                let has_exit = exit.is_some();
                tokio::select! {
                    cmd = self.rx.recv() => Tick::Cmd(cmd),
                    _ = async { tokio::time::sleep_until(deadline.unwrap()).await },
                        if deadline.is_some() => Tick::Debounce,
                    _ = async { let _ = exit.unwrap().changed().await; },
                        if has_exit => Tick::Exited,
                }
            };
            match tick {
                Tick::Cmd(None) => {
                    self.stop_conversion().await;
                    break;
                }
                Tick::Cmd(Some(cmd)) => {
                    let quit = matches!(cmd, BridgeCommand::Shutdown);
                    self.handle(cmd).await;
                    if quit {
                        break;
                    }
                }
                Tick::Debounce => {
                    self.deadline = None;
                    self.try_start().await;
                }
                Tick::Exited => self.on_transcoder_exit().await,
            }
        }
        self.shutdown.cancel();
        info!("bridge controller stopped");
    }

    async fn handle(&mut self, cmd: BridgeCommand) {
        match cmd {
            BridgeCommand::SetProducer(p) => self.set_producer(p).await,
            BridgeCommand::ClearProducer { kind, id } => self.clear_producer(kind, &id).await,
            BridgeCommand::Stop => {
                self.deadline = None;
                self.stop_conversion().await;
            }
            BridgeCommand::Restart => {
                info!("restart requested");
                self.deadline = None;
                self.stop_conversion().await;
                self.try_start().await;
            }
            BridgeCommand::Reset => {
                info!("resetting bridge state");
                self.video = None;
                self.audio = None;
                self.deadline = None;
                self.stop_conversion().await;
                self.publish();
            }
            BridgeCommand::Shutdown => {
                self.deadline = None;
                self.stop_conversion().await;
            }
        }
    }

    async fn set_producer(&mut self, producer: ProducerHandle) {
        let slot = match producer.kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        };
        let replaced = slot.as_ref().map(|p| p.id != producer.id).unwrap_or(false);
        if replaced && self.active.is_some() {
            // never leave a transcoder reading a track that is going away
            self.stop_conversion().await;
        }
        info!("tracking {} producer {}", producer.kind, producer.id);
        self.watch_closure(&producer);
        match producer.kind {
            MediaKind::Video => self.video = Some(producer),
            MediaKind::Audio => self.audio = Some(producer),
        }
        // coalesce near-simultaneous publishes into one start attempt
        self.deadline = Some(Instant::now() + self.debounce);
        self.publish();
    }

    /// Turn the producer's closure into a command, so it goes through the
    /// same ordered queue as everything else and cannot race a start.
    fn watch_closure(&self, producer: &ProducerHandle) {
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        let closed = producer.closed.clone();
        let kind = producer.kind;
        let id = producer.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {
                    let _ = tx.send(BridgeCommand::ClearProducer { kind, id });
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    async fn clear_producer(&mut self, kind: MediaKind, id: &str) {
        let slot = match kind {
            MediaKind::Video => &mut self.video,
            MediaKind::Audio => &mut self.audio,
        };
        match slot {
            Some(p) if p.id == id => {}
            // stale closure event for a producer that was replaced
            _ => return,
        }
        info!("{} producer {} went away", kind, id);
        *slot = None;
        if self.active.is_some() {
            // a conversion cannot outlive either of its tracks
            self.stop_conversion().await;
        }
        self.publish();
    }

    /// Start a conversion if both tracks are present and none is live
    async fn try_start(&mut self) {
        if self.active.is_some() {
            return;
        }
        let (video, audio) = match (&self.video, &self.audio) {
            (Some(v), Some(a)) => (v.clone(), a.clone()),
            _ => return,
        };
        let id = Uuid::new_v4();
        info!(
            "[{id}] starting conversion (video={}, audio={})",
            video.id, audio.id
        );
        match self.start_conversion(id, &video, &audio).await {
            Ok(active) => {
                info!("[{id}] conversion running");
                self.active = Some(active);
                self.publish();
            }
            Err(e) => {
                // not retried here; the next producer event or an operator
                // restart gets another attempt
                error!(
                    "[{id}] start failed (video={}, audio={}): {e:#}",
                    video.id, audio.id
                );
                self.publish();
            }
        }
    }

    async fn start_conversion(
        &mut self,
        id: Uuid,
        video: &ProducerHandle,
        audio: &ProducerHandle,
    ) -> Result<ActiveConversion> {
        // the fixed RTP ports must be fully released by any previous run
        for kind in [MediaKind::Video, MediaKind::Audio] {
            let addr = self.provisioner.destination(kind);
            if !ports::await_release(addr, self.port_wait).await {
                warn!("[{id}] continuing although {addr} looks busy");
            }
        }

        let vtrack = self.provisioner.provision(video).await?;
        let atrack = match self.provisioner.provision(audio).await {
            Ok(t) => t,
            Err(e) => {
                vtrack.release().await;
                return Err(e.into());
            }
        };

        let description = sdp::synthesize(&vtrack.rtp, &atrack.rtp);
        let mut handle = match self
            .supervisor
            .start(TranscodeJob {
                id,
                sdp: description,
            })
            .await
        {
            Ok(h) => h,
            Err(e) => {
                vtrack.release().await;
                atrack.release().await;
                return Err(e.into());
            }
        };

        // packets flowing before the transcoder binds its ports are lost,
        // which RTP tolerates; the stream locks in on the next keyframe
        let resumed = async {
            vtrack.resume().await?;
            atrack.resume().await
        }
        .await;
        if let Err(e) = resumed {
            if let Err(stop_err) = handle.stop().await {
                warn!("[{id}] {}", BridgeError::Teardown(format!("{stop_err:#}")));
            }
            vtrack.release().await;
            atrack.release().await;
            return Err(e.context("resume consumers"));
        }

        let exit = handle.exit_watch();
        Ok(ActiveConversion {
            id,
            video: vtrack,
            audio: atrack,
            handle,
            exit,
            started_at: Utc::now(),
        })
    }

    /// Stop the live conversion and release its endpoints. Idempotent.
    async fn stop_conversion(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        info!("[{}] stopping conversion", active.id);
        let mut handle = active.handle;
        if let Err(e) = handle.stop().await {
            warn!("[{}] {}", active.id, BridgeError::Teardown(format!("{e:#}")));
        }
        active.video.release().await;
        active.audio.release().await;
        self.publish();
    }

    async fn on_transcoder_exit(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let code = (*active.exit.borrow()).unwrap_or(-1);
        warn!(
            "[{}] transcoder exited on its own (status {code}); waiting for operator or producer churn",
            active.id
        );
        let mut handle = active.handle;
        if let Err(e) = handle.stop().await {
            warn!("[{}] {}", active.id, BridgeError::Teardown(format!("{e:#}")));
        }
        active.video.release().await;
        active.audio.release().await;
        self.publish();
    }

    fn publish(&self) {
        let status = BridgeStatus {
            running: self.active.is_some(),
            has_video: self.video.is_some(),
            has_audio: self.audio.is_some(),
            video_id: self.video.as_ref().map(|p| p.id.clone()),
            audio_id: self.audio.as_ref().map(|p| p.id.clone()),
            started_at: self.active.as_ref().map(|a| a.started_at),
        };
        let _ = self.status_tx.send(status);
    }
}
