//! In-memory router and supervisor doubles for the controller tests.
//!
//! The fake supervisor counts concurrent conversions so tests can pin the
//! single-subprocess invariant down, and keeps every exit sender around so
//! tests can simulate a transcoder dying on its own.

use crate::error::BridgeError;
use crate::router::{
    ConsumerCodec, EgressEndpoint, EndpointRequest, MediaKind, MediaRouter, ProducerHandle,
    RtpConsumer,
};
use crate::transcode::{ExitCode, TranscodeHandle, TranscodeJob, TranscodeSupervisor};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub fn producer(id: &str, kind: MediaKind) -> ProducerHandle {
    ProducerHandle {
        id: id.to_string(),
        kind,
        closed: CancellationToken::new(),
    }
}

/// Producer ids starting with 'a' get the audio codec, everything else video
fn codec_for(producer_id: &str) -> ConsumerCodec {
    if producer_id.starts_with('a') {
        ConsumerCodec {
            payload_type: 100,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: vec![
                ("minptime".to_string(), "10".to_string()),
                ("useinbandfec".to_string(), "1".to_string()),
            ],
        }
    } else {
        ConsumerCodec {
            payload_type: 101,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: vec![],
        }
    }
}

#[derive(Default)]
pub struct RouterLog {
    pub endpoints_opened: AtomicUsize,
    pub endpoints_closed: AtomicUsize,
    pub consumers_opened: AtomicUsize,
    pub consumers_closed: AtomicUsize,
    pub resumed: AtomicUsize,
}

pub struct FakeRouter {
    pub log: Arc<RouterLog>,
    pub fail_consume: AtomicBool,
}

impl FakeRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(RouterLog::default()),
            fail_consume: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MediaRouter for FakeRouter {
    async fn create_egress_endpoint(
        &self,
        _request: EndpointRequest,
    ) -> Result<Box<dyn EgressEndpoint>> {
        self.log.endpoints_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEndpoint {
            log: self.log.clone(),
            fail_consume: self.fail_consume.load(Ordering::SeqCst),
        }))
    }
}

struct FakeEndpoint {
    log: Arc<RouterLog>,
    fail_consume: bool,
}

#[async_trait]
impl EgressEndpoint for FakeEndpoint {
    fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000)
    }

    async fn consume(&self, producer_id: &str) -> Result<Box<dyn RtpConsumer>> {
        if self.fail_consume {
            bail!("capability mismatch for producer {producer_id}");
        }
        self.log.consumers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConsumer {
            log: self.log.clone(),
            codec: codec_for(producer_id),
        }))
    }

    async fn close(&self) {
        self.log.endpoints_closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeConsumer {
    log: Arc<RouterLog>,
    codec: ConsumerCodec,
}

#[async_trait]
impl RtpConsumer for FakeConsumer {
    fn codec(&self) -> ConsumerCodec {
        self.codec.clone()
    }

    async fn resume(&self) -> Result<()> {
        self.log.resumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.log.consumers_closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct SupervisorLog {
    events: Mutex<Vec<&'static str>>,
    pub starts: AtomicUsize,
    pub live: AtomicIsize,
    pub max_live: AtomicIsize,
    exits: Mutex<Vec<Arc<watch::Sender<ExitCode>>>>,
}

impl SupervisorLog {
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    /// Make the most recent conversion's process "die" with [code]
    pub fn trigger_exit(&self, code: i32) {
        let exits = self.exits.lock().unwrap();
        let sender = exits.last().expect("no conversion was ever started");
        self.live.fetch_sub(1, Ordering::SeqCst);
        let _ = sender.send(Some(code));
    }
}

pub struct FakeSupervisor {
    pub log: Arc<SupervisorLog>,
    pub fail_start: AtomicBool,
}

impl FakeSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(SupervisorLog::default()),
            fail_start: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl TranscodeSupervisor for FakeSupervisor {
    async fn start(&self, _job: TranscodeJob) -> Result<Box<dyn TranscodeHandle>, BridgeError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(BridgeError::Spawn {
                binary: "fake".to_string(),
                reason: "injected spawn failure".to_string(),
            });
        }
        self.log.starts.fetch_add(1, Ordering::SeqCst);
        let live = self.log.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_live.fetch_max(live, Ordering::SeqCst);
        self.log.events.lock().unwrap().push("start");

        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);
        self.log.exits.lock().unwrap().push(exit_tx.clone());

        Ok(Box::new(FakeHandle {
            log: self.log.clone(),
            exit_tx,
            exit_rx,
        }))
    }
}

struct FakeHandle {
    log: Arc<SupervisorLog>,
    exit_tx: Arc<watch::Sender<ExitCode>>,
    exit_rx: watch::Receiver<ExitCode>,
}

#[async_trait]
impl TranscodeHandle for FakeHandle {
    fn exit_watch(&self) -> watch::Receiver<ExitCode> {
        self.exit_rx.clone()
    }

    async fn stop(&mut self) -> Result<()> {
        // stopping a process that already exited is a no-op
        if self.exit_rx.borrow().is_some() {
            return Ok(());
        }
        self.log.live.fetch_sub(1, Ordering::SeqCst);
        self.log.events.lock().unwrap().push("stop");
        let _ = self.exit_tx.send(Some(0));
        Ok(())
    }

    fn playlist(&self) -> PathBuf {
        PathBuf::from("/tmp/hls-bridge-test/live.m3u8")
    }
}
