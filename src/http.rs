use crate::bridge::{BridgeStatus, HlsBridge};
use crate::transcode::ffmpeg::PLAYLIST_NAME;
use anyhow::Result;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs::File;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

/// Serves the rolling HLS output plus the operator control surface.
#[derive(Clone)]
pub struct HttpServer {
    files_dir: PathBuf,
    bridge: HlsBridge,
}

impl HttpServer {
    pub fn new(files_dir: PathBuf, bridge: HlsBridge) -> Self {
        Self { files_dir, bridge }
    }

    /// Accept loop; runs until the listener fails
    pub async fn serve(self, listen: &str) -> Result<()> {
        let addr: SocketAddr = listen.parse()?;
        let listener = TcpListener::bind(&addr).await?;
        info!("http server listening on {}", addr);
        loop {
            let (socket, _) = listener.accept().await?;
            let io = TokioIo::new(socket);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = http1::Builder::new().serve_connection(io, server).await {
                    error!("Failed to handle request: {}", e);
                }
            });
        }
    }
}

impl Service<Request<Incoming>> for HttpServer {
    type Response = Response<BoxBody<Bytes, Self::Error>>;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        // operator control surface
        if path.starts_with("/api/") {
            let bridge = self.bridge.clone();
            let playlist = self.files_dir.join(PLAYLIST_NAME);
            return Box::pin(async move { api(bridge, playlist, method, &path).await });
        }

        // everything else maps into the output directory
        if path.contains("..") {
            return Box::pin(async move { empty(StatusCode::NOT_FOUND) });
        }
        let dst_path = self.files_dir.join(path.trim_start_matches('/'));
        Box::pin(async move {
            let Ok(f) = File::open(&dst_path).await else {
                return empty(StatusCode::NOT_FOUND);
            };
            match f.metadata().await {
                Ok(meta) if meta.is_file() => {}
                _ => return empty(StatusCode::NOT_FOUND),
            }

            let mut rsp = Response::builder()
                .header("server", "hls-bridge")
                .header("access-control-allow-origin", "*")
                .header("access-control-allow-headers", "*")
                .header("access-control-allow-methods", "HEAD, GET");
            if let Some(ct) = content_type(&dst_path) {
                rsp = rsp.header("content-type", ct);
            }
            if method == Method::HEAD {
                return Ok(rsp.body(BoxBody::default())?);
            }
            let f_stream = ReaderStream::new(f);
            let body =
                StreamBody::new(f_stream.map_ok(Frame::data).map_err(anyhow::Error::new)).boxed();
            Ok(rsp.body(body)?)
        })
    }
}

#[derive(Serialize)]
struct ApiStatus {
    #[serde(flatten)]
    bridge: BridgeStatus,
    playlist: Option<PlaylistInfo>,
}

#[derive(Serialize)]
struct PlaylistInfo {
    media_sequence: u64,
    segments: usize,
    target_duration: u64,
}

async fn api(
    bridge: HlsBridge,
    playlist: PathBuf,
    method: Method,
    path: &str,
) -> Result<Response<BoxBody<Bytes, anyhow::Error>>> {
    if method == Method::GET && path == "/api/status" {
        let status = ApiStatus {
            bridge: bridge.state(),
            playlist: playlist_info(&playlist).await,
        };
        return json(&status);
    }
    if method == Method::POST && path == "/api/restart" {
        bridge.restart();
        return empty(StatusCode::NO_CONTENT);
    }
    if method == Method::POST && path == "/api/reset" {
        bridge.reset();
        return empty(StatusCode::NO_CONTENT);
    }
    empty(StatusCode::NOT_FOUND)
}

/// What the live playlist currently holds, if it exists and parses
async fn playlist_info(path: &Path) -> Option<PlaylistInfo> {
    let data = tokio::fs::read(path).await.ok()?;
    match m3u8_rs::parse_media_playlist(&data) {
        Ok((_, pl)) => Some(PlaylistInfo {
            media_sequence: pl.media_sequence,
            segments: pl.segments.len(),
            target_duration: pl.target_duration,
        }),
        Err(_) => None,
    }
}

fn empty(status: StatusCode) -> Result<Response<BoxBody<Bytes, anyhow::Error>>> {
    Ok(Response::builder()
        .status(status)
        .header("server", "hls-bridge")
        .body(BoxBody::default())?)
}

fn json<T: Serialize>(value: &T) -> Result<Response<BoxBody<Bytes, anyhow::Error>>> {
    let data = serde_json::to_vec(value)?;
    Ok(Response::builder()
        .header("content-type", "application/json")
        .header("access-control-allow-origin", "*")
        .body(Full::new(Bytes::from(data)).map_err(|e| match e {}).boxed())?)
}

fn content_type(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => Some("application/vnd.apple.mpegurl"),
        Some("ts") => Some("video/mp2t"),
        Some("sdp") => Some("application/sdp"),
        Some("html") => Some("text/html"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hls_artifacts_get_streaming_content_types() {
        assert_eq!(
            content_type(Path::new("/out/live.m3u8")),
            Some("application/vnd.apple.mpegurl")
        );
        assert_eq!(
            content_type(Path::new("/out/seg_00001.ts")),
            Some("video/mp2t")
        );
        assert_eq!(content_type(Path::new("/out/unknown.bin")), None);
    }

    #[tokio::test]
    async fn playlist_info_reads_the_live_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PLAYLIST_NAME);
        std::fs::write(
            &path,
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:7\n#EXTINF:2.0,\nseg_00007.ts\n#EXTINF:2.0,\nseg_00008.ts\n",
        )
        .unwrap();

        let info = playlist_info(&path).await.unwrap();
        assert_eq!(info.media_sequence, 7);
        assert_eq!(info.segments, 2);
        assert_eq!(info.target_duration, 2);

        assert!(playlist_info(&dir.path().join("missing.m3u8"))
            .await
            .is_none());
    }
}
