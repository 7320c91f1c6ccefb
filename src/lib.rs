pub mod browser;
pub mod capture;
pub mod channels;
pub mod config;
pub mod dom;
pub mod error;
pub mod guide;
pub mod manager;
pub mod metrics;
pub mod tuner;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use channels::Channel;
use config::Settings;
use guide::GuideClient;
use manager::{SystemStatus, TunerManager};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct AppState {
    pub manager: Arc<TunerManager>,
    pub settings: Arc<RwLock<Settings>>,
    pub guide: GuideClient,
}

pub fn create_app(manager: Arc<TunerManager>, settings: Settings, guide: GuideClient) -> Router {
    let state = Arc::new(AppState {
        manager,
        settings: Arc::new(RwLock::new(settings)),
        guide,
    });

    Router::new()
        .route("/playlist.m3u", get(playlist_handler))
        .route("/stream/{channel_id}", get(stream_handler))
        .route(
            "/hls/{tuner_id}/playlist.m3u8",
            get(hls_playlist_handler).head(hls_playlist_handler),
        )
        .route(
            "/hls/{tuner_id}/{segment}",
            get(hls_segment_handler).head(hls_segment_handler),
        )
        .route("/api/status", get(status_handler))
        .route("/api/ffmpeg/kill", post(kill_ffmpeg_handler))
        .route("/metrics", get(metrics_handler))
        .route("/tve/directv/epg/refresh", post(epg_refresh_handler))
        .route(
            "/api/settings",
            get(get_settings_handler).post(post_settings_handler),
        )
        .fallback(fallback_handler)
        .with_state(state)
}

async fn fallback_handler(method: Method, uri: axum::http::Uri) -> impl IntoResponse {
    info!("HTTP 404: method={} uri={}", method, uri);
    (StatusCode::NOT_FOUND, "Not found")
}

fn build_m3u(channels: &[Channel], base_url: &str) -> String {
    let mut out = String::from("#EXTM3U\n");
    for channel in channels {
        out.push_str(&format!(
            "#EXTINF:-1 tvg-id=\"{}\" tvg-chno=\"{}\",{}\n{}/stream/{}\n",
            channel.id, channel.number, channel.display_name, base_url.trim_end_matches('/'), channel.id
        ));
    }
    out
}

async fn playlist_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let base_url = format!("http://{}", host);
    let channels = state.manager.channels();
    let body = build_m3u(&channels, &base_url);
    (
        [("Content-Type", "application/vnd.apple.mpegurl")],
        body,
    )
}

struct GuardedStream {
    _guard: manager::TunerClientGuard,
    inner: Pin<Box<dyn futures::Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
    channel_id: String,
    last_log_time: Instant,
    bytes_since_last_log: usize,
}

impl futures::Stream for GuardedStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let res = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(ref bytes))) = res {
            self.bytes_since_last_log += bytes.len();
            let elapsed = self.last_log_time.elapsed();
            if elapsed >= Duration::from_secs(5) {
                let rate_kb = (self.bytes_since_last_log as f64 / elapsed.as_secs_f64()) / 1024.0;
                info!("stream bandwidth: channel_id={} rate={:.2} KB/s", self.channel_id, rate_kb);
                self.last_log_time = Instant::now();
                self.bytes_since_last_log = 0;
            }
        }
        res
    }
}

async fn stream_handler(
    Path(channel_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> axum::response::Response {
    let tuner = match state.manager.acquire(&channel_id).await {
        Ok(t) => t,
        Err(e) => return e.into_response(),
    };

    let (header, rx, guard) = match state.manager.add_client(&tuner).await {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };

    let channel_id_for_log = channel_id.clone();
    let broadcast_stream = futures::stream::unfold(rx, move |mut rx| {
        let channel_id = channel_id_for_log.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok(bytes) => return Some((Ok::<_, std::io::Error>(bytes), rx)),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("stream lagged: channel_id={} skipped={}", channel_id, skipped);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        warn!("stream ended: channel_id={}", channel_id);
                        return None;
                    }
                }
            }
        }
    });

    let stream: Pin<Box<dyn futures::Stream<Item = Result<Bytes, std::io::Error>> + Send>> = match header {
        Some(header) => Box::pin(
            futures::stream::once(async move { Ok::<_, std::io::Error>(header) }).chain(broadcast_stream),
        ),
        None => Box::pin(broadcast_stream),
    };

    let guarded = GuardedStream {
        _guard: guard,
        inner: stream,
        channel_id,
        last_log_time: Instant::now(),
        bytes_since_last_log: 0,
    };

    axum::response::Response::builder()
        .header("Content-Type", "video/mp4")
        .header("Cache-Control", "no-store")
        .body(Body::from_stream(guarded))
        .unwrap()
}

/// Rewrites a tuner's raw HLS playlist for Safari/iOS compatibility: strips
/// `#EXT-X-INDEPENDENT-SEGMENTS` (some Safari builds reject it on TS
/// playlists) and ensures `TARGETDURATION` covers the longest `EXTINF`
/// actually present.
fn rewrite_playlist_for_safari(text: &str) -> String {
    let mut max_extinf: f64 = 0.0;
    let mut current_target: Option<u64> = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some((dur, _)) = rest.split_once(',') {
                if let Ok(dur) = dur.trim().parse::<f64>() {
                    max_extinf = max_extinf.max(dur);
                }
            }
        } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            if let Ok(v) = rest.trim().parse::<u64>() {
                current_target = Some(v);
            }
        }
    }
    let needed = max_extinf.ceil() as u64;
    let target = current_target.map(|v| v.max(needed)).unwrap_or(needed);

    let mut saw_target = false;
    let lines: Vec<String> = text
        .lines()
        .filter_map(|line| {
            if line == "#EXT-X-INDEPENDENT-SEGMENTS" {
                None
            } else if line.starts_with("#EXT-X-TARGETDURATION:") {
                saw_target = true;
                Some(format!("#EXT-X-TARGETDURATION:{}", target))
            } else {
                Some(line.to_string())
            }
        })
        .collect();

    if saw_target {
        lines.join("\n") + "\n"
    } else {
        let mut out = Vec::with_capacity(lines.len() + 1);
        for line in lines {
            let is_version = line.starts_with("#EXT-X-VERSION:");
            out.push(line);
            if is_version {
                out.push(format!("#EXT-X-TARGETDURATION:{}", target));
            }
        }
        out.join("\n") + "\n"
    }
}

async fn hls_playlist_handler(
    Path(tuner_id): Path<usize>,
    State(state): State<Arc<AppState>>,
    method: Method,
) -> axum::response::Response {
    let Some(tuner) = state.manager.tuner(tuner_id) else {
        return (StatusCode::NOT_FOUND, "tuner not found").into_response();
    };
    let Some(playlist_path) = tuner.playlist_path().await else {
        return (StatusCode::SERVICE_UNAVAILABLE, "capture not running").into_response();
    };

    if method == Method::HEAD {
        let len = tokio::fs::metadata(&playlist_path).await.map(|m| m.len()).unwrap_or(0);
        return axum::response::Response::builder()
            .header("Content-Type", "application/vnd.apple.mpegurl")
            .header("Content-Length", len.to_string())
            .header("Cache-Control", "no-cache")
            .body(Body::empty())
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(1);
    let mut last_bytes: Option<Vec<u8>> = None;
    while Instant::now() < deadline {
        if let Ok(bytes) = tokio::fs::read(&playlist_path).await {
            let has_segment = String::from_utf8_lossy(&bytes)
                .lines()
                .any(|l| l.starts_with("seg_") && l.ends_with(".ts"));
            last_bytes = Some(bytes);
            if has_segment {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    match last_bytes {
        Some(bytes) => {
            let rewritten = rewrite_playlist_for_safari(&String::from_utf8_lossy(&bytes)).into_bytes();
            axum::response::Response::builder()
                .header("Content-Type", "application/vnd.apple.mpegurl")
                .header("Content-Length", rewritten.len().to_string())
                .header("Cache-Control", "no-cache")
                .body(Body::from(rewritten))
                .unwrap()
        }
        None => (StatusCode::SERVICE_UNAVAILABLE, "playlist not ready").into_response(),
    }
}

async fn hls_segment_handler(
    Path((tuner_id, segment)): Path<(usize, String)>,
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
) -> axum::response::Response {
    let Some(tuner) = state.manager.tuner(tuner_id) else {
        return (StatusCode::NOT_FOUND, "tuner not found").into_response();
    };
    let Some(path) = tuner.segment_path(&segment).await else {
        return (StatusCode::BAD_REQUEST, "invalid segment").into_response();
    };

    let bytes = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(_) => return (StatusCode::NOT_FOUND, "segment not found").into_response(),
    };
    let total = bytes.len();

    if method == Method::HEAD {
        return axum::response::Response::builder()
            .header("Content-Type", "video/mp2t")
            .header("Content-Length", total.to_string())
            .header("Accept-Ranges", "bytes")
            .header("Cache-Control", "no-store")
            .body(Body::empty())
            .unwrap();
    }

    if let Some(range) = headers.get(axum::http::header::RANGE).and_then(|v| v.to_str().ok()) {
        if let Some(spec) = range.trim().strip_prefix("bytes=") {
            if let Some((start, end)) = spec.split_once('-') {
                if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                    if start <= end && end < total {
                        let body = Bytes::from(bytes[start..=end].to_vec());
                        return axum::response::Response::builder()
                            .status(StatusCode::PARTIAL_CONTENT)
                            .header("Content-Type", "video/mp2t")
                            .header("Accept-Ranges", "bytes")
                            .header("Content-Range", format!("bytes {}-{}/{}", start, end, total))
                            .header("Content-Length", body.len().to_string())
                            .header("Cache-Control", "no-store")
                            .body(Body::from(body))
                            .unwrap();
                    }
                }
            }
        }
    }

    axum::response::Response::builder()
        .header("Content-Type", "video/mp2t")
        .header("Content-Length", total.to_string())
        .header("Accept-Ranges", "bytes")
        .header("Cache-Control", "no-store")
        .body(Body::from(bytes))
        .unwrap()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    Json(state.manager.status().await)
}

async fn kill_ffmpeg_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.manager.kill_ffmpeg().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

async fn epg_refresh_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.guide.trigger_refresh().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!("epg refresh forward failed: {}", e);
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

async fn get_settings_handler(State(state): State<Arc<AppState>>) -> Json<Settings> {
    Json(state.settings.read().await.clone())
}

#[derive(Debug, Serialize, Deserialize)]
struct SettingsUpdate(Settings);

async fn post_settings_handler(
    State(state): State<Arc<AppState>>,
    Json(update): Json<SettingsUpdate>,
) -> impl IntoResponse {
    *state.settings.write().await = update.0;
    StatusCode::NO_CONTENT
}
