//! Wraps the encoder child process for one tuner. Consumes a virtual
//! display, produces a segmented (HLS-style) output plus a continuous
//! fragmented-mp4 byte fan-out, and exposes liveness stats plus a
//! placeholder mode for channels with no current airing.

use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::config::TranscodingConfig;
use crate::metrics::FFMPEG_CPU_USAGE;

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Detection parameters for the black-screen/stall watchdog.
pub const STALL_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
pub const STALL_STREAK_THRESHOLD: u32 = 3;
const LUMINANCE_THRESHOLD: f64 = 16.0;

/// How long `stop()` waits for ffmpeg to exit on its own after the graceful
/// quit keystroke before escalating to `SIGKILL`.
const GRACEFUL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct CaptureStats {
    pub running: bool,
    pub uptime: Duration,
    pub bytes_out: u64,
    pub client_count: usize,
    pub last_segment_age: Option<Duration>,
}

/// A write-only byte target attached to a capture's fan-out. Detaching
/// (dropping the guard) decrements `client_count`.
pub struct ClientGuard {
    client_count: Arc<AtomicUsize>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.client_count.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Inner {
    running: AtomicBool,
    start_ts: Instant,
    bytes_out: Arc<AtomicU64>,
    client_count: Arc<AtomicUsize>,
    last_segment_ts: Arc<AtomicU64>,
    output_dir: PathBuf,
    stop_tx: watch::Sender<bool>,
    tx: broadcast::Sender<Bytes>,
    header: Arc<std::sync::Mutex<Option<Bytes>>>,
    black_screen_streak: Arc<AtomicU64>,
    stopped_rx: watch::Receiver<bool>,
}

/// Owns the encoder child process exclusively for its lifetime. Exactly one
/// encoder process exists per session while `running`.
pub struct CapturePipeline {
    inner: Arc<Inner>,
}

fn clean_output_dir_sync(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
            if name == "playlist.m3u8" || (name.starts_with("seg_") && name.ends_with(".ts")) {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

impl CapturePipeline {
    /// Captures `display_id` and encodes to the rolling playlist window in
    /// `output_dir` plus a continuous fragment broadcast, or (if `message`
    /// is `Some`) synthesizes a still frame with that message instead.
    fn spawn(
        tuner_id: usize,
        display_id: u32,
        output_dir: PathBuf,
        config: TranscodingConfig,
        message: Option<String>,
        black_screen_callback: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        std::fs::create_dir_all(&output_dir).ok();
        // Unlink any stale manifest/segments first so there is never a
        // stale playlist after a restart; the index space restarts at 0.
        clean_output_dir_sync(&output_dir);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let (tx, _rx) = broadcast::channel(8192);
        let bytes_out = Arc::new(AtomicU64::new(0));
        let client_count = Arc::new(AtomicUsize::new(0));
        let last_segment_ts = Arc::new(AtomicU64::new(0));
        let black_screen_streak = Arc::new(AtomicU64::new(0));
        let header = Arc::new(std::sync::Mutex::new(None));

        let inner = Arc::new(Inner {
            running: AtomicBool::new(true),
            start_ts: Instant::now(),
            bytes_out: bytes_out.clone(),
            client_count: client_count.clone(),
            last_segment_ts: last_segment_ts.clone(),
            output_dir: output_dir.clone(),
            stop_tx,
            tx: tx.clone(),
            header: header.clone(),
            black_screen_streak: black_screen_streak.clone(),
            stopped_rx,
        });

        let args = build_ffmpeg_args(display_id, &output_dir, &config, message.as_deref());
        let running_flag = Arc::new(AtomicBool::new(true));

        {
            let running_flag = running_flag.clone();
            let bytes_out = bytes_out.clone();
            let tx = tx.clone();
            let header = header.clone();
            tokio::spawn(async move {
                run_encoder(args, bytes_out, tx, header, &mut stop_rx, running_flag, tuner_id, stopped_tx).await;
            });
        }

        // Stall/black-screen watchdog: samples the most recent segment's
        // first frame on a fixed interval; K consecutive below-threshold
        // samples trigger the owner's callback.
        {
            let output_dir = output_dir.clone();
            let last_segment_ts = last_segment_ts.clone();
            let black_screen_streak = black_screen_streak.clone();
            let running_flag = running_flag.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(STALL_SAMPLE_INTERVAL).await;
                    if !running_flag.load(Ordering::Acquire) {
                        break;
                    }
                    if let Some(age) = newest_segment_mtime(&output_dir).await {
                        last_segment_ts.store(age, Ordering::Relaxed);
                    }
                    let luminance = sample_luminance(&output_dir).await;
                    let below_threshold = luminance.map(|l| l < LUMINANCE_THRESHOLD).unwrap_or(false);
                    if below_threshold {
                        let streak = black_screen_streak.fetch_add(1, Ordering::AcqRel) + 1;
                        if streak as u32 >= STALL_STREAK_THRESHOLD {
                            black_screen_streak.store(0, Ordering::Release);
                            black_screen_callback();
                        }
                    } else {
                        black_screen_streak.store(0, Ordering::Release);
                    }
                }
            });
        }

        Self { inner }
    }

    pub fn start(
        tuner_id: usize,
        display_id: u32,
        output_dir: PathBuf,
        config: TranscodingConfig,
        black_screen_callback: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self::spawn(tuner_id, display_id, output_dir, config, None, black_screen_callback)
    }

    pub fn start_placeholder(
        tuner_id: usize,
        display_id: u32,
        output_dir: PathBuf,
        config: TranscodingConfig,
        message: impl Into<String>,
        black_screen_callback: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self::spawn(tuner_id, display_id, output_dir, config, Some(message.into()), black_screen_callback)
    }

    /// Idempotent: sends a graceful termination signal, then hard-kills
    /// after a bounded grace period. Returns once the encoder has actually
    /// exited (or the grace period plus kill overhead has elapsed).
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.stop_tx.send(true);
        let mut stopped_rx = self.inner.stopped_rx.clone();
        let wait = async {
            while !*stopped_rx.borrow() {
                if stopped_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(GRACEFUL_SHUTDOWN_GRACE + Duration::from_secs(2), wait).await;
    }

    /// Subscribes to the live fragment fan-out. The returned header, if any
    /// has been captured yet, holds the `ftyp`/`moov` init segment a joining
    /// client needs before its first `moof`/`mdat` pair will decode.
    pub fn add_client(&self) -> (Option<Bytes>, broadcast::Receiver<Bytes>, ClientGuard) {
        self.inner.client_count.fetch_add(1, Ordering::AcqRel);
        let header = self.inner.header.lock().unwrap().clone();
        (
            header,
            self.inner.tx.subscribe(),
            ClientGuard {
                client_count: self.inner.client_count.clone(),
            },
        )
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.inner.output_dir.join("playlist.m3u8")
    }

    pub fn segment_path(&self, name: &str) -> Option<PathBuf> {
        if !name.starts_with("seg_") || !name.ends_with(".ts") || name.contains('/') || name.contains("..") {
            return None;
        }
        Some(self.inner.output_dir.join(name))
    }

    pub fn stats(&self) -> CaptureStats {
        let last_segment_age = {
            let ts = self.inner.last_segment_ts.load(Ordering::Relaxed);
            if ts == 0 {
                None
            } else {
                Some(Duration::from_secs(now_epoch_secs().saturating_sub(ts)))
            }
        };
        CaptureStats {
            running: self.inner.running.load(Ordering::Acquire),
            uptime: self.inner.start_ts.elapsed(),
            bytes_out: self.inner.bytes_out.load(Ordering::Relaxed),
            client_count: self.inner.client_count.load(Ordering::Relaxed),
            last_segment_age,
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        let _ = self.inner.stop_tx.send(true);
    }
}

async fn newest_segment_mtime(output_dir: &Path) -> Option<u64> {
    let mut entries = tokio::fs::read_dir(output_dir).await.ok()?;
    let mut newest: Option<u64> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with("seg_") && name.ends_with(".ts")) {
            continue;
        }
        if let Ok(metadata) = entry.metadata().await {
            if let Ok(modified) = metadata.modified() {
                let secs = modified
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                newest = Some(newest.map_or(secs, |n| n.max(secs)));
            }
        }
    }
    newest
}

async fn sample_luminance(output_dir: &Path) -> Option<f64> {
    let playlist = output_dir.join("playlist.m3u8");
    let text = tokio::fs::read_to_string(&playlist).await.ok()?;
    let last_segment = text
        .lines()
        .filter(|l| l.starts_with("seg_") && l.ends_with(".ts"))
        .last()?
        .to_string();
    let segment_path = output_dir.join(&last_segment);

    let output = Command::new("ffmpeg")
        .args([
            "-y",
            "-i",
            segment_path.to_string_lossy().as_ref(),
            "-vf",
            "select=eq(n\\,0),signalstats",
            "-show_entries",
            "frame_tags=lavfi.signalstats.YAVG",
            "-f",
            "null",
            "-",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .ok()?;

    let text = String::from_utf8_lossy(&output.stderr);
    text.lines()
        .find_map(|l| l.split("YAVG=").nth(1))
        .and_then(|v| v.trim().parse::<f64>().ok())
}

fn push_output_av_settings(out: &mut Vec<String>, config: &TranscodingConfig) {
    out.extend([
        "-c:v".into(), "libx264".into(),
        "-pix_fmt".into(), "yuv420p".into(),
        "-profile:v".into(), "baseline".into(),
        "-level".into(), "3.1".into(),
        "-flags".into(), "+cgop".into(),
        "-g".into(), "50".into(),
        "-keyint_min".into(), "50".into(),
        "-sc_threshold".into(), "0".into(),
        "-b:v".into(), config.video_bitrate.clone(),
        "-c:a".into(), "aac".into(),
        "-ac".into(), "2".into(),
        "-b:a".into(), config.audio_bitrate.clone(),
    ]);
}

fn build_ffmpeg_args(
    display_id: u32,
    output_dir: &Path,
    config: &TranscodingConfig,
    message: Option<&str>,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    if let Some(message) = message {
        args.extend([
            "-f".into(), "lavfi".into(),
            "-i".into(),
            format!(
                "color=c=black:s={}x{}:r=25,drawtext=text='{}':fontcolor=white:fontsize=36:x=(w-text_w)/2:y=(h-text_h)/2",
                config.resolution.w, config.resolution.h, message.replace('\'', "")
            ),
            "-f".into(), "lavfi".into(),
            "-i".into(), "anullsrc=r=48000:cl=stereo".into(),
        ]);
    } else {
        args.extend([
            "-video_size".into(), format!("{}x{}", config.resolution.w, config.resolution.h),
            "-f".into(), "x11grab".into(),
            "-i".into(), format!(":{}", display_id),
            "-f".into(), "pulse".into(),
            "-i".into(), format!("display-{}.monitor", display_id),
        ]);
    }

    args.push("-y".into());

    // Output 1: fMP4 fragments to stdout for the continuous byte fan-out.
    push_output_av_settings(&mut args, config);
    args.extend([
        "-f".into(), "mp4".into(),
        "-movflags".into(), "frag_keyframe+empty_moov+default_base_moof".into(),
        "pipe:1".into(),
    ]);

    // Output 2: rolling HLS-style segmented playlist to disk.
    let seg_pattern = output_dir.join("seg_%05d.ts").to_string_lossy().to_string();
    let playlist = output_dir.join("playlist.m3u8").to_string_lossy().to_string();
    push_output_av_settings(&mut args, config);
    args.extend([
        "-f".into(), "hls".into(),
        "-hls_time".into(), config.segment_time.to_string(),
        "-hls_list_size".into(), config.list_size.to_string(),
        "-hls_flags".into(), "delete_segments+independent_segments+omit_endlist".into(),
        "-hls_segment_filename".into(), seg_pattern,
        playlist,
    ]);

    args
}

async fn run_encoder(
    args: Vec<String>,
    bytes_out: Arc<AtomicU64>,
    tx: broadcast::Sender<Bytes>,
    header: Arc<std::sync::Mutex<Option<Bytes>>>,
    stop_rx: &mut watch::Receiver<bool>,
    running_flag: Arc<AtomicBool>,
    tuner_id: usize,
    stopped_tx: watch::Sender<bool>,
) {
    info!("starting ffmpeg capture: args={:?}", args);
    let child = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            error!("failed to spawn ffmpeg: {}", e);
            running_flag.store(false, Ordering::Release);
            let _ = stopped_tx.send(true);
            return;
        }
    };

    if let Some(pid) = child.id() {
        let running_flag = running_flag.clone();
        tokio::spawn(async move {
            sample_cpu_usage(pid, tuner_id, running_flag).await;
        });
    }

    let mut stdout = match child.stdout.take() {
        Some(s) => s,
        None => {
            error!("ffmpeg spawned without stdout pipe");
            running_flag.store(false, Ordering::Release);
            let _ = stopped_tx.send(true);
            return;
        }
    };
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut reader = tokio::io::BufReader::new(stderr);
            use tokio::io::AsyncBufReadExt;
            let mut line = String::new();
            while let Ok(n) = reader.read_line(&mut line).await {
                if n == 0 {
                    break;
                }
                debug!("ffmpeg: {}", line.trim());
                line.clear();
            }
        });
    }

    let mut buffer = [0u8; 64 * 1024];
    let mut stream_buffer = BytesMut::new();
    let mut fragment_buffer = BytesMut::new();
    let mut stop_requested = false;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                stop_requested = true;
                break;
            }
            read_result = stdout.read(&mut buffer) => {
                match read_result {
                    Ok(0) => break,
                    Ok(n) => {
                        bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                        stream_buffer.extend_from_slice(&buffer[..n]);
                        drain_fmp4_fragments(&mut stream_buffer, &mut fragment_buffer, &header, &tx);
                    }
                    Err(e) => {
                        error!("error reading ffmpeg stdout: {}", e);
                        break;
                    }
                }
            }
        }
    }

    if stop_requested {
        // ffmpeg has no portable SIGTERM-graceful behavior when spawned
        // headless; 'q' on stdin is its own interactive quit keystroke.
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }
        match tokio::time::timeout(GRACEFUL_SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!("ffmpeg stopped gracefully: status={}", status),
            Ok(Err(e)) => warn!("ffmpeg wait() failed during graceful stop: {}", e),
            Err(_) => {
                warn!("ffmpeg did not exit within the grace period, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    } else {
        match child.wait().await {
            Ok(status) => warn!("ffmpeg exited unexpectedly: status={}", status),
            Err(e) => warn!("ffmpeg wait() failed: {}", e),
        }
    }
    running_flag.store(false, Ordering::Release);
    let _ = stopped_tx.send(true);
}

/// Parses MP4 box atoms out of the stream. The leading `ftyp`/`moov` init
/// segment (produced once, before the first `moof`) is captured separately
/// so joining clients can be handed it instead of needing to have been
/// attached since the encoder started; from the first `moof` onward,
/// complete fMP4 fragments (moof...mdat) are re-broadcast as single units so
/// a lagging receiver drops a whole fragment rather than a partial one.
fn drain_fmp4_fragments(
    stream_buffer: &mut BytesMut,
    fragment_buffer: &mut BytesMut,
    header: &Arc<std::sync::Mutex<Option<Bytes>>>,
    tx: &broadcast::Sender<Bytes>,
) {
    loop {
        if stream_buffer.len() < 8 {
            break;
        }
        let size = u32::from_be_bytes(stream_buffer[0..4].try_into().unwrap()) as usize;
        if size < 8 || stream_buffer.len() < size {
            break;
        }
        let atom = stream_buffer.split_to(size).freeze();
        let type_str = std::str::from_utf8(&atom[4..8]).unwrap_or("????");
        let header_captured = header.lock().unwrap().is_some();

        if type_str == "moof" {
            if !header_captured && !fragment_buffer.is_empty() {
                *header.lock().unwrap() = Some(fragment_buffer.split().freeze());
            } else if !fragment_buffer.is_empty() {
                let _ = tx.send(fragment_buffer.split().freeze());
            }
        }
        fragment_buffer.extend_from_slice(&atom);
        if type_str == "mdat" {
            let _ = tx.send(fragment_buffer.split().freeze());
        }
    }
}

pub fn record_cpu_usage(tuner_id: usize, usage: f64) {
    FFMPEG_CPU_USAGE
        .with_label_values(&[&tuner_id.to_string()])
        .set(usage);
}

/// Samples the encoder child's CPU usage every 5s until `running_flag`
/// clears.
async fn sample_cpu_usage(pid: u32, tuner_id: usize, running_flag: Arc<AtomicBool>) {
    let mut system = sysinfo::System::new();
    let sysinfo_pid = sysinfo::Pid::from_u32(pid);
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        if !running_flag.load(Ordering::Acquire) {
            break;
        }
        let processes = sysinfo::ProcessesToUpdate::Some(&[sysinfo_pid]);
        system.refresh_processes(processes, true);
        if let Some(process) = system.process(sysinfo_pid) {
            record_cpu_usage(tuner_id, process.cpu_usage() as f64);
        } else {
            break;
        }
    }
}
