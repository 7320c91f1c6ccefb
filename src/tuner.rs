//! The Tuner finite state machine: drives one browser instance
//! through a provider's guide page to a requested channel, starts its
//! capture pipeline once video is flowing, and recovers from control-plane
//! disconnects and black-screen stalls. Each tuner owns exactly one display,
//! one control endpoint and (while streaming) one `CapturePipeline`.
//!
//! FSM steps are serialized behind `inner`: `tune`, `stop` and
//! `handle_black_screen` all take the same lock for their full duration, so
//! the reaper and a client-triggered tune can never interleave mid-step.

use crate::browser::{BrowserControl, Locator, WaitMode};
use crate::capture::{CapturePipeline, CaptureStats};
use crate::channels::Channel;
use crate::config::TranscodingConfig;
use crate::dom::{
    find_guide_match, find_play_control, has_no_airings_notice, GuideEntry, PlayControlCandidate,
    PlayControlLocation, ProgramRow,
};
use crate::error::{GatewayError, GatewayResult};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

const MAX_SCROLL_ATTEMPTS: u32 = 15;
const SCROLL_SETTLE_DELAY: Duration = Duration::from_millis(400);
const PLAY_CONTROL_DEADLINE: Duration = Duration::from_secs(8);
const PLAY_CONTROL_POLL: Duration = Duration::from_millis(300);
const VIDEO_READY_DEADLINE: Duration = Duration::from_secs(15);
const VIDEO_READY_POLL: Duration = Duration::from_millis(500);
const GUIDE_READY_DEADLINE: Duration = Duration::from_secs(10);
const GUIDE_READY_POLL: Duration = Duration::from_millis(300);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TunerState {
    Stopped,
    Starting,
    Free,
    Tuning,
    Streaming,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct TunerStatus {
    pub id: usize,
    pub state: TunerState,
    pub channel_id: Option<String>,
    pub client_count: usize,
    pub uptime_secs: u64,
    pub bytes_out: u64,
}

struct TunerInner {
    state: TunerState,
    current_channel: Option<Channel>,
    last_activity: Instant,
    capture: Option<CapturePipeline>,
}

/// One virtual display / browser instance / encoder triple. Constructed once
/// per slot at startup by the Tuner Manager and held behind an `Arc` so the
/// capture pipeline's black-screen callback and the reconnect supervisor
/// task can each reach back into it.
pub struct Tuner {
    pub id: usize,
    display_id: u32,
    output_dir: PathBuf,
    guide_url: String,
    transcoding: TranscodingConfig,
    browser: BrowserControl,
    reconnect_attempts: AtomicU32,
    inner: Mutex<TunerInner>,
}

impl Tuner {
    pub fn new(
        id: usize,
        display_id: u32,
        control_endpoint: String,
        output_dir: PathBuf,
        guide_url: String,
        transcoding: TranscodingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            display_id,
            output_dir,
            guide_url,
            transcoding,
            browser: BrowserControl::new(control_endpoint),
            reconnect_attempts: AtomicU32::new(0),
            inner: Mutex::new(TunerInner {
                state: TunerState::Stopped,
                current_channel: None,
                last_activity: Instant::now(),
                capture: None,
            }),
        })
    }

    /// Brings the browser control connection up and transitions
    /// STOPPED -> STARTING -> FREE. Also spawns the background supervisor
    /// that watches for control-plane disconnects and drives reconnection.
    pub async fn start(self: &Arc<Self>) -> GatewayResult<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.state = TunerState::Starting;
        }
        if let Err(e) = self.browser.connect().await {
            let mut inner = self.inner.lock().await;
            inner.state = TunerState::Error;
            if let Some(capture) = inner.capture.take() {
                capture.stop().await;
            }
            inner.current_channel = None;
            inner.state = TunerState::Stopped;
            return Err(GatewayError::ControlDisconnected(e.to_string()));
        }
        {
            let mut inner = self.inner.lock().await;
            inner.state = TunerState::Free;
            inner.last_activity = Instant::now();
        }

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.browser.wait_disconnected() => {}
                    _ = this.await_health_probe_failure() => {}
                }
                if matches!(this.current_state().await, TunerState::Stopped) {
                    break;
                }
                this.reconnect().await;
            }
        });
        Ok(())
    }

    /// Periodically probes the control connection's liveness. Resolves once
    /// the probe fails while the transport still reports itself connected.
    /// `wait_disconnected` alone misses a control endpoint that stops
    /// responding without ever closing the socket.
    async fn await_health_probe_failure(self: &Arc<Self>) {
        loop {
            tokio::time::sleep(HEALTH_PROBE_INTERVAL).await;
            if !self.browser.is_connected() {
                return;
            }
            if !self.browser.health_probe().await {
                warn!("tuner {} failed health probe, forcing reconnect", self.id);
                return;
            }
        }
    }

    pub async fn current_state(&self) -> TunerState {
        self.inner.lock().await.state
    }

    pub async fn status(&self) -> TunerStatus {
        let inner = self.inner.lock().await;
        let stats = inner.capture.as_ref().map(|c| c.stats());
        TunerStatus {
            id: self.id,
            state: inner.state,
            channel_id: inner.current_channel.as_ref().map(|c| c.id.clone()),
            client_count: stats.as_ref().map(|s| s.client_count).unwrap_or(0),
            uptime_secs: stats.map(|s: CaptureStats| s.uptime.as_secs()).unwrap_or(0),
            bytes_out: inner
                .capture
                .as_ref()
                .map(|c| c.stats().bytes_out)
                .unwrap_or(0),
        }
    }

    pub async fn is_streaming_channel(&self, channel_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.state == TunerState::Streaming
            && inner
                .current_channel
                .as_ref()
                .map(|c| c.id == channel_id)
                .unwrap_or(false)
    }

    pub async fn client_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.capture.as_ref().map(|c| c.stats().client_count).unwrap_or(0)
    }

    pub async fn idle_for(&self) -> Duration {
        self.inner.lock().await.last_activity.elapsed()
    }

    pub async fn touch(&self) {
        self.inner.lock().await.last_activity = Instant::now();
    }

    pub async fn add_client(
        &self,
    ) -> Option<(
        Option<bytes::Bytes>,
        tokio::sync::broadcast::Receiver<bytes::Bytes>,
        crate::capture::ClientGuard,
    )> {
        let mut inner = self.inner.lock().await;
        inner.last_activity = Instant::now();
        inner.capture.as_ref().map(|c| c.add_client())
    }

    pub async fn playlist_path(&self) -> Option<PathBuf> {
        self.inner.lock().await.capture.as_ref().map(|c| c.playlist_path())
    }

    pub async fn segment_path(&self, name: &str) -> Option<PathBuf> {
        self.inner.lock().await.capture.as_ref().and_then(|c| c.segment_path(name))
    }

    /// Drives the browser to `channel` and starts its capture pipeline.
    /// Legal from FREE or STREAMING (re-tune away from the current channel).
    pub async fn tune(self: &Arc<Self>, channel: Channel) -> GatewayResult<()> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, TunerState::Free | TunerState::Streaming) {
            return Err(GatewayError::Internal(format!(
                "tuner {} not tunable from state {:?}",
                self.id, inner.state
            )));
        }
        inner.current_channel = None;
        if let Some(capture) = inner.capture.take() {
            capture.stop().await;
        }
        inner.state = TunerState::Tuning;
        inner.last_activity = Instant::now();
        drop(inner);

        let result = self.run_tuning_algorithm(&channel).await;

        let mut inner = self.inner.lock().await;
        match result {
            Ok(capture) => {
                inner.capture = Some(capture);
                inner.current_channel = Some(channel);
                inner.state = TunerState::Streaming;
                inner.last_activity = Instant::now();
                Ok(())
            }
            Err(e) => {
                inner.state = TunerState::Error;
                Err(e)
            }
        }
    }

    /// Tuning algorithm: guide navigation, channel search with scroll
    /// retries, play-control location, video-ready wait, then capture start.
    async fn run_tuning_algorithm(self: &Arc<Self>, channel: &Channel) -> GatewayResult<CapturePipeline> {
        self.ensure_on_guide_page()
            .await
            .map_err(|e| GatewayError::TuneFailed(e.to_string()))?;

        let matched = self.search_guide(channel).await.map_err(|e| GatewayError::TuneFailed(e.to_string()))?;
        let Some(_) = matched else {
            return Err(GatewayError::TuneFailed(format!(
                "no guide match for channel {}",
                channel.id
            )));
        };

        if self.check_no_airings().await.unwrap_or(false) {
            self.dismiss_no_airings_notice().await.ok();
            let message = format!("{} is not currently available", channel.display_name);
            return Ok(CapturePipeline::start_placeholder(
                self.id,
                self.display_id,
                self.output_dir.clone(),
                self.transcoding.clone(),
                message,
                self.black_screen_callback(),
            ));
        }

        self.locate_and_click_play_control()
            .await
            .map_err(|e| GatewayError::TuneFailed(e.to_string()))?;

        self.wait_for_video_ready()
            .await
            .map_err(|e| GatewayError::TuneFailed(e.to_string()))?;

        self.apply_viewport_fill().await.ok();

        Ok(CapturePipeline::start(
            self.id,
            self.display_id,
            self.output_dir.clone(),
            self.transcoding.clone(),
            self.black_screen_callback(),
        ))
    }

    async fn ensure_on_guide_page(&self) -> anyhow::Result<()> {
        let current = self.browser.current_url().await.unwrap_or_default();
        if !current.starts_with(&self.guide_url) {
            self.browser
                .navigate(&self.guide_url, WaitMode::NetworkIdle, Duration::from_secs(30))
                .await?;
        }
        let deadline = Instant::now() + GUIDE_READY_DEADLINE;
        loop {
            let ready = self
                .browser
                .evaluate("!!document.querySelector('[data-guide-ready]')", serde_json::Value::Null)
                .await
                .map(|v| v.as_bool().unwrap_or(false))
                .unwrap_or(false);
            if ready || Instant::now() >= deadline {
                return Ok(());
            }
            tokio::time::sleep(GUIDE_READY_POLL).await;
        }
    }

    async fn fetch_guide_entries(&self) -> anyhow::Result<Vec<GuideEntry>> {
        let script = "Array.from(document.querySelectorAll('[data-guide-row]')).map(el => ({accessible_name: el.getAttribute('aria-label') || el.textContent || '', is_guide_row: true}))";
        let value = self.browser.evaluate(script, serde_json::Value::Null).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    async fn search_guide(&self, channel: &Channel) -> anyhow::Result<Option<usize>> {
        for attempt in 0..=MAX_SCROLL_ATTEMPTS {
            let entries = self.fetch_guide_entries().await?;
            let include_first_word = attempt == 0;
            if let Some(idx) = find_guide_match(
                &entries,
                &channel.match_terms,
                &channel.number,
                &channel.display_name,
                include_first_word,
            ) {
                self.browser
                    .query_and_click(Locator::Script(&format!(
                        "document.querySelectorAll('[data-guide-row]')[{}]",
                        idx
                    )))
                    .await?;
                return Ok(Some(idx));
            }
            if attempt < MAX_SCROLL_ATTEMPTS {
                self.browser
                    .evaluate(
                        "window.scrollBy(0, window.innerHeight); true",
                        serde_json::Value::Null,
                    )
                    .await?;
                tokio::time::sleep(SCROLL_SETTLE_DELAY).await;
            }
        }
        Ok(None)
    }

    async fn check_no_airings(&self) -> anyhow::Result<bool> {
        let script = "Array.from(document.querySelectorAll('body *')).map(el => el.textContent || '').slice(0, 200)";
        let value = self.browser.evaluate(script, serde_json::Value::Null).await?;
        let texts: Vec<String> = serde_json::from_value(value).unwrap_or_default();
        Ok(has_no_airings_notice(&texts))
    }

    async fn dismiss_no_airings_notice(&self) -> anyhow::Result<()> {
        self.browser
            .query_and_click(Locator::Selector("[aria-label='Close'], [aria-label='Dismiss']"))
            .await
    }

    async fn fetch_play_controls(&self) -> anyhow::Result<(Vec<PlayControlCandidate>, Vec<ProgramRow>)> {
        let script = "({candidates: Array.from(document.querySelectorAll('[role=button], button, a')).map(el => ({accessible_name: el.getAttribute('aria-label') || el.textContent || '', has_svg_play_glyph: !!el.querySelector('svg[data-icon=play]'), is_on_now_row: el.hasAttribute('data-on-now'), legacy_inline_style_marker: (el.getAttribute('style')||'').includes('play-button')})), rows: Array.from(document.querySelectorAll('[data-program-row]')).map(el => ({text: el.textContent || ''}))})";
        let value = self.browser.evaluate(script, serde_json::Value::Null).await?;
        let candidates: Vec<PlayControlCandidate> = value
            .get("candidates")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let rows: Vec<ProgramRow> = value
            .get("rows")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        Ok((candidates, rows))
    }

    async fn locate_and_click_play_control(&self) -> anyhow::Result<()> {
        let deadline = Instant::now() + PLAY_CONTROL_DEADLINE;
        loop {
            let (candidates, rows) = self.fetch_play_controls().await?;
            match find_play_control(&candidates, &rows) {
                Some(PlayControlLocation::Candidate(idx)) => {
                    return self
                        .browser
                        .query_and_click(Locator::Script(&format!(
                            "Array.from(document.querySelectorAll('[role=button], button, a'))[{}]",
                            idx
                        )))
                        .await;
                }
                Some(PlayControlLocation::ProgramRow(idx)) => {
                    return self
                        .browser
                        .query_and_click(Locator::Script(&format!(
                            "document.querySelectorAll('[data-program-row]')[{}]",
                            idx
                        )))
                        .await;
                }
                None => {
                    if Instant::now() >= deadline {
                        anyhow::bail!("no play control found before deadline");
                    }
                    tokio::time::sleep(PLAY_CONTROL_POLL).await;
                }
            }
        }
    }

    async fn wait_for_video_ready(&self) -> anyhow::Result<()> {
        let deadline = Instant::now() + VIDEO_READY_DEADLINE;
        let script = "(() => { const v = document.querySelector('video'); return v ? {readyState: v.readyState, currentTime: v.currentTime, paused: v.paused} : null; })()";
        loop {
            let value = self.browser.evaluate(script, serde_json::Value::Null).await?;
            let ready_state = value.get("readyState").and_then(|v| v.as_u64()).unwrap_or(0);
            let current_time = value.get("currentTime").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let paused = value.get("paused").and_then(|v| v.as_bool()).unwrap_or(true);
            if ready_state >= 3 && current_time > 0.0 {
                return Ok(());
            }
            if ready_state >= 4 && paused {
                self.browser
                    .evaluate(
                        "(() => { const v = document.querySelector('video'); if (v) { v.muted = false; v.play(); } })()",
                        serde_json::Value::Null,
                    )
                    .await
                    .ok();
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("video element never reached a playable state");
            }
            tokio::time::sleep(VIDEO_READY_POLL).await;
        }
    }

    async fn apply_viewport_fill(&self) -> anyhow::Result<()> {
        let script = "(() => { const v = document.querySelector('video'); if (v) { v.muted = false; v.style.position='fixed'; v.style.top='0'; v.style.left='0'; v.style.width='100vw'; v.style.height='100vh'; v.style.zIndex='2147483647'; } })()";
        self.browser.evaluate(script, serde_json::Value::Null).await?;
        Ok(())
    }

    fn black_screen_callback(self: &Arc<Self>) -> impl Fn() + Send + Sync + 'static {
        let this = self.clone();
        move || {
            let this = this.clone();
            tokio::spawn(async move {
                this.handle_black_screen().await;
            });
        }
    }

    /// Re-tunes the current channel from scratch after sustained black-screen
    /// detection. Leaves the tuner in ERROR if no channel is current or the
    /// re-tune itself fails.
    pub async fn handle_black_screen(self: &Arc<Self>) {
        let channel = {
            let inner = self.inner.lock().await;
            inner.current_channel.clone()
        };
        let Some(channel) = channel else {
            return;
        };
        warn!("tuner {} black screen detected, re-tuning {}", self.id, channel.id);
        if let Err(e) = self.tune(channel).await {
            warn!("tuner {} re-tune after black screen failed: {}", self.id, e);
        }
    }

    /// Attempts to restore the control connection after a drop, with
    /// exponential backoff capped at 30s, up to `MAX_RECONNECT_ATTEMPTS`.
    /// On success, a tuner previously in ERROR returns to FREE; any other
    /// state is preserved as-is (its in-progress capture, if any, keeps
    /// running against the resumed control endpoint). Exhausting all
    /// attempts moves the tuner to ERROR for the reaper to restart.
    async fn reconnect(self: &Arc<Self>) {
        for attempt in 0..MAX_RECONNECT_ATTEMPTS {
            let backoff = Duration::from_secs(2u64.saturating_pow(attempt).min(30));
            tokio::time::sleep(backoff).await;
            match self.browser.connect().await {
                Ok(()) => {
                    self.reconnect_attempts.store(0, Ordering::Relaxed);
                    let mut inner = self.inner.lock().await;
                    if inner.state == TunerState::Error {
                        inner.state = TunerState::Free;
                    }
                    info!("tuner {} control plane reconnected", self.id);
                    return;
                }
                Err(e) => {
                    warn!("tuner {} reconnect attempt {} failed: {}", self.id, attempt + 1, e);
                }
            }
        }
        warn!("tuner {} exhausted reconnect attempts, marking ERROR", self.id);
        let mut inner = self.inner.lock().await;
        inner.state = TunerState::Error;
    }

    /// Stops any active capture and returns the tuner to FREE. Used by the
    /// idle reaper and by ERROR recovery.
    pub async fn reclaim(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(capture) = inner.capture.take() {
            capture.stop().await;
        }
        inner.current_channel = None;
        inner.state = TunerState::Free;
        inner.last_activity = Instant::now();
    }

    /// One-shot recovery attempt for a tuner the reaper found in ERROR.
    /// Unlike `reconnect`, this isn't retried in a loop; a failure here is
    /// simply tried again on the next reaper sweep.
    pub async fn recover(&self) {
        if self.browser.connect().await.is_ok() {
            let mut inner = self.inner.lock().await;
            if inner.state == TunerState::Error {
                inner.current_channel = None;
                inner.state = TunerState::Free;
                inner.last_activity = Instant::now();
            }
        }
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(capture) = inner.capture.take() {
            capture.stop().await;
        }
        inner.state = TunerState::Stopped;
    }
}
