use serde::{Deserialize, Serialize};

fn default_num_tuners() -> usize {
    1
}
fn default_base_control_port() -> u16 {
    9222
}
fn default_base_display_id() -> u32 {
    100
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_video_bitrate() -> String {
    "4M".to_string()
}
fn default_audio_bitrate() -> String {
    "128k".to_string()
}
fn default_segment_time() -> u64 {
    4
}
fn default_list_size() -> usize {
    5
}
fn default_idle_timeout() -> u64 {
    120
}
fn default_hls_output_root() -> String {
    "/tmp/tvgateway-hls".to_string()
}
fn default_browser_profile_root() -> String {
    "/tmp/tvgateway-profiles".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Resolution {
    #[serde(default = "default_width")]
    pub w: u32,
    #[serde(default = "default_height")]
    pub h: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            w: default_width(),
            h: default_height(),
        }
    }
}

/// Server bind section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Tuner pool sizing and provisioning section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunerConfig {
    #[serde(default = "default_num_tuners")]
    pub num_tuners: usize,
    #[serde(default = "default_base_control_port")]
    pub base_control_port: u16,
    #[serde(default = "default_base_display_id")]
    pub base_display_id: u32,
    #[serde(default)]
    pub idle_timeout: IdleTimeout,
    #[serde(default = "default_hls_output_root")]
    pub hls_output_root: String,
    #[serde(default = "default_browser_profile_root")]
    pub browser_profile_root: String,
    /// Path to the credential/cookie bundle produced by the external
    /// authentication collaborator. This core reads it; it never mutates it.
    pub credential_bundle_path: Option<String>,
    /// Local file path or HTTP(S) URL of the static M3U channel catalog.
    pub playlist_source: String,
    /// Base URL of the provider guide page each tuner navigates to first.
    pub guide_url: String,
    /// Endpoint the guide-data collaborator exposes for `POST /tve/directv/epg/refresh`
    /// to forward to. `None` makes the refresh endpoint a no-op.
    pub epg_refresh_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(transparent)]
pub struct IdleTimeout(#[serde(default = "default_idle_timeout")] pub u64);

impl Default for IdleTimeout {
    fn default() -> Self {
        Self(default_idle_timeout())
    }
}

/// Capture/encode tuning section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscodingConfig {
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    #[serde(default = "default_segment_time")]
    pub segment_time: u64,
    #[serde(default = "default_list_size")]
    pub list_size: usize,
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            video_bitrate: default_video_bitrate(),
            audio_bitrate: default_audio_bitrate(),
            segment_time: default_segment_time(),
            list_size: default_list_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_monitoring_enabled")]
    pub enabled: bool,
}

fn default_monitoring_enabled() -> bool {
    true
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitoring_enabled(),
        }
    }
}

/// Full, env-overridable configuration snapshot. Loaded once at startup from
/// `--config <path>` (default `config.toml`) with an `TVGATEWAY_`-prefixed
/// environment layer on top, then held in memory and served/replaced via
/// `GET`/`POST /api/settings`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    pub tuners: TunerConfig,
    #[serde(default)]
    pub transcoding: TranscodingConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Settings {
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("TVGATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
