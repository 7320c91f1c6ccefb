use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};
use tvgateway::channels::{self, Channel, ChannelResolver};
use tvgateway::config::Settings;
use tvgateway::create_app;
use tvgateway::guide::GuideClient;
use tvgateway::manager::TunerManager;
use tvgateway::tuner::Tuner;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

/// Upper bound on how long startup waits for at least one tuner to reach
/// FREE before treating the pool as fatally misprovisioned.
const STARTUP_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

async fn load_static_catalog(source: &str) -> anyhow::Result<Vec<Channel>> {
    let text = if source.starts_with("http://") || source.starts_with("https://") {
        let client = reqwest::Client::builder().danger_accept_invalid_certs(true).build()?;
        client.get(source).send().await?.text().await?
    } else {
        tokio::fs::read_to_string(source).await?
    };
    channels::parse_m3u(&text)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args.config)?;
    info!("configuration loaded from {}: {:?}", args.config, settings);

    match &settings.tuners.credential_bundle_path {
        Some(path) if tokio::fs::metadata(path).await.is_ok() => {}
        Some(path) => anyhow::bail!("credential bundle not found at {}", path),
        None => anyhow::bail!("no credential bundle configured"),
    }

    let static_catalog = match load_static_catalog(&settings.tuners.playlist_source).await {
        Ok(channels) => {
            info!("loaded {} channels from {}", channels.len(), settings.tuners.playlist_source);
            channels
        }
        Err(e) => {
            error!(
                "failed to load static channel catalog from {}: {}",
                settings.tuners.playlist_source, e
            );
            Vec::new()
        }
    };

    let guide_catalog = Arc::new(RwLock::new(HashMap::new()));
    let resolver = ChannelResolver::new(static_catalog, guide_catalog);

    let hls_root = PathBuf::from(&settings.tuners.hls_output_root);
    let mut tuners = Vec::with_capacity(settings.tuners.num_tuners);
    for i in 0..settings.tuners.num_tuners {
        let display_id = settings.tuners.base_display_id + i as u32;
        let control_port = settings.tuners.base_control_port + i as u16;
        let tuner = Tuner::new(
            i,
            display_id,
            format!("ws://127.0.0.1:{}", control_port),
            hls_root.join(format!("tuner-{i}")),
            settings.tuners.guide_url.clone(),
            settings.transcoding.clone(),
        );
        tuners.push(tuner);
    }

    let manager = TunerManager::new(tuners, resolver, std::time::Duration::from_secs(settings.tuners.idle_timeout.0));
    if let Err(e) = manager.start_all().await {
        error!("one or more tuners failed to start: {}", e);
    }

    let became_free = tokio::time::timeout(STARTUP_DEADLINE, async {
        loop {
            if manager.any_tuner_free().await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    })
    .await
    .is_ok();
    if !became_free {
        anyhow::bail!("no tuner reached FREE within the startup deadline");
    }

    let guide = GuideClient::new(settings.tuners.epg_refresh_url.clone());
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let app = create_app(manager, settings, guide);

    info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
