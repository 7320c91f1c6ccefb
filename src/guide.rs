//! Thin forwarding client for the external guide-data collaborator: this
//! core never scrapes or caches guide/EPG data itself, it only proxies a
//! refresh trigger to whatever process owns that job.

use anyhow::Result;
use tracing::info;

#[derive(Clone)]
pub struct GuideClient {
    refresh_url: Option<String>,
}

impl GuideClient {
    pub fn new(refresh_url: Option<String>) -> Self {
        Self { refresh_url }
    }

    pub async fn trigger_refresh(&self) -> Result<()> {
        let Some(url) = &self.refresh_url else {
            info!("guide refresh requested but no collaborator configured; no-op");
            return Ok(());
        };
        let client = reqwest::Client::new();
        client.post(url).send().await?.error_for_status()?;
        Ok(())
    }
}
