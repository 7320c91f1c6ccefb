//! Owns the fixed-size pool of tuners and arbitrates channel requests across
//! them: a registry behind a single lock, a background reaper task spawned
//! at construction, and client attachment returning an RAII guard. Tuners
//! are a scarce physical resource (one virtual display each), so the pool
//! is fixed-size rather than grown per requested channel.

use crate::channels::ChannelResolver;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::{record_client_count, record_tuner_state};
use crate::tuner::{Tuner, TunerState, TunerStatus};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const REAP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemStatus {
    pub tuners: Vec<TunerStatus>,
}

/// Wraps a capture-level client guard with the owning tuner and manager, so
/// detaching (dropping the guard) also releases the tuner (see `release`).
pub struct TunerClientGuard {
    _inner: crate::capture::ClientGuard,
    manager: Arc<TunerManager>,
    tuner: Arc<Tuner>,
}

impl Drop for TunerClientGuard {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        let tuner = self.tuner.clone();
        tokio::spawn(async move {
            manager.release(&tuner).await;
        });
    }
}

/// Arbitrates a fixed pool of tuners across incoming channel requests.
pub struct TunerManager {
    tuners: Vec<Arc<Tuner>>,
    resolver: ChannelResolver,
    idle_timeout: Duration,
}

impl TunerManager {
    /// Spawns the idle/error reaper immediately; callers are expected to
    /// `start()` every tuner before serving requests.
    pub fn new(tuners: Vec<Arc<Tuner>>, resolver: ChannelResolver, idle_timeout: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            tuners,
            resolver,
            idle_timeout,
        });
        let reaper = manager.clone();
        tokio::spawn(async move {
            reaper.reap_loop().await;
        });
        manager
    }

    /// Starts every tuner, continuing past individual failures so one
    /// misprovisioned tuner doesn't prevent the rest from coming up. Returns
    /// the first error seen, if any, for the caller to log or act on.
    pub async fn start_all(&self) -> GatewayResult<()> {
        let mut first_err = None;
        for tuner in &self.tuners {
            if let Err(e) = tuner.start().await {
                warn!("tuner {} failed to start: {}", tuner.id, e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// True once at least one tuner in the pool has reached FREE.
    pub async fn any_tuner_free(&self) -> bool {
        for tuner in &self.tuners {
            if tuner.current_state().await == TunerState::Free {
                return true;
            }
        }
        false
    }

    pub fn tuner(&self, id: usize) -> Option<&Arc<Tuner>> {
        self.tuners.get(id)
    }

    pub fn channels(&self) -> Vec<crate::channels::Channel> {
        self.resolver.all()
    }

    /// Resolves `channel_id` and selects a tuner to serve it, tuning if
    /// necessary. Selection order: a tuner already streaming this exact
    /// channel; else the lowest-id FREE tuner; else the lowest-id STREAMING
    /// tuner with zero attached clients (stolen and re-tuned); else
    /// `AllBusy`.
    pub async fn acquire(&self, channel_id: &str) -> GatewayResult<Arc<Tuner>> {
        let channel = self
            .resolver
            .resolve(channel_id)
            .await
            .ok_or_else(|| GatewayError::NotFound(channel_id.to_string()))?;

        for tuner in &self.tuners {
            if tuner.is_streaming_channel(&channel.id).await {
                tuner.touch().await;
                return Ok(tuner.clone());
            }
        }

        for tuner in &self.tuners {
            if tuner.current_state().await == TunerState::Free {
                tuner.tune(channel).await?;
                return Ok(tuner.clone());
            }
        }

        for tuner in &self.tuners {
            if tuner.current_state().await == TunerState::Streaming && tuner.client_count().await == 0 {
                tuner.tune(channel).await?;
                return Ok(tuner.clone());
            }
        }

        Err(GatewayError::AllBusy)
    }

    pub async fn add_client(
        self: &Arc<Self>,
        tuner: &Arc<Tuner>,
    ) -> GatewayResult<(Option<Bytes>, broadcast::Receiver<Bytes>, TunerClientGuard)> {
        let (header, rx, inner_guard) = tuner
            .add_client()
            .await
            .ok_or_else(|| GatewayError::CaptureFailed("capture not running".to_string()))?;
        Ok((
            header,
            rx,
            TunerClientGuard {
                _inner: inner_guard,
                manager: self.clone(),
                tuner: tuner.clone(),
            },
        ))
    }

    /// Detach counterpart to `add_client`: touches the tuner so the idle
    /// reaper measures time since the last client actually left, not since
    /// it attached.
    pub async fn release(&self, tuner: &Arc<Tuner>) {
        tuner.touch().await;
    }

    pub async fn status(&self) -> SystemStatus {
        let mut tuners = Vec::with_capacity(self.tuners.len());
        for tuner in &self.tuners {
            let status = tuner.status().await;
            record_tuner_state(status.id, status.state);
            record_client_count(status.id, status.client_count);
            tuners.push(status);
        }
        SystemStatus { tuners }
    }

    /// Forcibly tears down every tuner's encoder, independent of its FSM
    /// state, and returns it to FREE. An escape hatch for a wedged pool.
    pub async fn kill_ffmpeg(&self) -> GatewayResult<()> {
        for tuner in &self.tuners {
            tuner.reclaim().await;
        }
        Ok(())
    }

    async fn reap_loop(&self) {
        loop {
            tokio::time::sleep(REAP_INTERVAL).await;
            for tuner in &self.tuners {
                record_tuner_state(tuner.id, tuner.current_state().await);
                record_client_count(tuner.id, tuner.client_count().await);
                match tuner.current_state().await {
                    TunerState::Streaming
                        if tuner.client_count().await == 0 && tuner.idle_for().await >= self.idle_timeout =>
                    {
                        info!("tuner {} idle past timeout, reclaiming", tuner.id);
                        tuner.reclaim().await;
                    }
                    TunerState::Error => {
                        warn!("tuner {} in ERROR, attempting recovery", tuner.id);
                        tuner.recover().await;
                    }
                    _ => {}
                }
            }
        }
    }
}
