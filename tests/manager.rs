//! Covers the Tuner Manager's selection order for the cases reachable
//! without a live control connection: resolution failures and the
//! all-busy case when no tuner has ever reached FREE.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tvgateway::channels::{Channel, ChannelResolver};
use tvgateway::config::TranscodingConfig;
use tvgateway::error::GatewayError;
use tvgateway::manager::TunerManager;
use tvgateway::tuner::Tuner;

fn test_channel() -> Channel {
    Channel {
        id: "NBC-E".to_string(),
        number: "04".to_string(),
        display_name: "NBC East".to_string(),
        match_terms: vec!["NBC".to_string()],
    }
}

fn make_resolver(channels: Vec<Channel>) -> ChannelResolver {
    ChannelResolver::new(channels, Arc::new(RwLock::new(HashMap::new())))
}

fn make_pool(n: usize) -> Vec<Arc<Tuner>> {
    (0..n)
        .map(|i| {
            Tuner::new(
                i,
                i as u32,
                format!("ws://127.0.0.1:1/unused-{i}"),
                PathBuf::from(format!("/tmp/tvgateway-test-manager-{i}")),
                "https://guide.example.invalid".to_string(),
                TranscodingConfig::default(),
            )
        })
        .collect()
}

#[tokio::test]
async fn acquire_unknown_channel_is_not_found() {
    let manager = TunerManager::new(make_pool(1), make_resolver(vec![]), Duration::from_secs(60));
    let result = manager.acquire("DOES-NOT-EXIST").await;
    assert!(matches!(result, Err(GatewayError::NotFound(_))));
}

#[tokio::test]
async fn acquire_with_no_free_tuner_is_all_busy() {
    // None of these tuners were ever `start()`ed, so they remain STOPPED
    // forever; the selection order has no FREE or idle STREAMING tuner to
    // hand out, so the only legal outcome is AllBusy.
    let manager = TunerManager::new(make_pool(2), make_resolver(vec![test_channel()]), Duration::from_secs(60));
    let result = manager.acquire("NBC-E").await;
    assert!(matches!(result, Err(GatewayError::AllBusy)));
}

#[tokio::test]
async fn status_reports_every_tuner_in_the_pool() {
    let manager = TunerManager::new(make_pool(3), make_resolver(vec![]), Duration::from_secs(60));
    let status = manager.status().await;
    assert_eq!(status.tuners.len(), 3);
    for (i, tuner) in status.tuners.iter().enumerate() {
        assert_eq!(tuner.id, i);
        assert_eq!(tuner.client_count, 0);
    }
}

#[tokio::test]
async fn channels_lists_the_static_catalog() {
    let manager = TunerManager::new(make_pool(1), make_resolver(vec![test_channel()]), Duration::from_secs(60));
    let channels = manager.channels();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].id, "NBC-E");
}
