//! Exercises the parts of the Tuner finite state machine reachable without a
//! live browser control connection or encoder process: construction defaults
//! and the accessor surface the Tuner Manager polls.

use std::path::PathBuf;
use std::time::Duration;
use tvgateway::config::TranscodingConfig;
use tvgateway::tuner::{Tuner, TunerState};

fn make_tuner(id: usize) -> std::sync::Arc<Tuner> {
    Tuner::new(
        id,
        id as u32,
        "ws://127.0.0.1:1/unused".to_string(),
        PathBuf::from(format!("/tmp/tvgateway-test-tuner-{id}")),
        "https://guide.example.invalid".to_string(),
        TranscodingConfig::default(),
    )
}

#[tokio::test]
async fn new_tuner_starts_stopped_with_no_channel() {
    let tuner = make_tuner(0);
    assert_eq!(tuner.current_state().await, TunerState::Stopped);
    assert_eq!(tuner.client_count().await, 0);
    assert!(!tuner.is_streaming_channel("ANY").await);
    assert!(tuner.add_client().await.is_none());

    let status = tuner.status().await;
    assert_eq!(status.id, 0);
    assert_eq!(status.state, TunerState::Stopped);
    assert_eq!(status.channel_id, None);
    assert_eq!(status.client_count, 0);
    assert_eq!(status.bytes_out, 0);
}

#[tokio::test]
async fn touch_resets_idle_duration() {
    let tuner = make_tuner(1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(tuner.idle_for().await >= Duration::from_millis(20));
    tuner.touch().await;
    assert!(tuner.idle_for().await < Duration::from_millis(20));
}

#[tokio::test]
async fn reclaim_on_a_never_started_tuner_returns_it_to_free() {
    // Reclaim is used by both the idle reaper and kill-ffmpeg; it must be
    // safe to call even when no capture was ever attached.
    let tuner = make_tuner(2);
    tuner.reclaim().await;
    assert_eq!(tuner.current_state().await, TunerState::Free);
}

#[tokio::test]
async fn tune_is_rejected_while_stopped() {
    use tvgateway::channels::Channel;

    let tuner = make_tuner(3);
    let channel = Channel {
        id: "NBC-E".to_string(),
        number: "04".to_string(),
        display_name: "NBC East".to_string(),
        match_terms: vec!["NBC".to_string()],
    };
    // The FSM only accepts tune() from FREE or STREAMING; a freshly
    // constructed tuner is STOPPED until start() brings its control
    // connection up.
    let result = tuner.tune(channel).await;
    assert!(result.is_err());
    assert_eq!(tuner.current_state().await, TunerState::Stopped);
}
