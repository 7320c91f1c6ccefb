use lazy_static::lazy_static;
use prometheus::{register_gauge_vec, GaugeVec, Encoder, TextEncoder};

lazy_static! {
    pub static ref TUNER_STATE: GaugeVec = register_gauge_vec!(
        "tvgateway_tuner_state",
        "Tuner FSM state as an ordinal (0=STOPPED 1=STARTING 2=FREE 3=TUNING 4=STREAMING 5=ERROR)",
        &["tuner_id"]
    )
    .unwrap();
    pub static ref TUNER_CLIENT_COUNT: GaugeVec = register_gauge_vec!(
        "tvgateway_tuner_client_count",
        "Attached client sinks per tuner",
        &["tuner_id"]
    )
    .unwrap();
    pub static ref FFMPEG_CPU_USAGE: GaugeVec = register_gauge_vec!(
        "tvgateway_ffmpeg_cpu_usage_percent",
        "Current CPU usage of the encoder process per tuner (0-100+)",
        &["tuner_id"]
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

pub fn record_tuner_state(tuner_id: usize, state: crate::tuner::TunerState) {
    let ordinal = match state {
        crate::tuner::TunerState::Stopped => 0.0,
        crate::tuner::TunerState::Starting => 1.0,
        crate::tuner::TunerState::Free => 2.0,
        crate::tuner::TunerState::Tuning => 3.0,
        crate::tuner::TunerState::Streaming => 4.0,
        crate::tuner::TunerState::Error => 5.0,
    };
    TUNER_STATE.with_label_values(&[&tuner_id.to_string()]).set(ordinal);
}

pub fn record_client_count(tuner_id: usize, count: usize) {
    TUNER_CLIENT_COUNT
        .with_label_values(&[&tuner_id.to_string()])
        .set(count as f64);
}
