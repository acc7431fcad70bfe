use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SC_CONVERTED_ROWS: IntCounterVec = IntCounterVec::new(
        Opts::new("livesc_converted_rows", "Rows copied into the new table by the converters"),
        &["table"]
    )
    .unwrap();
    pub static ref SC_RETRIES: IntCounterVec = IntCounterVec::new(
        Opts::new("livesc_retries", "Row conversions retried after a lock conflict"),
        &["table"]
    )
    .unwrap();
    pub static ref SC_REDO_TXNS: IntCounterVec = IntCounterVec::new(
        Opts::new("livesc_redo_transactions", "Transactions replayed by the logical redo"),
        &["table"]
    )
    .unwrap();
    pub static ref SC_THROTTLE_WAIT_TIME: Histogram = Histogram::with_opts(HistogramOpts::new(
        "livesc_throttle_wait_time",
        "Time spent waiting for the log byte budget"
    ))
    .unwrap();
    pub static ref SC_ACTIVE_CONVERTERS: IntGauge = IntGauge::new(
        "livesc_active_converters",
        "Converter threads currently holding a thread slot"
    )
    .unwrap();
    pub static ref SC_TRACKER_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("livesc_tracker_size", "Outstanding race entries of the logical redo"),
        &["table"]
    )
    .unwrap();
}

static REGISTER: Once = Once::new();

/// Register all metrics with [`REGISTRY`]. Subsequent calls do nothing.
pub fn register_custom_metrics() {
    REGISTER.call_once(|| {
        REGISTRY.register(Box::new(SC_CONVERTED_ROWS.clone())).unwrap();
        REGISTRY.register(Box::new(SC_RETRIES.clone())).unwrap();
        REGISTRY.register(Box::new(SC_REDO_TXNS.clone())).unwrap();
        REGISTRY.register(Box::new(SC_THROTTLE_WAIT_TIME.clone())).unwrap();
        REGISTRY.register(Box::new(SC_ACTIVE_CONVERTERS.clone())).unwrap();
        REGISTRY.register(Box::new(SC_TRACKER_SIZE.clone())).unwrap();
    });
}
