use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static EVENTS_GENERATED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("ticker_events_generated_total", "Events produced by the generator").unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static LANE_RECORDS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("ticker_lane_records_total", "Records handled by a lane"),
        &["lane", "stage"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static WINDOWS_EMITTED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("ticker_windows_emitted_total", "Windows finalized with a result").unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static EMPTY_WINDOWS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "ticker_empty_windows_total",
        "Windows closed without any accumulated value",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static OPEN_WINDOWS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("ticker_open_windows", "Open accumulators per lane"),
        &["lane"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static SINK_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("ticker_sink_retries_total", "Transient sink failures that were retried"),
        &["sink"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static SINK_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("ticker_sink_failures_total", "Batches that exhausted the retry budget"),
        &["sink"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static BYTES_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("ticker_bytes_written_total", "Total bytes written by sink"),
        &["sink"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static SINK_BATCH_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new(
            "ticker_sink_batch_latency_ms",
            "Time to deliver one batch including retries (ms)",
        )
        .buckets(vec![
            0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
        ]),
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

pub static CHECKPOINT_DURATION_MS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new(
            "ticker_checkpoint_duration_ms",
            "Time from first lane snapshot to persisted checkpoint (ms)",
        )
        .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

pub static CHECKPOINTS_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("ticker_checkpoints_completed_total", "Checkpoints persisted").unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static DROPPED_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("ticker_dropped_events_total", "Events dropped before aggregation"),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

/// 1 while every lane is running, 0 once a lane has been halted.
pub static PIPELINE_HEALTHY: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("ticker_pipeline_healthy", "Pipeline health (1 healthy, 0 degraded)").unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub fn render_prometheus() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}
