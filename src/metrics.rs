//! Process-wide Prometheus metrics.
//!
//! Registration errors are ignored so that several engines in one process
//! (tests, embedding) share the same collectors.

use once_cell::sync::Lazy;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, TextEncoder};

fn counter(name: &str, help: &str) -> Counter {
    let c = Counter::new(name, help).expect("static metric definition");
    let _ = prometheus::register(Box::new(c.clone()));
    c
}

pub static POINTS_TOTAL: Lazy<Counter> =
    Lazy::new(|| counter("quorum_points_total", "Total points evaluated"));

pub static ANOMALIES_TOTAL: Lazy<Counter> =
    Lazy::new(|| counter("quorum_anomalies_total", "Total points flagged anomalous"));

pub static REJECTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    counter(
        "quorum_rejected_total",
        "Total points rejected (invalid payload or inactive session)",
    )
});

pub static BACKPRESSURE_DROPPED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    counter(
        "quorum_backpressure_dropped_total",
        "Total queued points dropped because a session queue overflowed",
    )
});

pub static PERSISTENCE_FAILURES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    counter(
        "quorum_persistence_failures_total",
        "Total results that could not be handed to or written by the store",
    )
});

pub static ACTIVE_SESSIONS: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new("quorum_active_sessions", "Number of active sessions")
        .expect("static metric definition");
    let _ = prometheus::register(Box::new(g.clone()));
    g
});

pub static DETECTION_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "quorum_detection_duration_seconds",
        "Histogram of per-point detection latency",
    ))
    .expect("static metric definition");
    let _ = prometheus::register(Box::new(h.clone()));
    h
});

/// Forces registration so every series shows up before first use.
pub fn init() {
    Lazy::force(&POINTS_TOTAL);
    Lazy::force(&ANOMALIES_TOTAL);
    Lazy::force(&REJECTED_TOTAL);
    Lazy::force(&BACKPRESSURE_DROPPED_TOTAL);
    Lazy::force(&PERSISTENCE_FAILURES_TOTAL);
    Lazy::force(&ACTIVE_SESSIONS);
    Lazy::force(&DETECTION_LATENCY);
}

/// Text exposition of the default registry.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics.");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_quorum_series() {
        init();
        POINTS_TOTAL.inc();
        let text = render();
        assert!(text.contains("quorum_points_total"));
        assert!(text.contains("quorum_detection_duration_seconds"));
    }
}
