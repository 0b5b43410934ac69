//! Prometheus metrics for the HTTP surface.
//!
//! Request and WebSocket metrics live here; conversion metrics come from
//! `imgpress_core::metrics` and are registered into the same registry.
//! A few gauges are refreshed from live state right before each scrape.

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

use imgpress_core::{ConverterState, ImageEncoder, ObjectStore};

use crate::state::AppState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "imgpress_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("imgpress_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "imgpress_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

/// Conversion jobs refused by the API, by reason.
pub static JOBS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "imgpress_jobs_rejected_total",
            "Conversion requests refused by the API",
        ),
        &["reason"],
    )
    .unwrap()
});

// =============================================================================
// WebSocket Metrics
// =============================================================================

/// Active WebSocket connections.
pub static WS_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "imgpress_ws_connections_active",
        "Number of active progress WebSocket connections",
    )
    .unwrap()
});

/// Total WebSocket connections (cumulative).
pub static WS_CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "imgpress_ws_connections_total",
        "Total progress WebSocket connections since startup",
    )
    .unwrap()
});

/// Progress events written to WebSocket clients.
pub static WS_MESSAGES_SENT: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "imgpress_ws_messages_sent_total",
        "Progress events sent over WebSocket",
    )
    .unwrap()
});

/// Clients disconnected because their progress queue overflowed.
pub static WS_EVICTIONS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "imgpress_ws_evictions_total",
        "WebSocket clients dropped by the progress tracker (client fell behind)",
    )
    .unwrap()
});

// =============================================================================
// Converter Metrics (collected dynamically)
// =============================================================================

/// Converter running state (1 = running, 0 = otherwise).
pub static CONVERTER_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "imgpress_converter_running",
        "Whether the converter accepts work (1) or not (0)",
    )
    .unwrap()
});

/// Tasks waiting in the converter input queue.
pub static CONVERTER_QUEUED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "imgpress_converter_queued",
        "Tasks waiting in the converter input queue",
    )
    .unwrap()
});

/// Registered progress observers.
pub static PROGRESS_OBSERVERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "imgpress_progress_observers",
        "Number of registered progress observers",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();
    registry.register(Box::new(JOBS_REJECTED.clone())).unwrap();

    // WebSocket
    registry
        .register(Box::new(WS_CONNECTIONS_ACTIVE.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_CONNECTIONS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_MESSAGES_SENT.clone()))
        .unwrap();
    registry.register(Box::new(WS_EVICTIONS.clone())).unwrap();

    // Converter
    registry
        .register(Box::new(CONVERTER_RUNNING.clone()))
        .unwrap();
    registry
        .register(Box::new(CONVERTER_QUEUED.clone()))
        .unwrap();
    registry
        .register(Box::new(PROGRESS_OBSERVERS.clone()))
        .unwrap();

    // Core metrics (submissions, tasks, persistence)
    for metric in imgpress_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Refresh gauges that mirror live converter and tracker state.
pub async fn collect_dynamic_metrics<S, E>(state: &AppState<S, E>)
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    let status = state.converter().status();
    CONVERTER_RUNNING.set(i64::from(status.state == ConverterState::Running));
    CONVERTER_QUEUED.set(status.queued as i64);
    PROGRESS_OBSERVERS.set(state.progress().observer_count().await as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics_returns_prometheus_format() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/test", "200"])
            .inc();

        let output = encode_metrics();
        assert!(output.contains("imgpress_http_requests_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_registry_contains_server_and_core_metrics() {
        // Vec metrics only show up once a label set has been touched
        HTTP_REQUEST_DURATION
            .with_label_values(&["GET", "/test", "200"])
            .observe(0.1);
        JOBS_REJECTED.with_label_values(&["busy"]).inc();
        imgpress_core::metrics::SUBMISSIONS_REJECTED
            .with_label_values(&["busy"])
            .inc();
        HTTP_REQUESTS_IN_FLIGHT.set(0);
        WS_CONNECTIONS_ACTIVE.set(0);
        WS_CONNECTIONS_TOTAL.inc();
        CONVERTER_RUNNING.set(0);

        let output = encode_metrics();

        assert!(output.contains("imgpress_http_request_duration_seconds"));
        assert!(output.contains("imgpress_http_requests_in_flight"));
        assert!(output.contains("imgpress_jobs_rejected_total"));
        assert!(output.contains("imgpress_ws_connections_active"));
        assert!(output.contains("imgpress_ws_connections_total"));
        assert!(output.contains("imgpress_converter_running"));
        assert!(output.contains("imgpress_submissions_rejected_total"));
    }
}
