//! Internal self-instrumentation: the daemon's own activity fed into the
//! same registry that worker-submitted measures live in.

use crate::registry::{Aggregation, Measure, MeasureKind, Registry, View};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub const QUEUE_LATENCY: &str = "queue_latency";
pub const LATENCY: &str = "latency";
pub const REQUEST_COUNT: &str = "request_count";
pub const PROCESS_COUNT: &str = "process_count";
pub const DROP_COUNT: &str = "drop_count";
pub const MESSAGE_SIZE: &str = "message_size";

pub const LATENCY_BOUNDARIES_MS: &[f64] = &[
    0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0, 13.0, 16.0, 20.0, 25.0, 30.0, 40.0, 50.0, 65.0,
    80.0, 100.0, 130.0, 160.0, 200.0, 250.0, 300.0, 400.0, 500.0, 650.0, 800.0, 1000.0, 2000.0,
    5000.0, 10000.0, 20000.0, 50000.0, 100000.0,
];

pub const MESSAGE_SIZE_BOUNDARIES_BYTES: &[f64] = &[
    0.0,
    1024.0,
    2048.0,
    4096.0,
    16384.0,
    65536.0,
    262144.0,
    1048576.0,
    4194304.0,
    16777216.0,
    67108864.0,
    268435456.0,
    1073741824.0,
    4294967296.0,
];

/// In-process counters the dispatcher bumps on every message it handles,
/// keyed by message type label. Read by nothing but exposed for tests and
/// future reporting; the registry holds the view-facing submissions.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub requests: AtomicU64,
    pub processed: AtomicU64,
    pub dropped: AtomicU64,
}

impl DispatchMetrics {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Register the internal measures and a matching view for each, once at
/// startup, into the same registry worker-submitted measures live in.
pub fn register_internal_measures(registry: &Registry) {
    let measures = [
        (QUEUE_LATENCY, "time spent enqueued before dispatch", "ms"),
        (LATENCY, "producer start_time to dispatch completion", "ms"),
        (REQUEST_COUNT, "messages received, by type", "1"),
        (PROCESS_COUNT, "messages successfully processed, by type", "1"),
        (DROP_COUNT, "messages dropped, by type", "1"),
        (MESSAGE_SIZE, "payload size, by type", "By"),
    ];

    for (name, description, unit) in measures {
        registry.create_measure(Measure {
            name: name.to_string(),
            description: description.to_string(),
            unit: unit.to_string(),
            kind: MeasureKind::Float,
        });
    }

    let views = vec![
        distribution_view(QUEUE_LATENCY, LATENCY_BOUNDARIES_MS),
        distribution_view(LATENCY, LATENCY_BOUNDARIES_MS),
        count_view(REQUEST_COUNT),
        count_view(PROCESS_COUNT),
        count_view(DROP_COUNT),
        distribution_view(MESSAGE_SIZE, MESSAGE_SIZE_BOUNDARIES_BYTES),
    ];
    registry
        .register_views(views)
        .expect("internal measures are registered immediately above");
}

fn distribution_view(measure_name: &str, boundaries: &[f64]) -> View {
    View {
        name: format!("{measure_name}/view"),
        description: format!("distribution over {measure_name}"),
        tag_keys: vec!["msg_type".to_string()],
        measure_name: measure_name.to_string(),
        aggregation: Aggregation::Distribution {
            boundaries: boundaries.to_vec(),
        },
    }
}

fn count_view(measure_name: &str) -> View {
    View {
        name: format!("{measure_name}/view"),
        description: format!("count over {measure_name}"),
        tag_keys: vec!["msg_type".to_string()],
        measure_name: measure_name.to_string(),
        aggregation: Aggregation::Count,
    }
}

/// Milliseconds elapsed since `since`, as an `f64` suitable for a
/// distribution submission.
pub fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}
