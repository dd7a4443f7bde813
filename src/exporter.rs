//! Concrete [`Exporter`](crate::span::Exporter) implementations.
//!
//! The wire protocol and ingest policy don't care what an exporter does with
//! a validated span; this module holds the daemon's own default (log it)
//! plus a recording double used by integration tests.

use crate::span::{Exporter, SpanData};

/// Default exporter when no upstream telemetry runtime is configured: logs
/// each accepted span at debug level. Useful for local debugging and as a
/// safe default so `TraceExport` traffic is never silently discarded.
pub struct LoggingExporter;

impl Exporter for LoggingExporter {
    fn export_span(&self, span: &SpanData) {
        tracing::debug!(
            trace_id = %hex::encode(span.trace_id),
            span_id = %hex::encode(span.span_id),
            name = %span.name,
            kind = ?span.kind,
            "exporting span"
        );
    }
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}
