//! `TraceExport` span ingest: JSON decode, B3 id validation, exporter fan-out.

use chrono::NaiveDateTime;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Span status as carried on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct SpanStatus {
    pub code: i32,
    pub message: String,
}

/// A link to another span, attached to this one.
#[derive(Debug, Clone, Deserialize)]
pub struct SpanLink {
    #[serde(rename = "traceId", default)]
    pub trace_id: String,
    #[serde(rename = "spanId", default)]
    pub span_id: String,
    #[serde(rename = "type", default)]
    pub link_type: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// `{"date": "...", "timezone_type": ..., "timezone": "..."}`, parsed down to
/// just the instant it names — the worker always reports in the same zone it
/// runs in, so the other two fields carry no information we act on.
#[derive(Debug, Clone, Copy)]
pub struct WireDateTime(pub chrono::NaiveDateTime);

impl<'de> Deserialize<'de> for WireDateTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            date: String,
        }
        let raw = Raw::deserialize(deserializer)?;
        let parsed = NaiveDateTime::parse_from_str(&raw.date, "%Y-%m-%d %H:%M:%S%.f")
            .map_err(serde::de::Error::custom)?;
        Ok(WireDateTime(parsed))
    }
}

/// `attributes` is either a JSON object or the empty-array sentinel `[]`
/// meaning "no attributes" — a quirk of the PHP producer's JSON encoder.
#[derive(Debug, Clone, Default)]
pub struct Attributes(pub HashMap<String, serde_json::Value>);

impl<'de> Deserialize<'de> for Attributes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Array(items) if items.is_empty() => Ok(Attributes::default()),
            serde_json::Value::Object(map) => {
                Ok(Attributes(map.into_iter().collect()))
            }
            other => Err(serde::de::Error::custom(format!(
                "attributes must be an object or empty array, got {other}"
            ))),
        }
    }
}

/// One span exactly as it arrives on the wire, before id validation.
#[derive(Debug, Clone, Deserialize)]
pub struct WireSpan {
    #[serde(rename = "traceId")]
    pub trace_id: String,
    #[serde(rename = "spanId")]
    pub span_id: String,
    #[serde(rename = "parentSpanId", default)]
    pub parent_span_id: String,
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(rename = "stackTrace", default)]
    pub stack_trace: Vec<String>,
    #[serde(rename = "startTime")]
    pub start_time: WireDateTime,
    #[serde(rename = "endTime")]
    pub end_time: WireDateTime,
    pub status: SpanStatus,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(rename = "timeEvents", default)]
    pub time_events: serde_json::Value,
    #[serde(default)]
    pub links: Vec<SpanLink>,
    #[serde(rename = "sameProcessAsParentSpan", default)]
    pub same_process_as_parent_span: bool,
}

/// `kind` as understood by the telemetry runtime, once mapped from the
/// wire's free-text string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Client,
    Server,
    Unspecified,
}

impl SpanKind {
    fn from_wire(s: &str) -> Self {
        match s {
            "CLIENT" => SpanKind::Client,
            "SERVER" => SpanKind::Server,
            _ => SpanKind::Unspecified,
        }
    }
}

/// A span that has passed B3 id validation and is ready to hand to exporters.
#[derive(Debug, Clone)]
pub struct SpanData {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub parent_span_id: Option<[u8; 8]>,
    pub name: String,
    pub kind: SpanKind,
    pub stack_trace: Vec<String>,
    pub start_time: chrono::NaiveDateTime,
    pub end_time: chrono::NaiveDateTime,
    pub status: SpanStatus,
    pub attributes: HashMap<String, serde_json::Value>,
    pub links: Vec<SpanLink>,
    pub has_remote_parent: bool,
}

/// Egress boundary: where validated spans go. Injected at construction and
/// considered external to the daemon's own concerns.
pub trait Exporter: Send + Sync {
    fn export_span(&self, span: &SpanData);
}

fn decode_hex_id<const N: usize>(s: &str) -> Option<[u8; N]> {
    if s.len() != N * 2 {
        return None;
    }
    let mut out = [0u8; N];
    for i in 0..N {
        out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

/// Parse a `TraceExport` payload's JSON span array and hand each span that
/// passes id validation to every registered exporter, in order. If no
/// exporters are configured the payload is never even parsed.
pub fn ingest_trace_export(payload: &[u8], exporters: &[Arc<dyn Exporter>]) {
    if exporters.is_empty() {
        return;
    }

    let wire_spans: Vec<WireSpan> = match serde_json::from_slice(payload) {
        Ok(spans) => spans,
        Err(err) => {
            tracing::warn!(error = %err, "failed to parse TraceExport payload");
            return;
        }
    };

    for wire in wire_spans {
        let Some(trace_id) = decode_hex_id::<16>(&wire.trace_id) else {
            tracing::debug!(trace_id = %wire.trace_id, "span has unparseable traceId, skipping");
            continue;
        };
        let Some(span_id) = decode_hex_id::<8>(&wire.span_id) else {
            tracing::debug!(span_id = %wire.span_id, "span has unparseable spanId, skipping");
            continue;
        };
        let parent_span_id = decode_hex_id::<8>(&wire.parent_span_id);

        let span = SpanData {
            trace_id,
            span_id,
            parent_span_id,
            name: wire.name,
            kind: SpanKind::from_wire(&wire.kind),
            stack_trace: wire.stack_trace,
            start_time: wire.start_time.0,
            end_time: wire.end_time.0,
            status: wire.status,
            attributes: wire.attributes.0,
            links: wire.links,
            has_remote_parent: !wire.same_process_as_parent_span,
        };

        for exporter in exporters {
            exporter.export_span(&span);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingExporter {
        spans: Mutex<Vec<SpanData>>,
    }

    impl Exporter for RecordingExporter {
        fn export_span(&self, span: &SpanData) {
            self.spans.lock().unwrap().push(span.clone());
        }
    }

    fn span_json(trace_id: &str, span_id: &str) -> String {
        format!(
            r#"{{
                "traceId": "{trace_id}",
                "spanId": "{span_id}",
                "parentSpanId": "",
                "name": "GET /x",
                "kind": "SERVER",
                "stackTrace": [],
                "startTime": {{"date": "2026-07-28 10:00:00.000000", "timezone_type": 3, "timezone": "UTC"}},
                "endTime": {{"date": "2026-07-28 10:00:00.500000", "timezone_type": 3, "timezone": "UTC"}},
                "status": {{"code": 0, "message": ""}},
                "attributes": [],
                "timeEvents": [],
                "links": [],
                "sameProcessAsParentSpan": true
            }}"#
        )
    }

    #[test]
    fn skips_invalid_trace_id_but_accepts_valid_one() {
        let invalid = span_json("00", "0123456789abcdef");
        let valid = span_json("00112233445566778899aabbccddeeff", "0123456789abcdef");
        let payload = format!("[{invalid},{valid}]");

        let exporter = Arc::new(RecordingExporter {
            spans: Mutex::new(Vec::new()),
        });
        let exporters: Vec<Arc<dyn Exporter>> = vec![exporter.clone()];
        ingest_trace_export(payload.as_bytes(), &exporters);

        let spans = exporter.spans.lock().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span_id, [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]);
    }

    #[test]
    fn empty_attributes_array_sentinel_decodes_to_empty_map() {
        let json = span_json("00112233445566778899aabbccddeeff", "0123456789abcdef");
        let wire: WireSpan = serde_json::from_str(&json).unwrap();
        assert!(wire.attributes.0.is_empty());
    }

    #[test]
    fn no_exporters_skips_parsing_entirely() {
        // malformed JSON would normally fail to parse; with no exporters it's
        // never attempted, so this must not log a parse warning or panic.
        ingest_trace_export(b"not json at all", &[]);
    }

    #[test]
    fn unparseable_parent_span_id_does_not_reject_span() {
        let json = format!(
            r#"{{
                "traceId": "00112233445566778899aabbccddeeff",
                "spanId": "0123456789abcdef",
                "parentSpanId": "not-hex",
                "name": "x",
                "kind": "CLIENT",
                "stackTrace": [],
                "startTime": {{"date": "2026-07-28 10:00:00.000000", "timezone_type": 3, "timezone": "UTC"}},
                "endTime": {{"date": "2026-07-28 10:00:00.500000", "timezone_type": 3, "timezone": "UTC"}},
                "status": {{"code": 0, "message": ""}},
                "attributes": {{}},
                "timeEvents": [],
                "links": [],
                "sameProcessAsParentSpan": false
            }}]"#
        );
        let payload = format!("[{json}");
        let exporter = Arc::new(RecordingExporter {
            spans: Mutex::new(Vec::new()),
        });
        let exporters: Vec<Arc<dyn Exporter>> = vec![exporter.clone()];
        ingest_trace_export(payload.as_bytes(), &exporters);
        let spans = exporter.spans.lock().unwrap();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].parent_span_id.is_none());
        assert!(spans[0].has_remote_parent);
    }
}
