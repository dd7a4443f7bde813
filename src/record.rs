//! Decode and ingest policy for `StatsRecord` payloads.

use crate::codec::Cursor;
use crate::error::DecodeError;
use crate::registry::{MeasureKind, Registry};

/// One measurement as declared on the wire, before resolution against the
/// registry.
#[derive(Debug, Clone)]
struct RawMeasurement {
    name: String,
    kind: MeasureKind,
    int_value: i64,
    float_value: f64,
}

/// A measurement resolved against a known, kind-matching measure.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub measure_name: String,
    pub value: f64,
    pub tags: Vec<(String, String)>,
}

/// A fully decoded, but not yet policy-filtered, stats record.
#[derive(Debug, Clone)]
pub struct StatsRecord {
    measurements: Vec<RawMeasurement>,
    pub tags: Vec<(String, String)>,
    pub attachments: Vec<(String, String)>,
}

/// Measurements accepted against the registry, plus the record's attachment
/// context, still attached and not yet handed to the exemplar hook.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedRecord {
    pub submissions: Vec<Submission>,
    pub attachments: Vec<(String, String)>,
}

#[derive(Debug, PartialEq)]
pub enum RecordOutcome {
    Submissions(AcceptedRecord),
    DroppedEmpty,
    RejectedTagKey(String),
}

pub fn decode_stats_record(
    payload: &[u8],
    float_width: crate::codec::FloatWidth,
) -> Result<StatsRecord, DecodeError> {
    let mut cur = Cursor::new(payload);

    let measurement_count = cur.varuint()?;
    let mut measurements = Vec::with_capacity(cur.capacity_hint(measurement_count));
    for _ in 0..measurement_count {
        let name = cur.string()?;
        let kind_tag = cur.varuint()?;
        let kind = MeasureKind::from_wire(kind_tag as u8);
        let (int_value, float_value) = match kind_tag {
            1 => (cur.varuint()? as i64, 0.0),
            2 => (0, cur.float(float_width)?),
            other => {
                return Err(DecodeError::invalid(
                    cur.offset(),
                    format!("unknown measurement kind tag {other}"),
                ))
            }
        };
        measurements.push(RawMeasurement {
            name,
            kind,
            int_value,
            float_value,
        });
    }

    let tag_count = cur.varuint()?;
    let mut tags = Vec::with_capacity(cur.capacity_hint(tag_count));
    for _ in 0..tag_count {
        let key = cur.string()?;
        let value = cur.string()?;
        tags.push((key, value));
    }

    let attachment_count = cur.varuint()?;
    let mut attachments = Vec::with_capacity(cur.capacity_hint(attachment_count));
    for _ in 0..attachment_count {
        let key = cur.string()?;
        let value = cur.string()?;
        attachments.push((key, value));
    }

    if measurement_count == 0 {
        return Err(DecodeError::invalid(0, "StatsRecord has zero measurements"));
    }

    Ok(StatsRecord {
        measurements,
        tags,
        attachments,
    })
}

/// A tag key is valid if it is non-empty and contains no NUL byte. UTF-8
/// validity is already guaranteed by the string decoder.
fn is_valid_tag_key(key: &str) -> bool {
    !key.is_empty() && !key.contains('\0')
}

/// Apply the ingest policy: resolve measurements against the registry,
/// dropping mismatches, and reject the whole record on an invalid tag key.
pub fn apply_policy(record: StatsRecord, registry: &Registry) -> RecordOutcome {
    for (key, _) in &record.tags {
        if !is_valid_tag_key(key) {
            return RecordOutcome::RejectedTagKey(key.clone());
        }
    }

    let mut submissions = Vec::new();
    for m in record.measurements {
        let Some(measure) = registry.measure(&m.name) else {
            tracing::debug!(measure = %m.name, "StatsRecord references unknown measure, skipping");
            continue;
        };
        if measure.kind != m.kind {
            tracing::debug!(
                measure = %m.name,
                declared = ?m.kind,
                registered = ?measure.kind,
                "StatsRecord measurement kind mismatch, skipping"
            );
            continue;
        }
        let value = match m.kind {
            MeasureKind::Int => m.int_value as f64,
            MeasureKind::Float => m.float_value,
            MeasureKind::Unknown => continue,
        };
        submissions.push(Submission {
            measure_name: m.name,
            value,
            tags: record.tags.clone(),
        });
    }

    if submissions.is_empty() {
        RecordOutcome::DroppedEmpty
    } else {
        RecordOutcome::Submissions(AcceptedRecord {
            submissions,
            attachments: record.attachments,
        })
    }
}
