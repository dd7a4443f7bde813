//! Single-consumer dispatch loop: drains the queue and routes each message
//! by type. Never lets a handler's error unwind past the loop.

use crate::codec::FloatWidth;
use crate::frame::{Message, MessageType};
use crate::metrics::{self, DispatchMetrics};
use crate::queue::QueueConsumer;
use crate::record::{self, RecordOutcome};
use crate::registry::{Aggregation, Measure, MeasureKind, Registry, View};
use crate::span::{self, Exporter};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
enum HandlerError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),
}

/// Callback the telemetry runtime exposes for accepted `StatsRecord`
/// submissions. Injected at construction, considered external.
pub trait StatsSink: Send + Sync {
    fn submit(&self, measure_name: &str, value: f64, tags: &[(String, String)]);
}

/// A no-op sink, used when no upstream telemetry runtime is wired in (tests,
/// or a daemon instance running purely as a forwarder-under-construction).
pub struct NullSink;

impl StatsSink for NullSink {
    fn submit(&self, _measure_name: &str, _value: f64, _tags: &[(String, String)]) {}
}

/// The telemetry runtime's exemplar extraction hook. An accepted
/// `StatsRecord`'s attachment context is handed to this once, then discarded.
pub trait ExemplarHook: Send + Sync {
    fn observe(&self, attachments: &[(String, String)]);
}

/// A no-op hook, used when the runtime has no exemplar subsystem wired in.
pub struct NullExemplarHook;

impl ExemplarHook for NullExemplarHook {
    fn observe(&self, _attachments: &[(String, String)]) {}
}

pub struct Dispatcher {
    consumer: QueueConsumer,
    registry: Registry,
    exporters: Vec<Arc<dyn Exporter>>,
    sink: Arc<dyn StatsSink>,
    exemplar_hook: Arc<dyn ExemplarHook>,
    metrics: Arc<DispatchMetrics>,
}

impl Dispatcher {
    pub fn new(
        consumer: QueueConsumer,
        registry: Registry,
        exporters: Vec<Arc<dyn Exporter>>,
        sink: Arc<dyn StatsSink>,
        exemplar_hook: Arc<dyn ExemplarHook>,
    ) -> Self {
        Self {
            consumer,
            registry,
            exporters,
            sink,
            exemplar_hook,
            metrics: Arc::new(DispatchMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        self.metrics.clone()
    }

    /// Drain the queue until it is closed (all producers dropped). Runs on
    /// its own dedicated thread in the full daemon.
    pub fn run(&self) {
        loop {
            match self.consumer.dequeue() {
                Ok(message) => self.dispatch(message),
                Err(_closed) => {
                    tracing::info!("dispatcher queue closed, exiting");
                    return;
                }
            }
        }
    }

    fn dispatch(&self, message: Message) {
        let type_label = message.msg_type.label();
        let queue_latency_ms = metrics::elapsed_ms(message.receive_time);
        let start_latency_s = message.start_time;

        self.metrics.record_request();
        self.sink.submit(
            metrics::QUEUE_LATENCY,
            queue_latency_ms,
            &[("msg_type".to_string(), type_label.to_string())],
        );
        self.sink.submit(
            metrics::MESSAGE_SIZE,
            message.payload.len() as f64,
            &[("msg_type".to_string(), type_label.to_string())],
        );

        let outcome = match message.msg_type {
            MessageType::ProcessInit
            | MessageType::ProcessShutdown
            | MessageType::RequestInit
            | MessageType::RequestShutdown => Ok(()),
            MessageType::MeasureCreate => self.handle_measure_create(&message.payload),
            MessageType::ViewReportingPeriod => {
                self.handle_reporting_period(&message.payload, message.float_width)
            }
            MessageType::ViewRegister => {
                self.handle_view_register(&message.payload, message.float_width)
            }
            MessageType::ViewUnregister => self.handle_view_unregister(&message.payload),
            MessageType::StatsRecord => {
                self.handle_stats_record(&message.payload, message.float_width)
            }
            MessageType::TraceExport => {
                span::ingest_trace_export(&message.payload, &self.exporters);
                Ok(())
            }
            MessageType::Unknown(tag) => {
                tracing::debug!(tag, "discarding message of unknown type");
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {
                self.metrics.record_processed();
                self.sink.submit(
                    metrics::PROCESS_COUNT,
                    1.0,
                    &[("msg_type".to_string(), type_label.to_string())],
                );
            }
            Err(err) => {
                tracing::warn!(msg_type = type_label, error = %err, "handler failed, message abandoned");
                self.metrics.record_dropped();
                self.sink.submit(
                    metrics::DROP_COUNT,
                    1.0,
                    &[("msg_type".to_string(), type_label.to_string())],
                );
            }
        }

        if start_latency_s > 0.0 {
            let now_s = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            let latency_ms = ((now_s - start_latency_s).max(0.0)) * 1000.0;
            self.sink.submit(
                metrics::LATENCY,
                latency_ms,
                &[("msg_type".to_string(), type_label.to_string())],
            );
        }
    }

    fn handle_measure_create(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let mut cur = crate::codec::Cursor::new(payload);
        let kind_tag = cur.u8().map_err(|e| HandlerError::Decode(e.to_string()))?;
        let kind = MeasureKind::from_wire(kind_tag);
        if kind == MeasureKind::Unknown {
            tracing::debug!(kind_tag, "MeasureCreate with unknown kind, dropping");
            return Ok(());
        }
        let name = cur.string().map_err(|e| HandlerError::Decode(e.to_string()))?;
        let description = cur.string().map_err(|e| HandlerError::Decode(e.to_string()))?;
        let unit = cur.string().map_err(|e| HandlerError::Decode(e.to_string()))?;

        self.registry.create_measure(Measure {
            name,
            description,
            unit,
            kind,
        });
        Ok(())
    }

    fn handle_reporting_period(
        &self,
        payload: &[u8],
        float_width: FloatWidth,
    ) -> Result<(), HandlerError> {
        let mut cur = crate::codec::Cursor::new(payload);
        let seconds = cur
            .float(float_width)
            .map_err(|e| HandlerError::Decode(e.to_string()))?;
        if !seconds.is_finite() {
            return Err(HandlerError::Decode(format!(
                "reporting period {seconds} is not finite"
            )));
        }
        self.registry
            .set_reporting_period(Duration::from_secs_f64(seconds.max(0.0)));
        Ok(())
    }

    fn handle_view_register(
        &self,
        payload: &[u8],
        float_width: FloatWidth,
    ) -> Result<(), HandlerError> {
        let mut cur = crate::codec::Cursor::new(payload);
        let view_count = cur.varuint().map_err(|e| HandlerError::Decode(e.to_string()))?;
        let mut views = Vec::with_capacity(cur.capacity_hint(view_count));

        for _ in 0..view_count {
            let name = cur.string().map_err(|e| HandlerError::Decode(e.to_string()))?;
            let description = cur.string().map_err(|e| HandlerError::Decode(e.to_string()))?;
            let tag_key_count = cur.varuint().map_err(|e| HandlerError::Decode(e.to_string()))?;
            let mut tag_keys = Vec::with_capacity(cur.capacity_hint(tag_key_count));
            for _ in 0..tag_key_count {
                tag_keys.push(cur.string().map_err(|e| HandlerError::Decode(e.to_string()))?);
            }
            let measure_name = cur.string().map_err(|e| HandlerError::Decode(e.to_string()))?;
            let aggregation_tag = cur.varuint().map_err(|e| HandlerError::Decode(e.to_string()))?;

            let boundaries = if aggregation_tag == 3 {
                let boundary_count = cur.varuint().map_err(|e| HandlerError::Decode(e.to_string()))?;
                let mut boundaries = Vec::with_capacity(cur.capacity_hint(boundary_count));
                for _ in 0..boundary_count {
                    boundaries.push(
                        cur.float(float_width)
                            .map_err(|e| HandlerError::Decode(e.to_string()))?,
                    );
                }
                boundaries
            } else {
                Vec::new()
            };

            let aggregation = Aggregation::from_wire(aggregation_tag, boundaries)
                .ok_or_else(|| HandlerError::Decode(format!("unknown aggregation {aggregation_tag}")))?;

            views.push(View {
                name,
                description,
                tag_keys,
                measure_name,
                aggregation,
            });
        }

        self.registry.register_views(views)?;
        Ok(())
    }

    fn handle_view_unregister(&self, payload: &[u8]) -> Result<(), HandlerError> {
        let mut cur = crate::codec::Cursor::new(payload);
        let view_count = cur.varuint().map_err(|e| HandlerError::Decode(e.to_string()))?;
        let mut names = Vec::with_capacity(cur.capacity_hint(view_count));
        for _ in 0..view_count {
            names.push(cur.string().map_err(|e| HandlerError::Decode(e.to_string()))?);
        }
        self.registry.unregister_views(&names);
        Ok(())
    }

    fn handle_stats_record(
        &self,
        payload: &[u8],
        float_width: FloatWidth,
    ) -> Result<(), HandlerError> {
        let record = record::decode_stats_record(payload, float_width)
            .map_err(|e| HandlerError::Decode(e.to_string()))?;

        match record::apply_policy(record, &self.registry) {
            RecordOutcome::Submissions(accepted) => {
                for s in &accepted.submissions {
                    self.sink.submit(&s.measure_name, s.value, &s.tags);
                }
                if !accepted.attachments.is_empty() {
                    self.exemplar_hook.observe(&accepted.attachments);
                }
                Ok(())
            }
            RecordOutcome::DroppedEmpty => {
                tracing::debug!("StatsRecord dropped: no measurements resolved");
                Ok(())
            }
            RecordOutcome::RejectedTagKey(key) => {
                Err(HandlerError::Decode(format!("invalid tag key '{key}'")))
            }
        }
    }
}
