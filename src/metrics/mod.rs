//! Operator metrics.
//!
//! Instruments are created from the global OpenTelemetry meter, so
//! they are no-ops until [`initialize_metrics`] installs a provider
//! that exports to the default Prometheus registry.

use opentelemetry::{
    global,
    metrics::{Counter, Histogram, UpDownCounter},
    sdk::metrics::{Aggregation, Instrument, MeterProvider, Stream},
    KeyValue,
};
use prometheus::default_registry;

use crate::errors::TelemetryError;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> Result<(), TelemetryError> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("ackflow")
        .build()
        .map_err(|err| TelemetryError::Metrics(err.to_string()))?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1,
                        0.5, 1.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| TelemetryError::Metrics(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Instruments for one ingress.
pub(crate) struct IngressMetrics {
    pub(crate) item_inp_count: Counter<u64>,
    pub(crate) watermark_count: Counter<u64>,
    pub(crate) ack_count: Counter<u64>,
    pub(crate) unexpected_ack_count: Counter<u64>,
    pub(crate) reclaimed_count: Counter<u64>,
    pub(crate) replica_failed_count: Counter<u64>,
    pub(crate) pending_entries: UpDownCounter<i64>,
    pub(crate) ingest_histogram: Histogram<f64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl IngressMetrics {
    pub(crate) fn new(operator: &str) -> Self {
        let meter = global::meter("ackflow");
        Self {
            item_inp_count: meter
                .u64_counter("item_inp_count")
                .with_description("number of items this ingress has sequenced")
                .init(),
            watermark_count: meter
                .u64_counter("watermark_count")
                .with_description("number of watermarks this ingress has forwarded")
                .init(),
            ack_count: meter
                .u64_counter("ack_count")
                .with_description("number of acknowledgments applied")
                .init(),
            unexpected_ack_count: meter
                .u64_counter("unexpected_ack_count")
                .with_description("number of acknowledgments ignored as unexpected")
                .init(),
            reclaimed_count: meter
                .u64_counter("reclaimed_count")
                .with_description("number of buffer entries reclaimed")
                .init(),
            replica_failed_count: meter
                .u64_counter("replica_failed_count")
                .with_description("number of replicas marked failed")
                .init(),
            pending_entries: meter
                .i64_up_down_counter("pending_entries")
                .with_description("number of items awaiting acknowledgment")
                .init(),
            ingest_histogram: meter
                .f64_histogram("ingest_duration_seconds")
                .with_description("`ingest` duration in seconds")
                .init(),
            labels: vec![KeyValue::new("operator", operator.to_string())],
        }
    }
}

/// Instruments for one checkpointing source.
pub(crate) struct SourceMetrics {
    pub(crate) item_out_count: Counter<u64>,
    pub(crate) checkpoint_count: Counter<u64>,
    pub(crate) rollback_count: Counter<u64>,
    pub(crate) tick_histogram: Histogram<f64>,
    pub(crate) rollback_histogram: Histogram<f64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl SourceMetrics {
    pub(crate) fn new(operator: &str) -> Self {
        let meter = global::meter("ackflow");
        Self {
            item_out_count: meter
                .u64_counter("item_out_count")
                .with_description("number of items this source has emitted")
                .init(),
            checkpoint_count: meter
                .u64_counter("checkpoint_count")
                .with_description("number of checkpoints taken")
                .init(),
            rollback_count: meter
                .u64_counter("rollback_count")
                .with_description("number of rollbacks performed")
                .init(),
            tick_histogram: meter
                .f64_histogram("tick_duration_seconds")
                .with_description("`tick` duration in seconds")
                .init(),
            rollback_histogram: meter
                .f64_histogram("rollback_duration_seconds")
                .with_description("`rollback` duration in seconds")
                .init(),
            labels: vec![KeyValue::new("operator", operator.to_string())],
        }
    }
}

#[test]
fn instruments_show_up_in_registry() {
    initialize_metrics().unwrap();
    let metrics = IngressMetrics::new("registry_test");
    metrics.item_inp_count.add(3, &metrics.labels);
    let elapsed = with_timer!(metrics.ingest_histogram, metrics.labels, 2 + 2);
    assert_eq!(elapsed, 4);

    let names: Vec<String> = prometheus::gather()
        .iter()
        .map(|family| family.get_name().to_string())
        .collect();
    assert!(names.iter().any(|name| name.contains("item_inp_count")));
    assert!(names.iter().any(|name| name.contains("ingest_duration")));
}
