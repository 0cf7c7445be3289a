use opentelemetry::runtime::Tokio;
use opentelemetry::sdk::trace::config;
use opentelemetry::sdk::trace::Sampler;
use opentelemetry::sdk::trace::Tracer;
use opentelemetry::sdk::Resource;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::TelemetryError;

use super::TracerBuilder;

/// Send traces to the opentelemetry collector:
/// https://opentelemetry.io/docs/collector/
///
/// Only supports GRPC protocol, so make sure to enable
/// it on your OTEL configuration.
///
/// This is the recommended approach since it allows
/// the maximum flexibility in what to do with all the data
/// ackflow can generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtlpTracingConfig {
    /// Service name, identifies this pipeline.
    pub service_name: String,
    /// Optional collector's URL, defaults to `grpc:://127.0.0.1:4317`
    pub url: Option<String>,
    /// Sampling ratio:
    ///   sampling_ratio >= 1 - all traces are sampled
    ///   sampling_ratio <= 0 - most traces are not sampled
    pub sampling_ratio: f64,
}

impl TracerBuilder for OtlpTracingConfig {
    fn build(&self) -> Result<Tracer, TelemetryError> {
        // Instantiate the builder
        let mut exporter = opentelemetry_otlp::new_exporter().tonic();

        // Change the url if required
        if let Some(endpoint) = self.url.as_ref() {
            exporter = exporter.with_endpoint(endpoint);
        }

        // Create the tracer
        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                config()
                    .with_sampler(Sampler::TraceIdRatioBased(self.sampling_ratio))
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        self.service_name.clone(),
                    )])),
            )
            .install_batch(Tokio)
            .map_err(|err| TelemetryError::Tracer(err.to_string()))
    }
}
