use opentelemetry::{
    runtime::Tokio,
    sdk::trace::{config, Sampler, Tracer},
};
use serde::Deserialize;
use serde::Serialize;

use crate::errors::TelemetryError;

use super::TracerBuilder;

/// Send traces to a Jaeger agent.
///
/// `endpoint` defaults to the agent's standard `127.0.0.1:6831` and
/// `sampling_ratio` to sampling everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JaegerConfig {
    pub service_name: String,
    pub endpoint: Option<String>,
    pub sampling_ratio: Option<f64>,
}

impl TracerBuilder for JaegerConfig {
    fn build(&self) -> Result<Tracer, TelemetryError> {
        opentelemetry::global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());
        let mut tracer = opentelemetry_jaeger::new_agent_pipeline()
            .with_trace_config(config().with_sampler(Sampler::TraceIdRatioBased(
                self.sampling_ratio.unwrap_or(1.0),
            )))
            .with_service_name(self.service_name.clone());

        // Overwrite the endpoint if needed
        if let Some(endpoint) = self.endpoint.as_ref() {
            tracer = tracer.with_endpoint(endpoint);
        }

        tracer
            .install_batch(Tokio)
            .map_err(|err| TelemetryError::Tracer(err.to_string()))
    }
}
