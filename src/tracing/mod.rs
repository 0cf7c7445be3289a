//! Internal code for tracing/logging.
//!
//! This module is used to configure both tracing and logging.
//! Logging to stdout is always enabled, at least at the "ERROR" level.
//! Exporting traces is opt in; by default it is disabled.
//!
//! Log filtering can be overridden with the `ACKFLOW_LOG` env var,
//! which takes tracing-subscriber's `EnvFilter` directives:
//! https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html
//!
//! eg: to set ackflow's logs to the "debug" level, and all other
//! crates to the "error" level:
//!     $ ACKFLOW_LOG="ackflow=debug,error" my-pipeline
//!
//! Each trace exporter has to implement the `TracerBuilder` trait.
use opentelemetry::sdk::trace::Tracer;
use serde::Deserialize;
use serde::Serialize;
use tokio::runtime::EnterGuard;
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::config::get_log_level;
use crate::config::PipelineConfig;
use crate::errors::TelemetryError;

pub(crate) mod jaeger_tracing;
pub(crate) mod otlp_tracing;

pub use jaeger_tracing::JaegerConfig;
pub use otlp_tracing::OtlpTracingConfig;

/// Where to export traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TracingConfig {
    Otlp(OtlpTracingConfig),
    Jaeger(JaegerConfig),
}

/// Trait that all the tracing config should implement.
/// This function should just return the proper `Tracer` for the backend.
trait TracerBuilder {
    fn build(&self) -> Result<Tracer, TelemetryError>;
}

impl TracerBuilder for TracingConfig {
    fn build(&self) -> Result<Tracer, TelemetryError> {
        match self {
            Self::Otlp(conf) => conf.build(),
            Self::Jaeger(conf) => conf.build(),
        }
    }
}

/// Utility class used to handle tracing.
///
/// It keeps a tokio runtime that is alive as long as the struct itself.
pub struct AckflowTracer {
    rt: tokio::runtime::Runtime,
}

/// `ACKFLOW_LOG` if set, otherwise just our crate at `log_level`.
fn log_filter(log_level: LevelFilter) -> EnvFilter {
    EnvFilter::try_from_env("ACKFLOW_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("ackflow={log_level}")))
}

impl AckflowTracer {
    pub fn new() -> Result<Self, TelemetryError> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tracing-threads")
            .enable_all()
            .build()?;
        Ok(Self { rt })
    }

    /// Call this with a [`TracingConfig`] to configure tracing.
    /// Returns a guard that you have to keep in scope for the
    /// whole execution of the code you want to trace.
    pub fn setup(
        &self,
        conf: Option<TracingConfig>,
        log_level: Option<&str>,
    ) -> Result<EnterGuard<'_>, TelemetryError> {
        let guard = self.rt.enter();

        let log_level = get_log_level(log_level).map_err(|err| TelemetryError::Tracer(err.to_string()))?;

        // We need an async block to properly initialize the tracing runtime.
        let initializer = async move {
            // Prepare the log layer
            let logs = tracing_subscriber::fmt::Layer::default()
                .compact()
                // Show source file
                .with_file(true)
                // Display source code line numbers
                .with_line_number(true)
                // Display the thread ID an event was recorded on
                .with_thread_ids(true)
                .with_filter(log_filter(log_level));

            // If the conf was not none, setup the global subscriber with both log and
            // telemetry layer, otherwise just setup logging.
            if let Some(conf) = conf {
                let tracer = conf.build()?;
                let telemetry = tracing_opentelemetry::layer()
                    .with_tracer(tracer)
                    // Send all traces from ackflow
                    .with_filter(Targets::new().with_target("ackflow", LevelFilter::TRACE));
                set_global_subscriber(Registry::default().with(logs).with(telemetry));
            } else {
                set_global_subscriber(Registry::default().with(logs));
            };
            Ok::<(), TelemetryError>(())
        };
        self.rt
            .block_on(self.rt.spawn(initializer))
            .map_err(|err| TelemetryError::Tracer(err.to_string()))??;
        Ok(guard)
    }

    /// [`AckflowTracer::setup`] with the exporter and level from a
    /// pipeline's config.
    pub fn setup_from_config(
        &self,
        config: &PipelineConfig,
    ) -> Result<EnterGuard<'_>, TelemetryError> {
        self.setup(config.tracing.clone(), config.log_level.as_deref())
    }
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, which happens
    // in tests and if a pipeline is set up more than once in the same
    // process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn setup_twice_only_warns() {
    let tracer = AckflowTracer::new().unwrap();
    {
        let _guard = tracer.setup(None, Some("debug")).unwrap();
        tracing::debug!("first setup");
    }
    let _guard = tracer.setup(None, None).unwrap();
}

#[test]
fn setup_rejects_unknown_level() {
    let tracer = AckflowTracer::new().unwrap();
    assert!(tracer.setup(None, Some("chatty")).is_err());
}

#[test]
fn setup_reads_pipeline_config() {
    let tracer = AckflowTracer::new().unwrap();
    let config = PipelineConfig {
        log_level: Some("warn".to_string()),
        ..PipelineConfig::default()
    };
    {
        let _guard = tracer.setup_from_config(&config).unwrap();
    }

    let bad = PipelineConfig {
        log_level: Some("chatty".to_string()),
        ..PipelineConfig::default()
    };
    assert!(tracer.setup_from_config(&bad).is_err());
}

#[test]
fn tracing_config_from_json() {
    let conf: TracingConfig = serde_json::from_str(
        r#"{"Otlp": {"service_name": "ingress", "url": null, "sampling_ratio": 0.5}}"#,
    )
    .unwrap();
    assert_eq!(
        conf,
        TracingConfig::Otlp(OtlpTracingConfig {
            service_name: "ingress".to_string(),
            url: None,
            sampling_ratio: 0.5,
        })
    );
}
