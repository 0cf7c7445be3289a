//! Settings for the operators, logging, and the API server.
//!
//! Every struct has defaults and can be deserialized from JSON with
//! any field left out. A few environment variables override the
//! deserialized values:
//!
//! - `ACKFLOW_LOG`: log filter directives, see [`crate::tracing`].
//! - `ACKFLOW_API_ENABLED`: serve the HTTP API if set at all.
//! - `ACKFLOW_API_PORT`: port for the HTTP API.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::level_filters::LevelFilter;

use crate::errors::ConfigError;
use crate::tracing::TracingConfig;

/// Time between ticks of a source.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TickInterval(Duration);

impl TickInterval {
    pub fn new(dur: Duration) -> Self {
        Self(dur)
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

/// Ten ticks per second.
impl Default for TickInterval {
    fn default() -> Self {
        Self(Duration::from_millis(100))
    }
}

/// How a [`crate::checkpoint::CheckpointingSource`] behaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Take a checkpoint whenever the sequence number is a multiple
    /// of this.
    pub checkpoint_freq: u64,
    /// Number of recent state items kept in the window.
    pub window_size: usize,
    /// Terminate after emitting this many messages.
    pub num_messages: u64,
    /// Milliseconds between ticks when driven by
    /// [`crate::runtime::run_source`].
    pub tick_interval_ms: u64,
    /// Keep only this many of the newest checkpoints. Unlimited if
    /// unset.
    pub max_checkpoints: Option<usize>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            checkpoint_freq: 10,
            window_size: 10,
            num_messages: 50,
            tick_interval_ms: 100,
            max_checkpoints: None,
        }
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoint_freq == 0 {
            return Err(ConfigError::ZeroCheckpointFrequency);
        }
        if self.window_size == 0 {
            return Err(ConfigError::ZeroWindowSize);
        }
        if self.max_checkpoints == Some(0) {
            return Err(ConfigError::ZeroRetention);
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> TickInterval {
        TickInterval::new(Duration::from_millis(self.tick_interval_ms))
    }
}

/// How a [`crate::replication::Ingress`] is set up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// Replicas are numbered `0..replicas`.
    pub replicas: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self { replicas: 2 }
    }
}

impl IngressConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replicas == 0 {
            return Err(ConfigError::NoReplicas);
        }
        Ok(())
    }
}

/// The status and metrics HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 3030,
        }
    }
}

impl ApiConfig {
    /// Apply `ACKFLOW_API_ENABLED` and `ACKFLOW_API_PORT`.
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        if std::env::var("ACKFLOW_API_ENABLED").is_ok() {
            self.enabled = true;
        }
        if let Ok(value) = std::env::var("ACKFLOW_API_PORT") {
            self.port = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "ACKFLOW_API_PORT",
                value,
            })?;
        }
        Ok(self)
    }
}

/// Everything needed to stand up a source and an ingress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub ingress: IngressConfig,
    pub api: ApiConfig,
    /// One of `trace`, `debug`, `info`, `warn`, `error`. Defaults to
    /// `error`.
    pub log_level: Option<String>,
    /// Where to export traces. Logs only if unset.
    pub tracing: Option<TracingConfig>,
}

impl PipelineConfig {
    /// Parse from JSON, apply the environment, and validate.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(json)?;
        config.api = config.api.with_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source.validate()?;
        self.ingress.validate()?;
        self.log_level()?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<LevelFilter, ConfigError> {
        get_log_level(self.log_level.as_deref())
    }
}

pub(crate) fn get_log_level(level: Option<&str>) -> Result<LevelFilter, ConfigError> {
    if let Some(level) = level {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            _ => Err(ConfigError::InvalidLogLevel(level.to_string())),
        }
    } else {
        Ok(LevelFilter::ERROR)
    }
}

#[test]
fn partial_json_uses_defaults() {
    let config: PipelineConfig =
        serde_json::from_str(r#"{"source": {"window_size": 3, "checkpoint_freq": 2}}"#).unwrap();
    assert_eq!(config.source.window_size, 3);
    assert_eq!(config.source.checkpoint_freq, 2);
    assert_eq!(config.source.num_messages, 50);
    assert_eq!(config.ingress.replicas, 2);
    assert_eq!(config.api.port, 3030);
    assert_eq!(config.log_level().unwrap(), LevelFilter::ERROR);
}

#[test]
fn validation_rejects_zeroes() {
    let bad = SourceConfig {
        checkpoint_freq: 0,
        ..SourceConfig::default()
    };
    assert!(matches!(
        bad.validate(),
        Err(ConfigError::ZeroCheckpointFrequency)
    ));

    let bad = SourceConfig {
        window_size: 0,
        ..SourceConfig::default()
    };
    assert!(matches!(bad.validate(), Err(ConfigError::ZeroWindowSize)));

    let bad = SourceConfig {
        max_checkpoints: Some(0),
        ..SourceConfig::default()
    };
    assert!(matches!(bad.validate(), Err(ConfigError::ZeroRetention)));

    let bad = IngressConfig { replicas: 0 };
    assert!(matches!(bad.validate(), Err(ConfigError::NoReplicas)));
}

#[test]
fn bad_json_and_log_level_are_errors() {
    assert!(matches!(
        PipelineConfig::from_json("{"),
        Err(ConfigError::Json(..))
    ));
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(ConfigError::InvalidLogLevel(..))
    ));
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
}

#[test]
fn tick_interval_from_millis() {
    let config = SourceConfig {
        tick_interval_ms: 250,
        ..SourceConfig::default()
    };
    assert_eq!(config.tick_interval().as_duration(), Duration::from_millis(250));
    assert_eq!(TickInterval::default().as_duration(), Duration::from_millis(100));
}

#[test]
fn pipeline_json_reaches_ingress_and_tracing() {
    use crate::replication::Ingress;
    use crate::tracing::OtlpTracingConfig;

    let config = PipelineConfig::from_json(
        r#"{
            "ingress": {"replicas": 3},
            "log_level": "info",
            "tracing": {"Otlp": {"service_name": "edge", "url": null, "sampling_ratio": 1.0}}
        }"#,
    )
    .unwrap();
    let ingress = Ingress::<u64>::from_config(&config.ingress).unwrap();
    assert_eq!(ingress.buffer().replicas().len(), 3);
    assert_eq!(ingress.status().replicas, (0..3).map(ReplicaId).collect::<Vec<_>>());
    assert_eq!(config.log_level().unwrap(), LevelFilter::INFO);
    assert_eq!(
        config.tracing,
        Some(TracingConfig::Otlp(OtlpTracingConfig {
            service_name: "edge".to_string(),
            url: None,
            sampling_ratio: 1.0,
        }))
    );
}

#[cfg(test)]
use crate::model::ReplicaId;
