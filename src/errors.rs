//! Error taxonomy.
//!
//! - [`ProtocolViolation`] is fatal. The operator that hits one stops,
//!   since continuing would break ordering or recovery guarantees.
//!
//! - [`UnexpectedAck`] is recoverable. It is logged and ignored.
//!
//! - [`ConfigError`] and [`TelemetryError`] are raised while setting
//!   things up, before any operator runs.

use std::panic::Location;

use thiserror::Error;

use crate::model::ReplicaId;
use crate::model::SeqNum;

/// Conditions which abort the owning operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("removing replica {replica} would leave the replica set empty")]
    EmptyReplicaSet { replica: ReplicaId },
    #[error("rollback references unknown checkpoint {id}")]
    UnknownCheckpoint { id: SeqNum },
    #[error("checkpoint {key} was already taken")]
    CheckpointCollision { key: SeqNum },
}

/// Acknowledgments the buffer can't apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UnexpectedAck {
    #[error("replica {replica} acknowledged unknown sequence number {seq}")]
    UnknownSequence { seq: SeqNum, replica: ReplicaId },
    #[error("replica {replica} is not pending on sequence number {seq}")]
    NotPending { seq: SeqNum, replica: ReplicaId },
}

/// Invalid settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("checkpoint frequency must be at least 1")]
    ZeroCheckpointFrequency,
    #[error("window size must be at least 1")]
    ZeroWindowSize,
    #[error("checkpoint retention must keep at least 1 checkpoint")]
    ZeroRetention,
    #[error("at least one replica is required")]
    NoReplicas,
    #[error("unknown log level {0:?}")]
    InvalidLogLevel(String),
    #[error("unable to parse {var}={value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("unable to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures setting up logging, tracing, metrics or the API server.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("error installing tracer: {0}")]
    Tracer(String),
    #[error("error initializing metrics: {0}")]
    Metrics(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Server(String),
}

/// Log a fatal condition with the location that detected it, then
/// hand it back for propagation.
#[track_caller]
pub(crate) fn fatal(err: ProtocolViolation) -> ProtocolViolation {
    let caller = Location::caller();
    tracing::error!("{}", prepend_caller(caller, &err.to_string()));
    err
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

#[test]
fn prepend_caller_formats() {
    let caller = Location::caller();
    let msg = prepend_caller(caller, "boom");
    assert!(msg.starts_with('('));
    assert!(msg.ends_with(") boom"));
    assert!(msg.contains("errors.rs"));
}

#[test]
fn prepend_tname_prefixes_each_line() {
    let handle = std::thread::Builder::new()
        .name("ingress".to_string())
        .spawn(|| prepend_tname("a\nb".to_string()))
        .unwrap();
    assert_eq!(handle.join().unwrap(), "<ingress> a\n<ingress> b\n");
}
