//! Delivery and recovery plumbing for a streaming pipeline.
//!
//! Two operators sit at the edges of a pipeline:
//!
//! - An [`replication::Ingress`] stamps incoming items with sequence
//!   numbers, fans them out to a set of replicas, and keeps each item
//!   until every replica still alive has acknowledged it.
//!
//! - A [`checkpoint::CheckpointingSource`] emits a numbered stream
//!   with watermarks, snapshots its recent state every so often, and
//!   can be rolled back to any snapshot it still holds.
//!
//! Both are plain state machines driven by callbacks. The
//! [`runtime`] module runs them as tokio tasks connected by channels,
//! and [`webserver`] exposes their status and metrics over HTTP.

pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod progress;
pub mod replication;
pub mod runtime;
pub mod tracing;
pub mod webserver;

pub use config::PipelineConfig;
pub use errors::ProtocolViolation;
pub use model::ControlCommand;
pub use model::SeqNum;
