//! Sequencing and replication of incoming items.
//!
//! The [`Ingress`] numbers every item it is handed, starting at zero,
//! sends a copy to each active replica through a [`Fanout`], and
//! keeps the item in the [`ReplicationBuffer`] until every active
//! replica has acknowledged it. This gives at-least-once delivery to
//! each replica even though any of them may fail.
//!
//! Failure
//! -------
//!
//! Deciding that a replica has failed is not our job; the external
//! controller sends [`crate::model::ControlCommand::ReplicaFailed`].
//! When that arrives, the replica is dropped from the [`ReplicaSet`]
//! and every outstanding debt it had is forgiven, exactly as if it had
//! acknowledged everything. The set can never become empty; trying to
//! remove the last replica is a
//! [`crate::errors::ProtocolViolation`].
//!
//! ```mermaid
//! graph LR
//! UP[Upstream] -- Message --> I{{Ingress}}
//! I -- Delivery --> R0[Replica 0] & R1[Replica 1]
//! R0 & R1 -- Ack --> I
//! C[Controller] -- ReplicaFailed --> I
//! ```

pub(crate) mod buffer;
pub(crate) mod ingress;
pub(crate) mod replica_set;

pub use buffer::AckOutcome;
pub use buffer::BufferEntry;
pub use buffer::FailureOutcome;
pub use buffer::ReplicationBuffer;
pub use ingress::Fanout;
pub use ingress::Ingress;
pub use ingress::IngressStatus;
pub use replica_set::ReplicaSet;
