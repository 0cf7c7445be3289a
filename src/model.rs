//! Data model shared by the ingress and the checkpointing source.
//!
//! Everything that crosses an operator boundary (items, watermarks,
//! acknowledgments and control commands) is defined here so both
//! sides of a channel agree on the shape of the data.

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;

/// Position of an item in ingestion order.
///
/// Assigned by [`crate::replication::Ingress`] starting at zero, and
/// by [`crate::checkpoint::CheckpointingSource`] starting at one.
/// Never reused within a run of either.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeqNum(pub u64);

impl SeqNum {
    /// The sequence number that follows this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for SeqNum {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "{}", self.0)
    }
}

/// Identifies one downstream replica.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub usize);

impl Display for ReplicaId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "{}", self.0)
    }
}

/// Logical time of a message.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The timestamp before any data.
    pub const ZERO: Timestamp = Timestamp(0);
}

/// The source derives logical time directly from its counter.
impl From<SeqNum> for Timestamp {
    fn from(seq: SeqNum) -> Self {
        Self(seq.0)
    }
}

impl Display for Timestamp {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "t{}", self.0)
    }
}

/// A payload which has been assigned its place in ingestion order.
///
/// Only the ingress can build one, and there are no setters, so an
/// item can't change once it has a sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item<P> {
    seq: SeqNum,
    timestamp: Timestamp,
    payload: P,
}

impl<P> Item<P> {
    pub(crate) fn new(seq: SeqNum, timestamp: Timestamp, payload: P) -> Self {
        Self {
            seq,
            timestamp,
            payload,
        }
    }

    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

/// What flows on a data channel.
///
/// A watermark only ever carries a timestamp and is used solely to
/// signal progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message<P> {
    Data { timestamp: Timestamp, payload: P },
    Watermark(Timestamp),
}

impl<P> Message<P> {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Data { timestamp, .. } => *timestamp,
            Self::Watermark(timestamp) => *timestamp,
        }
    }

    pub fn is_watermark(&self) -> bool {
        matches!(self, Self::Watermark(..))
    }
}

/// What the ingress hands to each replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Delivery<P> {
    Item(Item<P>),
    Watermark(Timestamp),
}

/// A replica's confirmation that it has processed an item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub seq: SeqNum,
    pub replica: ReplicaId,
}

impl Ack {
    pub fn new(seq: SeqNum, replica: ReplicaId) -> Self {
        Self { seq, replica }
    }
}

/// Commands sent by the external controller.
///
/// The ingress acts on [`ControlCommand::ReplicaFailed`] and the
/// source acts on [`ControlCommand::Rollback`]; each logs and ignores
/// the other kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Rewind to the checkpoint with this key, or start over if
    /// [`None`].
    Rollback(Option<SeqNum>),
    /// Stop waiting on this replica.
    ReplicaFailed(ReplicaId),
}

#[test]
fn control_command_tokens() {
    use serde_test::{assert_tokens, Token};

    assert_tokens(
        &ControlCommand::Rollback(Some(SeqNum(4))),
        &[
            Token::NewtypeVariant {
                name: "ControlCommand",
                variant: "Rollback",
            },
            Token::Some,
            Token::NewtypeStruct { name: "SeqNum" },
            Token::U64(4),
        ],
    );
    assert_tokens(
        &ControlCommand::Rollback(None),
        &[
            Token::NewtypeVariant {
                name: "ControlCommand",
                variant: "Rollback",
            },
            Token::None,
        ],
    );
    assert_tokens(
        &ControlCommand::ReplicaFailed(ReplicaId(1)),
        &[
            Token::NewtypeVariant {
                name: "ControlCommand",
                variant: "ReplicaFailed",
            },
            Token::NewtypeStruct { name: "ReplicaId" },
            Token::U64(1),
        ],
    );
}

#[test]
fn control_command_from_json() {
    let cmd: ControlCommand = serde_json::from_str(r#"{"Rollback":6}"#).unwrap();
    assert_eq!(cmd, ControlCommand::Rollback(Some(SeqNum(6))));

    let cmd: ControlCommand = serde_json::from_str(r#"{"Rollback":null}"#).unwrap();
    assert_eq!(cmd, ControlCommand::Rollback(None));

    let cmd: ControlCommand = serde_json::from_str(r#"{"ReplicaFailed":0}"#).unwrap();
    assert_eq!(cmd, ControlCommand::ReplicaFailed(ReplicaId(0)));
}

#[test]
fn watermark_carries_only_timestamp() {
    let data: Message<&str> = Message::Data {
        timestamp: Timestamp(3),
        payload: "x",
    };
    let watermark: Message<&str> = Message::Watermark(Timestamp(3));
    assert!(!data.is_watermark());
    assert!(watermark.is_watermark());
    assert_eq!(data.timestamp(), watermark.timestamp());
}
