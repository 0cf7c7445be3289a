use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::IngressConfig;
use crate::errors::fatal;
use crate::errors::ConfigError;
use crate::errors::ProtocolViolation;
use crate::errors::UnexpectedAck;
use crate::model::Ack;
use crate::model::ControlCommand;
use crate::model::Delivery;
use crate::model::Item;
use crate::model::Message;
use crate::model::ReplicaId;
use crate::model::SeqNum;
use crate::model::Timestamp;

use super::AckOutcome;
use super::FailureOutcome;
use super::ReplicaSet;
use super::ReplicationBuffer;

/// Where the ingress sends things.
///
/// Each replica must see deliveries in the order they were handed
/// over here.
pub trait Fanout<P> {
    fn deliver(&mut self, replica: ReplicaId, delivery: Delivery<P>);

    /// Called once a replica has been marked failed. Nothing more
    /// will be delivered to it.
    fn retire(&mut self, replica: ReplicaId);
}

/// Collects deliveries per replica. Handy when you drive the ingress
/// by hand.
impl<P> Fanout<P> for BTreeMap<ReplicaId, Vec<Delivery<P>>> {
    fn deliver(&mut self, replica: ReplicaId, delivery: Delivery<P>) {
        self.entry(replica).or_default().push(delivery);
    }

    fn retire(&mut self, _replica: ReplicaId) {}
}

/// Snapshot of the ingress for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngressStatus {
    pub next_seq: SeqNum,
    pub pending: usize,
    pub replicas: Vec<ReplicaId>,
    pub replica_epoch: u64,
}

/// Assigns sequence numbers and fans items out to replicas,
/// retaining each until all active replicas acknowledge it.
#[derive(Debug)]
pub struct Ingress<P> {
    next_seq: SeqNum,
    buffer: ReplicationBuffer<P>,
}

impl<P> Ingress<P>
where
    P: Clone,
{
    pub fn new(replicas: ReplicaSet) -> Self {
        Self {
            next_seq: SeqNum(0),
            buffer: ReplicationBuffer::new(replicas),
        }
    }

    /// An ingress over replicas `0..config.replicas`.
    pub fn from_config(config: &IngressConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(ReplicaSet::from_config(config)?))
    }

    pub fn buffer(&self) -> &ReplicationBuffer<P> {
        &self.buffer
    }

    /// The number the next ingested item will get.
    pub fn next_seq(&self) -> SeqNum {
        self.next_seq
    }

    pub fn status(&self) -> IngressStatus {
        IngressStatus {
            next_seq: self.next_seq,
            pending: self.buffer.len(),
            replicas: self.buffer.replicas().iter().copied().collect(),
            replica_epoch: self.buffer.replicas().epoch(),
        }
    }

    /// Number an item, retain it, and send it to every active
    /// replica.
    pub fn ingest(&mut self, timestamp: Timestamp, payload: P, out: &mut impl Fanout<P>) -> SeqNum {
        let seq = self.next_seq;
        self.next_seq = seq.next();

        let item = Item::new(seq, timestamp, payload);
        for replica in self.buffer.replicas().iter() {
            out.deliver(*replica, Delivery::Item(item.clone()));
        }
        self.buffer.retain(item);

        seq
    }

    /// Handle one message from upstream.
    ///
    /// Watermarks are passed to every active replica in line with the
    /// data but are not retained; there's nothing to acknowledge.
    pub fn on_message(&mut self, msg: Message<P>, out: &mut impl Fanout<P>) -> Option<SeqNum> {
        match msg {
            Message::Data { timestamp, payload } => Some(self.ingest(timestamp, payload, out)),
            Message::Watermark(timestamp) => {
                for replica in self.buffer.replicas().iter() {
                    out.deliver(*replica, Delivery::Watermark(timestamp));
                }
                None
            }
        }
    }

    /// Apply an acknowledgment.
    ///
    /// Unexpected acknowledgments are logged and handed back; they
    /// never stop the ingress.
    pub fn acknowledge(&mut self, ack: Ack) -> Result<AckOutcome, UnexpectedAck> {
        let Ack { seq, replica } = ack;
        let res = self.buffer.acknowledge(seq, replica);
        match &res {
            Ok(AckOutcome::AlreadyReclaimed) => {
                tracing::debug!("Ignoring duplicate ack from replica {replica} for {seq}");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!("Ignoring ack: {err}");
            }
        }
        res
    }

    /// Stop waiting on a replica and stop delivering to it.
    pub fn replica_failed(
        &mut self,
        replica: ReplicaId,
        out: &mut impl Fanout<P>,
    ) -> Result<FailureOutcome, ProtocolViolation> {
        let outcome = self.buffer.replica_failed(replica).map_err(fatal)?;
        if outcome.removed {
            out.retire(replica);
            tracing::info!(
                "Replica {replica} failed; reclaimed {} entries, {} replicas remain",
                outcome.reclaimed.len(),
                self.buffer.replicas().len()
            );
        } else {
            tracing::warn!("Ignoring failure of replica {replica}: not an active replica");
        }
        Ok(outcome)
    }

    /// Handle a command from the controller.
    pub fn on_control(
        &mut self,
        cmd: ControlCommand,
        out: &mut impl Fanout<P>,
    ) -> Result<(), ProtocolViolation> {
        match cmd {
            ControlCommand::ReplicaFailed(replica) => {
                self.replica_failed(replica, out)?;
            }
            ControlCommand::Rollback(id) => {
                tracing::warn!("Ignoring rollback to {id:?}; the ingress has no checkpoints");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
type Outputs = BTreeMap<ReplicaId, Vec<Delivery<u64>>>;

#[cfg(test)]
fn delivered_seqs(out: &Outputs, replica: usize) -> Vec<u64> {
    out.get(&ReplicaId(replica))
        .into_iter()
        .flatten()
        .filter_map(|delivery| match delivery {
            Delivery::Item(item) => Some(item.seq().0),
            Delivery::Watermark(..) => None,
        })
        .collect()
}

#[test]
fn sequence_numbers_start_at_zero_without_gaps() {
    let mut ingress = Ingress::new(ReplicaSet::with_count(2).unwrap());
    let mut out = Outputs::new();

    let seqs: Vec<_> = (0..10u64)
        .map(|x| ingress.ingest(Timestamp(x), x * 100, &mut out).0)
        .collect();
    assert_eq!(seqs, (0..10).collect::<Vec<_>>());
    assert_eq!(ingress.next_seq(), SeqNum(10));
}

#[test]
fn every_replica_sees_ingestion_order() {
    let mut ingress = Ingress::new(ReplicaSet::with_count(3).unwrap());
    let mut out = Outputs::new();

    for x in 0..5u64 {
        ingress.on_message(
            Message::Data {
                timestamp: Timestamp(x),
                payload: x,
            },
            &mut out,
        );
    }
    for replica in 0..3 {
        assert_eq!(delivered_seqs(&out, replica), vec![0, 1, 2, 3, 4]);
    }
    assert_eq!(ingress.buffer().len(), 5);
}

#[test]
fn watermarks_are_forwarded_not_retained() {
    let mut ingress = Ingress::new(ReplicaSet::with_count(2).unwrap());
    let mut out = Outputs::new();

    let seq = ingress.on_message(
        Message::Data {
            timestamp: Timestamp(1),
            payload: 7,
        },
        &mut out,
    );
    let none = ingress.on_message(Message::Watermark(Timestamp(1)), &mut out);
    assert_eq!(seq, Some(SeqNum(0)));
    assert_eq!(none, None);
    assert_eq!(ingress.buffer().len(), 1);

    let replica_0 = &out[&ReplicaId(0)];
    assert_eq!(replica_0.len(), 2);
    assert!(matches!(replica_0[0], Delivery::Item(..)));
    assert_eq!(replica_0[1], Delivery::Watermark(Timestamp(1)));
}

#[test]
fn failed_replica_gets_nothing_more() {
    let mut ingress = Ingress::new(ReplicaSet::with_count(2).unwrap());
    let mut out = Outputs::new();

    ingress.ingest(Timestamp(0), 0, &mut out);
    ingress
        .on_control(ControlCommand::ReplicaFailed(ReplicaId(0)), &mut out)
        .unwrap();
    ingress.ingest(Timestamp(1), 1, &mut out);

    assert_eq!(delivered_seqs(&out, 0), vec![0]);
    assert_eq!(delivered_seqs(&out, 1), vec![0, 1]);
    assert_eq!(ingress.status().replicas, vec![ReplicaId(1)]);
    assert_eq!(ingress.status().replica_epoch, 1);

    // Late acks from replica 0 are ignored and change nothing.
    assert_eq!(
        ingress.acknowledge(Ack::new(SeqNum(0), ReplicaId(0))),
        Err(UnexpectedAck::NotPending {
            seq: SeqNum(0),
            replica: ReplicaId(0)
        })
    );
    assert_eq!(
        ingress.acknowledge(Ack::new(SeqNum(1), ReplicaId(0))),
        Err(UnexpectedAck::NotPending {
            seq: SeqNum(1),
            replica: ReplicaId(0)
        })
    );
    assert_eq!(ingress.buffer().len(), 2);
    assert_eq!(
        ingress.acknowledge(Ack::new(SeqNum(0), ReplicaId(1))),
        Ok(AckOutcome::Reclaimed)
    );
    assert_eq!(
        ingress.acknowledge(Ack::new(SeqNum(0), ReplicaId(0))),
        Ok(AckOutcome::AlreadyReclaimed)
    );
}

#[test]
fn emptying_replicas_is_fatal() {
    let mut ingress = Ingress::<u64>::new(ReplicaSet::with_count(2).unwrap());
    let mut out = Outputs::new();

    ingress
        .on_control(ControlCommand::ReplicaFailed(ReplicaId(0)), &mut out)
        .unwrap();
    assert_eq!(ingress.buffer().replicas().len(), 1);
    assert_eq!(
        ingress.on_control(ControlCommand::ReplicaFailed(ReplicaId(1)), &mut out),
        Err(ProtocolViolation::EmptyReplicaSet {
            replica: ReplicaId(1)
        })
    );
}

#[test]
fn unknown_replica_failure_is_ignored() {
    let mut ingress = Ingress::<u64>::new(ReplicaSet::with_count(2).unwrap());
    let mut out = Outputs::new();

    let outcome = ingress.replica_failed(ReplicaId(9), &mut out).unwrap();
    assert!(!outcome.removed);
    assert_eq!(ingress.buffer().replicas().len(), 2);
}

#[test]
fn rollback_is_ignored_by_ingress() {
    let mut ingress = Ingress::<u64>::new(ReplicaSet::with_count(1).unwrap());
    let mut out = Outputs::new();

    ingress.ingest(Timestamp(0), 0, &mut out);
    ingress
        .on_control(ControlCommand::Rollback(None), &mut out)
        .unwrap();
    assert_eq!(ingress.next_seq(), SeqNum(1));
    assert_eq!(ingress.buffer().len(), 1);
}
