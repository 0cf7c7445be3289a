use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::errors::ProtocolViolation;
use crate::errors::UnexpectedAck;
use crate::model::Item;
use crate::model::ReplicaId;
use crate::model::SeqNum;

use super::ReplicaSet;

/// An item that at least one replica still owes an acknowledgment
/// for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferEntry<P> {
    item: Item<P>,
    pending: BTreeSet<ReplicaId>,
}

impl<P> BufferEntry<P> {
    pub fn item(&self) -> &Item<P> {
        &self.item
    }

    /// Replicas that haven't acknowledged yet. Never empty.
    pub fn pending(&self) -> &BTreeSet<ReplicaId> {
        &self.pending
    }

    pub fn is_pending_on(&self, replica: &ReplicaId) -> bool {
        self.pending.contains(replica)
    }
}

/// Result of applying an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Other replicas still owe an acknowledgment.
    Pending { remaining: usize },
    /// That was the last one; the entry is gone.
    Reclaimed,
    /// The entry was reclaimed earlier. Late duplicates land here.
    AlreadyReclaimed,
}

/// Result of removing a failed replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    /// `false` if the replica had already been removed or was never
    /// a member.
    pub removed: bool,
    /// Entries whose only remaining debt was on the failed replica,
    /// in sequence order.
    pub reclaimed: Vec<SeqNum>,
}

/// Holds every item that hasn't been acknowledged by all active
/// replicas.
///
/// Entries are keyed by sequence number and exist exactly while
/// their pending set is non-empty. Acknowledgments from different
/// replicas are independent, so they can arrive in any interleaving.
///
/// There is no bound on the number of entries. A replica that never
/// acknowledges and is never marked failed pins its items here
/// forever.
#[derive(Debug)]
pub struct ReplicationBuffer<P> {
    replicas: ReplicaSet,
    entries: BTreeMap<SeqNum, BufferEntry<P>>,
    /// One past the largest sequence number ever retained. Anything
    /// below this without an entry has been reclaimed.
    horizon: SeqNum,
}

impl<P> ReplicationBuffer<P> {
    pub fn new(replicas: ReplicaSet) -> Self {
        Self {
            replicas,
            entries: BTreeMap::new(),
            horizon: SeqNum(0),
        }
    }

    pub fn replicas(&self) -> &ReplicaSet {
        &self.replicas
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, seq: &SeqNum) -> Option<&BufferEntry<P>> {
        self.entries.get(seq)
    }

    /// Items a replica still has to acknowledge, in sequence order.
    ///
    /// This is what you'd re-send to the replica if its channel had
    /// to be re-established.
    pub fn unacked<'a>(&'a self, replica: &'a ReplicaId) -> impl Iterator<Item = &'a Item<P>> + 'a {
        self.entries
            .values()
            .filter(move |entry| entry.is_pending_on(replica))
            .map(|entry| &entry.item)
    }

    /// Start tracking acknowledgments for an item from every active
    /// replica.
    ///
    /// Sequence numbers must be handed in strictly increasing order.
    pub(crate) fn retain(&mut self, item: Item<P>) {
        let seq = item.seq();
        assert!(
            seq >= self.horizon,
            "sequence number {seq} retained out of order; horizon is {}",
            self.horizon
        );
        let pending = self.replicas.members().clone();
        self.entries.insert(seq, BufferEntry { item, pending });
        self.horizon = seq.next();
    }

    /// Apply one replica's acknowledgment.
    pub fn acknowledge(
        &mut self,
        seq: SeqNum,
        replica: ReplicaId,
    ) -> Result<AckOutcome, UnexpectedAck> {
        let entry = match self.entries.get_mut(&seq) {
            Some(entry) => entry,
            None if seq < self.horizon => return Ok(AckOutcome::AlreadyReclaimed),
            None => return Err(UnexpectedAck::UnknownSequence { seq, replica }),
        };
        if !entry.pending.remove(&replica) {
            return Err(UnexpectedAck::NotPending { seq, replica });
        }

        if entry.pending.is_empty() {
            self.entries.remove(&seq);
            tracing::trace!("Reclaimed entry {seq}");
            Ok(AckOutcome::Reclaimed)
        } else {
            Ok(AckOutcome::Pending {
                remaining: entry.pending.len(),
            })
        }
    }

    /// Acknowledge everything on behalf of a failed replica and stop
    /// expecting anything from it.
    ///
    /// Fails, changing nothing, if it is the last active replica.
    pub fn replica_failed(&mut self, replica: ReplicaId) -> Result<FailureOutcome, ProtocolViolation> {
        if !self.replicas.remove(&replica)? {
            return Ok(FailureOutcome {
                removed: false,
                reclaimed: Vec::new(),
            });
        }

        let mut reclaimed = Vec::new();
        for (seq, entry) in self.entries.iter_mut() {
            if entry.pending.remove(&replica) && entry.pending.is_empty() {
                reclaimed.push(*seq);
            }
        }
        for seq in reclaimed.iter() {
            self.entries.remove(seq);
        }

        Ok(FailureOutcome {
            removed: true,
            reclaimed,
        })
    }
}

#[cfg(test)]
fn item(seq: u64) -> Item<&'static str> {
    use crate::model::Timestamp;

    Item::new(SeqNum(seq), Timestamp(seq), "x")
}

#[test]
fn two_replica_ack_flow() {
    let mut buffer = ReplicationBuffer::new(ReplicaSet::with_count(2).unwrap());
    buffer.retain(item(0));
    assert_eq!(
        buffer.get(&SeqNum(0)).unwrap().pending(),
        &BTreeSet::from([ReplicaId(0), ReplicaId(1)])
    );

    assert_eq!(
        buffer.acknowledge(SeqNum(0), ReplicaId(0)),
        Ok(AckOutcome::Pending { remaining: 1 })
    );
    assert_eq!(
        buffer.get(&SeqNum(0)).unwrap().pending(),
        &BTreeSet::from([ReplicaId(1)])
    );

    assert_eq!(
        buffer.acknowledge(SeqNum(0), ReplicaId(1)),
        Ok(AckOutcome::Reclaimed)
    );
    assert!(buffer.is_empty());
}

#[test]
fn late_duplicate_ack_is_ignored() {
    let mut buffer = ReplicationBuffer::new(ReplicaSet::with_count(1).unwrap());
    buffer.retain(item(0));
    assert_eq!(
        buffer.acknowledge(SeqNum(0), ReplicaId(0)),
        Ok(AckOutcome::Reclaimed)
    );
    assert_eq!(
        buffer.acknowledge(SeqNum(0), ReplicaId(0)),
        Ok(AckOutcome::AlreadyReclaimed)
    );
}

#[test]
fn unexpected_acks_leave_other_entries_alone() {
    let mut buffer = ReplicationBuffer::new(ReplicaSet::with_count(2).unwrap());
    buffer.retain(item(0));
    buffer.retain(item(1));

    assert_eq!(
        buffer.acknowledge(SeqNum(7), ReplicaId(0)),
        Err(UnexpectedAck::UnknownSequence {
            seq: SeqNum(7),
            replica: ReplicaId(0)
        })
    );
    assert_eq!(
        buffer.acknowledge(SeqNum(0), ReplicaId(5)),
        Err(UnexpectedAck::NotPending {
            seq: SeqNum(0),
            replica: ReplicaId(5)
        })
    );
    buffer.acknowledge(SeqNum(0), ReplicaId(0)).unwrap();
    assert_eq!(
        buffer.acknowledge(SeqNum(0), ReplicaId(0)),
        Err(UnexpectedAck::NotPending {
            seq: SeqNum(0),
            replica: ReplicaId(0)
        })
    );

    assert_eq!(buffer.len(), 2);
    assert_eq!(buffer.get(&SeqNum(1)).unwrap().pending().len(), 2);
}

#[test]
fn replica_failed_forces_acks() {
    let mut buffer = ReplicationBuffer::new(ReplicaSet::with_count(2).unwrap());
    buffer.retain(item(0));
    buffer.retain(item(1));
    buffer.retain(item(2));
    // Replica 1 is done with 1, so only replica 0 holds it.
    buffer.acknowledge(SeqNum(1), ReplicaId(1)).unwrap();
    // Replica 0 is done with 2, so only replica 1 holds it.
    buffer.acknowledge(SeqNum(2), ReplicaId(0)).unwrap();

    let outcome = buffer.replica_failed(ReplicaId(0)).unwrap();
    assert_eq!(
        outcome,
        FailureOutcome {
            removed: true,
            reclaimed: vec![SeqNum(1)],
        }
    );
    assert_eq!(buffer.len(), 2);
    assert_eq!(buffer.replicas().len(), 1);
    assert_eq!(buffer.replicas().epoch(), 1);

    // A failed replica is never pending anywhere, so this can't
    // abort.
    assert!(matches!(
        buffer.acknowledge(SeqNum(0), ReplicaId(0)),
        Err(UnexpectedAck::NotPending { .. })
    ));
    assert_eq!(
        buffer.acknowledge(SeqNum(1), ReplicaId(0)),
        Ok(AckOutcome::AlreadyReclaimed)
    );

    // New items only wait on the survivors.
    buffer.retain(item(3));
    assert_eq!(
        buffer.get(&SeqNum(3)).unwrap().pending(),
        &BTreeSet::from([ReplicaId(1)])
    );
}

#[test]
fn last_replica_failure_is_fatal() {
    let mut buffer = ReplicationBuffer::new(ReplicaSet::with_count(2).unwrap());
    buffer.retain(item(0));
    buffer.replica_failed(ReplicaId(0)).unwrap();
    assert_eq!(buffer.replicas().len(), 1);

    assert_eq!(
        buffer.replica_failed(ReplicaId(1)),
        Err(ProtocolViolation::EmptyReplicaSet {
            replica: ReplicaId(1)
        })
    );
    // Nothing was touched.
    assert_eq!(buffer.replicas().len(), 1);
    assert!(buffer.get(&SeqNum(0)).unwrap().is_pending_on(&ReplicaId(1)));
}

#[test]
fn unacked_lists_replica_debt_in_order() {
    let mut buffer = ReplicationBuffer::new(ReplicaSet::with_count(2).unwrap());
    for seq in 0..4 {
        buffer.retain(item(seq));
    }
    buffer.acknowledge(SeqNum(1), ReplicaId(1)).unwrap();
    buffer.acknowledge(SeqNum(3), ReplicaId(1)).unwrap();

    let owed: Vec<_> = buffer
        .unacked(&ReplicaId(1))
        .map(|item| item.seq())
        .collect();
    assert_eq!(owed, vec![SeqNum(0), SeqNum(2)]);
}

#[test]
fn interleaved_acks_all_reclaim() {
    let replicas = 3;
    let items = 50;
    let mut buffer = ReplicationBuffer::new(ReplicaSet::with_count(replicas).unwrap());
    for seq in 0..items {
        buffer.retain(item(seq));
    }

    let mut acks: Vec<_> = (0..items)
        .flat_map(|seq| (0..replicas).map(move |r| (SeqNum(seq), ReplicaId(r))))
        .collect();
    fastrand::shuffle(&mut acks);

    let mut reclaimed = 0;
    for (seq, replica) in acks {
        if buffer.acknowledge(seq, replica).unwrap() == AckOutcome::Reclaimed {
            reclaimed += 1;
        }
    }
    assert_eq!(reclaimed, items);
    assert!(buffer.is_empty());
}

#[test]
#[should_panic(expected = "retained out of order")]
fn retaining_out_of_order_panics() {
    let mut buffer = ReplicationBuffer::new(ReplicaSet::with_count(1).unwrap());
    buffer.retain(item(1));
    buffer.retain(item(0));
}
