use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::IngressConfig;
use crate::errors::ConfigError;
use crate::errors::ProtocolViolation;
use crate::model::ReplicaId;

/// The replicas an item still has to reach.
///
/// Only ever shrinks, and never becomes empty. Every removal bumps
/// [`ReplicaSet::epoch`] so you can tell how many failures the set
/// has absorbed without replaying history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaSet {
    members: BTreeSet<ReplicaId>,
    capacity: usize,
    epoch: u64,
}

impl ReplicaSet {
    pub fn new(members: impl IntoIterator<Item = ReplicaId>) -> Result<Self, ConfigError> {
        let members: BTreeSet<_> = members.into_iter().collect();
        if members.is_empty() {
            return Err(ConfigError::NoReplicas);
        }
        let capacity = members.len();
        Ok(Self {
            members,
            capacity,
            epoch: 0,
        })
    }

    /// Replicas `0..count`.
    pub fn with_count(count: usize) -> Result<Self, ConfigError> {
        Self::new((0..count).map(ReplicaId))
    }

    /// Replicas `0..config.replicas`.
    pub fn from_config(config: &IngressConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Self::with_count(config.replicas)
    }

    pub fn contains(&self, replica: &ReplicaId) -> bool {
        self.members.contains(replica)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always `false`; here for symmetry with [`ReplicaSet::len`].
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Size the set started with. [`ReplicaSet::len`] never exceeds
    /// this.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of replicas removed so far.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Iterate in replica order.
    pub fn iter(&self) -> impl Iterator<Item = &ReplicaId> + '_ {
        self.members.iter()
    }

    pub(crate) fn members(&self) -> &BTreeSet<ReplicaId> {
        &self.members
    }

    /// Remove a replica.
    ///
    /// Returns `Ok(false)` if it wasn't a member. The set is left
    /// untouched if this would have emptied it.
    pub(crate) fn remove(&mut self, replica: &ReplicaId) -> Result<bool, ProtocolViolation> {
        if !self.members.contains(replica) {
            return Ok(false);
        }
        if self.members.len() == 1 {
            return Err(ProtocolViolation::EmptyReplicaSet { replica: *replica });
        }
        self.members.remove(replica);
        self.epoch += 1;
        assert!(self.members.len() + self.epoch as usize == self.capacity);
        Ok(true)
    }
}

#[test]
fn empty_set_is_rejected() {
    assert!(matches!(
        ReplicaSet::new(Vec::new()),
        Err(ConfigError::NoReplicas)
    ));
    assert!(matches!(
        ReplicaSet::with_count(0),
        Err(ConfigError::NoReplicas)
    ));
}

#[test]
fn remove_bumps_epoch() {
    let mut set = ReplicaSet::with_count(3).unwrap();
    assert_eq!(set.remove(&ReplicaId(1)), Ok(true));
    assert_eq!(set.epoch(), 1);
    assert_eq!(set.len(), 2);
    assert_eq!(set.capacity(), 3);

    // Already gone.
    assert_eq!(set.remove(&ReplicaId(1)), Ok(false));
    assert_eq!(set.epoch(), 1);
}

#[test]
fn remove_last_is_rejected() {
    let mut set = ReplicaSet::with_count(2).unwrap();
    assert_eq!(set.remove(&ReplicaId(0)), Ok(true));
    assert_eq!(
        set.remove(&ReplicaId(1)),
        Err(ProtocolViolation::EmptyReplicaSet {
            replica: ReplicaId(1)
        })
    );
    assert!(set.contains(&ReplicaId(1)));
    assert_eq!(set.epoch(), 1);
}

#[test]
fn from_config_numbers_replicas() {
    let set = ReplicaSet::from_config(&IngressConfig { replicas: 3 }).unwrap();
    assert_eq!(set.len(), 3);
    assert_eq!(set.capacity(), 3);
    assert!(set.contains(&ReplicaId(2)));
    assert!(!set.contains(&ReplicaId(3)));

    assert!(matches!(
        ReplicaSet::from_config(&IngressConfig { replicas: 0 }),
        Err(ConfigError::NoReplicas)
    ));
}
