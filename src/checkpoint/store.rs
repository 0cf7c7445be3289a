use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

use crate::errors::ProtocolViolation;
use crate::model::SeqNum;

use super::Window;

/// Frozen copy of a source's window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint<T> {
    key: SeqNum,
    window: Window<T>,
    taken_at: DateTime<Utc>,
}

impl<T> Checkpoint<T> {
    pub fn key(&self) -> SeqNum {
        self.key
    }

    pub fn window(&self) -> &Window<T> {
        &self.window
    }

    /// Wall clock time this was taken. Informational only.
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

/// In-memory checkpoints keyed by sequence number.
///
/// Append-only, except that a rollback drops everything after the
/// rollback point, and an optional retention limit drops the oldest.
/// Nothing here survives a restart.
#[derive(Debug)]
pub struct CheckpointStore<T> {
    checkpoints: BTreeMap<SeqNum, Checkpoint<T>>,
    max_retained: Option<usize>,
}

impl<T> CheckpointStore<T> {
    /// A store that keeps every checkpoint until a rollback prunes
    /// it.
    pub fn new() -> Self {
        Self {
            checkpoints: BTreeMap::new(),
            max_retained: None,
        }
    }

    /// A store that only keeps the newest `max_retained` checkpoints.
    pub fn with_retention(max_retained: usize) -> Self {
        assert!(max_retained > 0, "retention must keep at least 1 checkpoint");
        Self {
            checkpoints: BTreeMap::new(),
            max_retained: Some(max_retained),
        }
    }

    /// Save a window under a key.
    ///
    /// A key is used at most once.
    pub fn insert(&mut self, key: SeqNum, window: Window<T>) -> Result<(), ProtocolViolation> {
        if self.checkpoints.contains_key(&key) {
            return Err(ProtocolViolation::CheckpointCollision { key });
        }
        let checkpoint = Checkpoint {
            key,
            window,
            taken_at: Utc::now(),
        };
        self.checkpoints.insert(key, checkpoint);

        if let Some(max_retained) = self.max_retained {
            while self.checkpoints.len() > max_retained {
                if let Some((evicted, _checkpoint)) = self.checkpoints.pop_first() {
                    tracing::debug!("Evicted checkpoint {evicted} past retention");
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &SeqNum) -> Option<&Checkpoint<T>> {
        self.checkpoints.get(key)
    }

    pub fn contains(&self, key: &SeqNum) -> bool {
        self.checkpoints.contains_key(key)
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = SeqNum> + '_ {
        self.checkpoints.keys().copied()
    }

    pub fn latest(&self) -> Option<&Checkpoint<T>> {
        self.checkpoints.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Drop every checkpoint with a key greater than `key`. Returns
    /// how many were dropped.
    pub fn truncate_after(&mut self, key: SeqNum) -> usize {
        let later = self.checkpoints.split_off(&key.next());
        later.len()
    }

    pub fn clear(&mut self) {
        self.checkpoints.clear();
    }
}

impl<T> Default for CheckpointStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
fn window_of(items: &[u64]) -> Window<u64> {
    let mut window = Window::new(items.len().max(1));
    for item in items {
        window.push(*item);
    }
    window
}

#[test]
fn insert_rejects_used_key() {
    let mut store = CheckpointStore::new();
    store.insert(SeqNum(2), window_of(&[1, 2])).unwrap();
    assert_eq!(
        store.insert(SeqNum(2), window_of(&[2])),
        Err(ProtocolViolation::CheckpointCollision { key: SeqNum(2) })
    );
    // The original is untouched.
    assert_eq!(store.get(&SeqNum(2)).unwrap().window().to_vec(), vec![1, 2]);
}

#[test]
fn truncate_after_drops_later_keys() {
    let mut store = CheckpointStore::new();
    for key in [2, 4, 6, 8] {
        store.insert(SeqNum(key), window_of(&[key])).unwrap();
    }
    assert_eq!(store.truncate_after(SeqNum(4)), 2);
    assert_eq!(store.keys().collect::<Vec<_>>(), vec![SeqNum(2), SeqNum(4)]);

    // Truncating between keys works too.
    assert_eq!(store.truncate_after(SeqNum(3)), 1);
    assert_eq!(store.keys().collect::<Vec<_>>(), vec![SeqNum(2)]);
    assert_eq!(store.latest().unwrap().key(), SeqNum(2));
}

#[test]
fn retention_evicts_oldest() {
    let mut store = CheckpointStore::with_retention(2);
    for key in [2, 4, 6] {
        store.insert(SeqNum(key), window_of(&[key])).unwrap();
    }
    assert_eq!(store.keys().collect::<Vec<_>>(), vec![SeqNum(4), SeqNum(6)]);
    assert!(!store.contains(&SeqNum(2)));
}
