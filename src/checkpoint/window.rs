use std::collections::VecDeque;

use serde::Serialize;

/// The most recent `capacity` state items, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Window<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> Window<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be at least 1");
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Append an item, dropping and returning the oldest one if the
    /// window was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> Window<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[test]
fn push_evicts_oldest() {
    let mut window = Window::new(3);
    assert_eq!(window.push(1), None);
    assert_eq!(window.push(2), None);
    assert_eq!(window.push(3), None);
    assert_eq!(window.push(4), Some(1));
    assert_eq!(window.to_vec(), vec![2, 3, 4]);
    assert_eq!(window.latest(), Some(&4));
    assert_eq!(window.len(), 3);
}
