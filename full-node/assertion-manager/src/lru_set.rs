use std::hash::Hash;

use parking_lot::Mutex;
use schnellru::{ByLength, LruMap};

/// A thread-safe set that evicts its least recently inserted items once full.
pub struct LruSet<T: Hash + Eq> {
    items: Mutex<LruMap<T, ()>>,
}

impl<T: Hash + Eq + Clone> LruSet<T> {
    /// Creates a set holding at most `capacity` items.
    pub fn new(capacity: u32) -> Self {
        Self {
            items: Mutex::new(LruMap::new(ByLength::new(capacity))),
        }
    }

    /// Inserts `item`. Returns false if it was already present.
    pub fn insert(&self, item: T) -> bool {
        let mut items = self.items.lock();
        if items.peek(&item).is_some() {
            return false;
        }
        items.insert(item, ());
        true
    }

    /// Returns true if `item` is present.
    pub fn contains(&self, item: &T) -> bool {
        self.items.lock().peek(item).is_some()
    }

    /// Removes `item`. Returns true if it was present.
    pub fn remove(&self, item: &T) -> bool {
        self.items.lock().remove(item).is_some()
    }

    /// Every item, most recently inserted first.
    pub fn items(&self) -> Vec<T> {
        self.items.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
