use std::collections::BTreeMap;

use crate::protocol::Ordinal;

/// An ordered map keyed by wraparound ordinals.
///
/// Ordinals have no total order, so entries are stored under an unwrapped
/// position relative to the first live key. This is only sound while every
/// live key lies within [`Ordinal::WINDOW_SIZE`] of every other one; the
/// inbound channel guarantees it by discarding everything below its
/// acknowledgement window.
#[derive(Debug)]
pub struct OrdinalTree<T> {
    entries: BTreeMap<i64, (Ordinal, T)>,
}

impl<T> Default for OrdinalTree<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> OrdinalTree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: Ordinal) -> i64 {
        match self.entries.first_key_value() {
            Some((position, (anchor, _))) => *position + key.distance(*anchor) as i64,
            None => key.0 as i64,
        }
    }

    pub fn contains(&self, key: Ordinal) -> bool {
        self.entries.contains_key(&self.position(key))
    }

    pub fn get(&self, key: Ordinal) -> Option<&T> {
        self.entries.get(&self.position(key)).map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, key: Ordinal) -> Option<&mut T> {
        let position = self.position(key);
        self.entries.get_mut(&position).map(|(_, value)| value)
    }

    /// Fetches the entry under `key`, inserting the value produced by `f`
    /// when there is none. The flag tells whether an insertion took place.
    pub fn get_or_insert_with(&mut self, key: Ordinal, f: impl FnOnce() -> T) -> (&mut T, bool) {
        let position = self.position(key);
        let mut inserted = false;
        let (_, value) = self.entries.entry(position).or_insert_with(|| {
            inserted = true;
            (key, f())
        });
        (value, inserted)
    }

    pub fn remove(&mut self, key: Ordinal) -> Option<T> {
        let position = self.position(key);
        self.entries.remove(&position).map(|(_, value)| value)
    }

    /// Drops every entry whose key is below `key`. Returns how many were
    /// dropped.
    pub fn remove_below(&mut self, key: Ordinal) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        let position = self.position(key);
        let kept = self.entries.split_off(&position);
        let dropped = std::mem::replace(&mut self.entries, kept);
        dropped.len()
    }

    pub fn first(&self) -> Option<(Ordinal, &T)> {
        self.entries
            .first_key_value()
            .map(|(_, (key, value))| (*key, value))
    }

    pub fn pop_first(&mut self) -> Option<(Ordinal, T)> {
        self.entries.pop_first().map(|(_, entry)| entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Ordinal, &T)> {
        self.entries.values().map(|(key, value)| (*key, value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Ordinal, &mut T)> {
        self.entries.values_mut().map(|(key, value)| (*key, value))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_across_the_wrap() {
        let mut tree = OrdinalTree::new();
        for key in [3u16, 65534, 1, 65535, 0] {
            tree.get_or_insert_with(Ordinal(key), || key);
        }
        let keys: Vec<u16> = tree.iter().map(|(key, _)| key.0).collect();
        assert_eq!(keys, vec![65534, 65535, 0, 1, 3]);
        assert_eq!(tree.first().map(|(key, _)| key), Some(Ordinal(65534)));
    }

    #[test]
    fn insert_or_fetch() {
        let mut tree = OrdinalTree::new();
        let (value, inserted) = tree.get_or_insert_with(Ordinal(9), || 1);
        assert!(inserted);
        *value += 1;
        let (value, inserted) = tree.get_or_insert_with(Ordinal(9), || 100);
        assert!(!inserted);
        assert_eq!(*value, 2);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn removes_everything_below() {
        let mut tree = OrdinalTree::new();
        for key in [65530u16, 65533, 2, 5, 8] {
            tree.get_or_insert_with(Ordinal(key), || ());
        }
        assert_eq!(tree.remove_below(Ordinal(5)), 3);
        let keys: Vec<u16> = tree.iter().map(|(key, _)| key.0).collect();
        assert_eq!(keys, vec![5, 8]);
        assert_eq!(tree.remove_below(Ordinal(4)), 0);
        assert!(tree.contains(Ordinal(8)));
        assert!(!tree.contains(Ordinal(2)));
    }

    #[test]
    fn the_anchor_moves_with_the_first_key() {
        let mut tree = OrdinalTree::new();
        tree.get_or_insert_with(Ordinal(0), || 0u32);
        // slide the live range forward well past the first half of the space
        for step in 1..=6u32 {
            let key = Ordinal((step * 10_000) as u16);
            tree.get_or_insert_with(key, || step);
            tree.remove_below(key);
            assert_eq!(tree.len(), 1);
            assert_eq!(tree.get(key), Some(&step));
        }
        // 60000 is followed by 4464 after wrapping
        tree.get_or_insert_with(Ordinal(4464), || 7);
        let keys: Vec<u16> = tree.iter().map(|(key, _)| key.0).collect();
        assert_eq!(keys, vec![60000, 4464]);
    }
}
