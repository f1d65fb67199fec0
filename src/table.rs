//! Integer- and string-keyed tables used by descriptors, dispatch tables,
//! and maps.
//!
//! The integer table keeps a dense array part for small keys and spills
//! large keys to a hash map; lookups on the array part are a bounds check
//! and an index. The string table additionally records insertion order so
//! iteration is stable across reads between mutations.

use std::collections::HashMap;

/// Keys smaller than this live in the array part.
const ARRAY_PART_MAX: u64 = 256;

#[derive(Debug, Clone)]
pub(crate) struct IntTable<V> {
    array: Vec<Option<V>>,
    hash: HashMap<u64, V>,
}

impl<V> Default for IntTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IntTable<V> {
    pub fn new() -> Self {
        Self {
            array: Vec::new(),
            hash: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: u64, value: V) -> Option<V> {
        if key < ARRAY_PART_MAX {
            let idx = key as usize;
            if idx >= self.array.len() {
                self.array.resize_with(idx + 1, || None);
            }
            self.array[idx].replace(value)
        } else {
            self.hash.insert(key, value)
        }
    }

    pub fn get(&self, key: u64) -> Option<&V> {
        if key < ARRAY_PART_MAX {
            self.array.get(key as usize).and_then(|slot| slot.as_ref())
        } else {
            self.hash.get(&key)
        }
    }

    pub fn remove(&mut self, key: u64) -> Option<V> {
        if key < ARRAY_PART_MAX {
            self.array.get_mut(key as usize).and_then(|slot| slot.take())
        } else {
            self.hash.remove(&key)
        }
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.array.iter().filter(|slot| slot.is_some()).count() + self.hash.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &V)> {
        self.array
            .iter()
            .enumerate()
            .filter_map(|(k, slot)| slot.as_ref().map(|v| (k as u64, v)))
            .chain(self.hash.iter().map(|(&k, v)| (k, v)))
    }
}

/// A string-keyed table with stable, insertion-ordered iteration.
#[derive(Debug, Clone, Default)]
pub(crate) struct StrTable<V> {
    map: HashMap<Vec<u8>, usize>,
    entries: Vec<(Vec<u8>, V)>,
}

impl<V> StrTable<V> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// Inserts or replaces; returns the previous value if one existed.
    pub fn insert(&mut self, key: &[u8], value: V) -> Option<V> {
        match self.map.get(key) {
            Some(&idx) => {
                let old = std::mem::replace(&mut self.entries[idx].1, value);
                Some(old)
            }
            None => {
                self.map.insert(key.to_vec(), self.entries.len());
                self.entries.push((key.to_vec(), value));
                None
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.map.get(key).map(|&idx| &self.entries[idx].1)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        match self.map.get(key) {
            Some(&idx) => Some(&mut self.entries[idx].1),
            None => None,
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    /// Removes a key. O(n) in the number of later insertions, which is fine
    /// for the small tables this crate keeps.
    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let idx = self.map.remove(key)?;
        let (_, v) = self.entries.remove(idx);
        for slot in self.map.values_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }
        Some(v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &V)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }
}
