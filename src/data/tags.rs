//! String interning for tag keys and values.
//!
//! Keys live in one table, every key owns a private table of values. A
//! [`TagIndex`] is the pair of positions. Value position 0 is reserved for
//! "any value", so stored values are numbered from 1.

use std::collections::HashMap;

/// Largest number of keys (or values of one key). The top two positions of
/// the 32 bit space are reserved sentinels.
pub const MAX_IDS: u32 = u32::MAX - 1;

/// Keys with more distinct values than this get a hash lookup instead of a
/// linear scan.
const HASHED_VALUES_THRESHOLD: usize = 5;

const INITIAL_KEY_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Interned (key, value) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagIndex {
    pub key: KeyId,
    pub value: ValueId,
}

impl TagIndex {
    pub fn new(key: KeyId, value: ValueId) -> Self {
        assert!(key.0 < MAX_IDS && value.0 < MAX_IDS, "tag index out of range");
        TagIndex { key, value }
    }

    /// Index matching any value of `key`.
    pub fn any_value(key: KeyId) -> Self {
        TagIndex::new(key, ValueId(0))
    }

    pub fn is_any_value(&self) -> bool {
        self.value.0 == 0
    }

    /// Query match: the keys agree and either side accepts any value or the
    /// values agree.
    pub fn matches(&self, other: &TagIndex) -> bool {
        self.key == other.key
            && (self.value.0 == 0 || other.value.0 == 0 || self.value == other.value)
    }
}

#[derive(Debug, Default)]
struct ValueTable {
    values: Vec<String>,
    lookup: Option<HashMap<String, u32>>,
}

impl ValueTable {
    fn find(&self, value: &str) -> Option<u32> {
        match &self.lookup {
            Some(lookup) => lookup.get(value).copied(),
            None => self.values.iter()
                .position(|v| v == value)
                .map(|pos| pos as u32),
        }
    }

    fn add(&mut self, value: &str) -> u32 {
        assert!((self.values.len() as u64) < MAX_IDS as u64, "tag value table exhausted");
        if self.values.len() == self.values.capacity() {
            self.values.reserve(self.values.len().max(1));
        }
        let pos = self.values.len() as u32;
        self.values.push(value.to_string());

        if self.values.len() > HASHED_VALUES_THRESHOLD {
            let lookup = self.lookup.get_or_insert_with(|| {
                self.values.iter()
                    .enumerate()
                    .map(|(i, v)| (v.clone(), i as u32))
                    .collect()
            });
            lookup.insert(value.to_string(), pos);
        }
        pos
    }
}

/// Interner owned by a graph store; ids are stable for its whole lifetime.
#[derive(Debug)]
pub struct TagStore {
    keys: Vec<String>,
    key_lookup: HashMap<String, u32>,
    values: Vec<ValueTable>,
}

impl Default for TagStore {
    fn default() -> Self {
        TagStore::new()
    }
}

impl TagStore {
    pub fn new() -> Self {
        TagStore {
            keys: Vec::with_capacity(INITIAL_KEY_CAPACITY),
            key_lookup: HashMap::new(),
            values: Vec::with_capacity(INITIAL_KEY_CAPACITY),
        }
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn num_values(&self, key: KeyId) -> usize {
        self.values[key.0 as usize].values.len()
    }

    pub fn find_key(&self, key: &str) -> Option<KeyId> {
        self.key_lookup.get(key).map(|&k| KeyId(k))
    }

    pub fn find_value(&self, key: KeyId, value: &str) -> Option<ValueId> {
        self.values.get(key.0 as usize)?
            .find(value)
            .map(|v| ValueId(v + 1))
    }

    pub fn intern_key(&mut self, key: &str) -> KeyId {
        if let Some(k) = self.find_key(key) {
            return k;
        }
        assert!((self.keys.len() as u64) < MAX_IDS as u64, "tag key table exhausted");
        if self.keys.len() == self.keys.capacity() {
            let grow = self.keys.len().max(INITIAL_KEY_CAPACITY);
            self.keys.reserve(grow);
            self.values.reserve(grow);
        }
        let k = self.keys.len() as u32;
        self.keys.push(key.to_string());
        self.values.push(ValueTable::default());
        self.key_lookup.insert(key.to_string(), k);
        KeyId(k)
    }

    pub fn intern_value(&mut self, key: KeyId, value: &str) -> ValueId {
        if let Some(v) = self.find_value(key, value) {
            return v;
        }
        ValueId(self.values[key.0 as usize].add(value) + 1)
    }

    /// Lookup without side effects. `None` as value asks for the key alone.
    pub fn find(&self, key: &str, value: Option<&str>) -> Option<TagIndex> {
        let k = self.find_key(key)?;
        match value {
            None => Some(TagIndex::any_value(k)),
            Some(value) => Some(TagIndex::new(k, self.find_value(k, value)?)),
        }
    }

    pub fn find_or_intern(&mut self, key: &str, value: Option<&str>) -> TagIndex {
        let k = self.intern_key(key);
        match value {
            None => TagIndex::any_value(k),
            Some(value) => TagIndex::new(k, self.intern_value(k, value)),
        }
    }

    pub fn key(&self, index: TagIndex) -> &str {
        &self.keys[index.key.0 as usize]
    }

    /// `None` for the any-value index.
    pub fn value(&self, index: TagIndex) -> Option<&str> {
        if index.value.0 == 0 {
            return None;
        }
        self.values[index.key.0 as usize]
            .values
            .get(index.value.0 as usize - 1)
            .map(String::as_str)
    }
}
