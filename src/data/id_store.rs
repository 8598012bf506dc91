//! Arena of id-carrying records with a fixed size bucket table for id lookup.

use super::osm::OsmId;

const NIL: u32 = u32::MAX;

pub trait Identified {
    fn osm_id(&self) -> OsmId;
}

/// Chain length figures over all buckets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainStatistics {
    pub average: f64,
    pub std_dev: f64,
    pub max: u32,
}

/// Objects are kept in insertion order. `heads[id & mask]` starts a chain
/// through `next`, newest object first.
#[derive(Debug)]
pub struct IdStore<T> {
    objects: Vec<T>,
    next: Vec<u32>,
    heads: Vec<u32>,
    chain_lengths: Vec<u32>,
    mask: u64,
}

impl<T: Identified> IdStore<T> {
    pub fn new(bits: u32) -> Self {
        assert!(bits > 0 && bits <= 28, "id store bucket width out of range: {}", bits);
        let size = 1usize << bits;
        IdStore {
            objects: Vec::new(),
            next: Vec::new(),
            heads: vec![NIL; size],
            chain_lengths: vec![0; size],
            mask: (size - 1) as u64,
        }
    }

    fn bucket(&self, id: OsmId) -> usize {
        (id & self.mask) as usize
    }

    pub fn push(&mut self, object: T) -> u32 {
        assert!(self.objects.len() < NIL as usize, "id store exhausted");
        let index = self.objects.len() as u32;
        let bucket = self.bucket(object.osm_id());
        self.next.push(self.heads[bucket]);
        self.heads[bucket] = index;
        self.chain_lengths[bucket] += 1;
        self.objects.push(object);
        index
    }

    /// Position of the most recently added object with this id.
    pub fn find(&self, id: OsmId) -> Option<u32> {
        let mut cursor = self.heads[self.bucket(id)];
        while cursor != NIL {
            if self.objects[cursor as usize].osm_id() == id {
                return Some(cursor);
            }
            cursor = self.next[cursor as usize];
        }
        None
    }

    pub fn get(&self, index: u32) -> &T {
        &self.objects[index as usize]
    }

    pub fn get_mut(&mut self, index: u32) -> &mut T {
        &mut self.objects[index as usize]
    }

    pub fn last_mut(&mut self) -> Option<&mut T> {
        self.objects.last_mut()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.objects.iter()
    }

    pub fn statistics(&self) -> ChainStatistics {
        let size = self.chain_lengths.len() as f64;
        let mut s1 = 0u64;
        let mut s2 = 0u64;
        let mut max = 0u32;
        for &c in &self.chain_lengths {
            s1 += c as u64;
            s2 += (c as u64) * (c as u64);
            max = max.max(c);
        }
        let average = s1 as f64 / size;
        let variance = (s2 as f64 / size - average * average).max(0.0);
        ChainStatistics {
            average,
            std_dev: variance.sqrt(),
            max,
        }
    }
}
