//! Bounded least-recently-used store of rendered tiles. The recency list is
//! linked through slot indices so entries never hold addresses.

use std::collections::HashMap;

use crate::rules::Fingerprint;
use crate::tiles::TileId;

struct Entry<I> {
    tile: TileId,
    fingerprint: Fingerprint,
    image: I,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
}

pub struct RenderCache<I> {
    capacity: usize,
    slots: Vec<Option<Entry<I>>>,
    free: Vec<usize>,
    by_tile: HashMap<TileId, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    stats: CacheStats,
}

impl<I> RenderCache<I> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "render cache needs room for at least one tile");
        RenderCache {
            capacity,
            slots: Vec::with_capacity(capacity + 1),
            free: Vec::new(),
            by_tile: HashMap::with_capacity(capacity + 1),
            head: None,
            tail: None,
            stats: CacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_tile.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tile.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats { len: self.len(), ..self.stats }
    }

    fn entry(&self, slot: usize) -> &Entry<I> {
        match &self.slots[slot] {
            Some(entry) => entry,
            None => panic!("render cache slot {} is linked but empty", slot),
        }
    }

    fn entry_mut(&mut self, slot: usize) -> &mut Entry<I> {
        match &mut self.slots[slot] {
            Some(entry) => entry,
            None => panic!("render cache slot {} is linked but empty", slot),
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let entry = self.entry(slot);
            (entry.prev, entry.next)
        };
        match prev {
            Some(p) => self.entry_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entry_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let entry = self.entry_mut(slot);
        entry.prev = None;
        entry.next = None;
    }

    fn link_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let entry = self.entry_mut(slot);
            entry.prev = None;
            entry.next = old_head;
        }
        match old_head {
            Some(h) => self.entry_mut(h).prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
    }

    /// Takes `slot` out of both the list and the map.
    fn remove_slot(&mut self, slot: usize) -> Option<Entry<I>> {
        self.unlink(slot);
        let entry = self.slots[slot].take()?;
        self.by_tile.remove(&entry.tile);
        self.free.push(slot);
        Some(entry)
    }

    /// Image of `tile` if it was stored under exactly `fingerprint`.
    pub fn get(&mut self, tile: TileId, fingerprint: Fingerprint) -> Option<&I> {
        let slot = match self.by_tile.get(&tile) {
            Some(&slot) if self.entry(slot).fingerprint == fingerprint => slot,
            _ => {
                self.stats.misses += 1;
                return None;
            },
        };
        self.stats.hits += 1;
        self.unlink(slot);
        self.link_front(slot);
        Some(&self.entry(slot).image)
    }

    /// Like `get` but leaves recency and statistics alone.
    pub fn peek(&self, tile: TileId, fingerprint: Fingerprint) -> Option<&I> {
        let &slot = self.by_tile.get(&tile)?;
        let entry = self.entry(slot);
        (entry.fingerprint == fingerprint).then_some(&entry.image)
    }

    #[cfg(test)]
    pub fn contains(&self, tile: TileId, fingerprint: Fingerprint) -> bool {
        self.by_tile.get(&tile)
            .map_or(false, |&slot| self.entry(slot).fingerprint == fingerprint)
    }

    /// Stores `image` as the most recent entry, replacing anything held for
    /// the tile, and evicts the least recent entry when over capacity.
    pub fn put(&mut self, tile: TileId, fingerprint: Fingerprint, image: I) {
        if let Some(&old) = self.by_tile.get(&tile) {
            self.remove_slot(old);
        }
        let entry = Entry { tile, fingerprint, image, prev: None, next: None };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            },
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            },
        };
        self.by_tile.insert(tile, slot);
        self.link_front(slot);

        while self.by_tile.len() > self.capacity {
            let Some(last) = self.tail else { break };
            self.remove_slot(last);
            self.stats.evictions += 1;
        }
    }

    /// Tile ids from most to least recently used.
    #[cfg(test)]
    pub fn recency(&self) -> Vec<TileId> {
        let mut ret = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let entry = self.entry(slot);
            ret.push(entry.tile);
            cursor = entry.next;
        }
        ret
    }
}
