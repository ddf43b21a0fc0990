//! Keyed record store for one zone.
//!
//! Records live in a slab of slots addressed by a stable [`SlotId`]. Two
//! independent indexes reference those slots:
//!
//! - an ordered map from key hash to a bucket of slots, each bucket sorted by
//!   the full key bytes (shorter keys first on a common prefix), and
//! - a doubly-linked recency list threaded through the slots, most recently
//!   used at the head.
//!
//! The table is charged `RECORD_OVERHEAD + key length` bytes per record
//! against a fixed byte budget, mirroring a fixed-size shared arena.
//! Allocation fails once the budget is spent.

use std::collections::BTreeMap;

use super::autoblock::BlockState;
use super::clock::Timestamp;
use super::eviction::ExpireMode;
use super::key::CompositeKey;

/// Fixed bytes charged for every record besides its key.
pub const RECORD_OVERHEAD: usize = 128;

/// Stable handle to a record slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u32);

impl SlotId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Rate-limit bookkeeping for one composite key value.
#[derive(Debug, Clone)]
pub struct Record {
    hash: u32,
    key: Box<[u8]>,
    /// Time of the last accepted leaky-bucket update, in milliseconds.
    pub last_update_ms: u64,
    /// Fixed-point excess, never negative.
    pub excess: u64,
    /// Auto-block statistics and the hard-block deadline.
    pub block: BlockState,
    /// Requests counted in the previous full segment.
    pub last_seg: u64,
    /// Requests counted in the current partial segment.
    pub curr_seg: u64,
}

impl Record {
    fn new(key: &CompositeKey, now: Timestamp) -> Self {
        Self {
            hash: key.hash(),
            key: key.bytes().into(),
            last_update_ms: now.as_millis(),
            excess: 0,
            block: BlockState::default(),
            last_seg: 0,
            curr_seg: 1,
        }
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    fn charge(&self) -> usize {
        RECORD_OVERHEAD + self.key.len()
    }
}

/// The table could not fit another record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFull;

#[derive(Debug, Default)]
struct Slot {
    record: Option<Record>,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

/// Hash-ordered records plus recency order, bounded by a byte budget.
#[derive(Debug)]
pub struct ZoneTable {
    slots: Vec<Slot>,
    free: Vec<SlotId>,
    index: BTreeMap<u32, Vec<SlotId>>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
    len: usize,
    capacity: usize,
    used: usize,
}

fn key_of(slots: &[Slot], id: SlotId) -> &[u8] {
    slots[id.index()]
        .record
        .as_ref()
        .map(|r| r.key())
        .unwrap_or_default()
}

impl ZoneTable {
    /// Create an empty table holding at most `capacity` bytes of records.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: BTreeMap::new(),
            head: None,
            tail: None,
            len: 0,
            capacity,
            used: 0,
        }
    }

    /// Bytes a record with a key of `key_len` bytes is charged.
    pub fn record_size(key_len: usize) -> usize {
        RECORD_OVERHEAD + key_len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn get(&self, id: SlotId) -> Option<&Record> {
        self.slots.get(id.index()).and_then(|s| s.record.as_ref())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut Record> {
        self.slots.get_mut(id.index()).and_then(|s| s.record.as_mut())
    }

    /// Locate the record for `key` without touching recency.
    pub fn find(&self, key: &CompositeKey) -> Option<SlotId> {
        let bucket = self.index.get(&key.hash())?;
        bucket
            .binary_search_by(|&id| key_of(&self.slots, id).cmp(key.bytes()))
            .ok()
            .map(|pos| bucket[pos])
    }

    /// Locate the record for `key` and promote it to most recently used.
    pub fn find_and_touch(&mut self, key: &CompositeKey) -> Option<SlotId> {
        let id = self.find(key)?;
        self.move_to_head(id);
        Some(id)
    }

    /// Least recently used record.
    pub fn tail(&self) -> Option<SlotId> {
        self.tail
    }

    /// Most recently used record.
    pub fn head(&self) -> Option<SlotId> {
        self.head
    }

    /// Slots from most to least recently used.
    pub fn recency(&self) -> impl Iterator<Item = SlotId> + '_ {
        std::iter::successors(self.head, move |id| self.slots[id.index()].next)
    }

    /// Insert a fresh record for `key`, created at `now`.
    ///
    /// When the budget is spent, one forced eviction pass runs (using the
    /// zone `rate` for its idle test) and the allocation is retried once.
    /// An existing record for the key is returned as is.
    pub fn insert(
        &mut self,
        key: &CompositeKey,
        now: Timestamp,
        rate: u64,
    ) -> Result<SlotId, TableFull> {
        if let Some(id) = self.find(key) {
            self.move_to_head(id);
            return Ok(id);
        }

        if let Some(id) = self.try_insert(key, now) {
            return Ok(id);
        }

        self.expire(now, rate, ExpireMode::Forced);
        self.try_insert(key, now).ok_or(TableFull)
    }

    fn try_insert(&mut self, key: &CompositeKey, now: Timestamp) -> Option<SlotId> {
        let record = Record::new(key, now);
        let charge = record.charge();
        if self.used + charge > self.capacity {
            return None;
        }

        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id.index()] = Slot {
                    record: Some(record),
                    prev: None,
                    next: None,
                };
                id
            }
            None => {
                let id = SlotId(u32::try_from(self.slots.len()).ok()?);
                self.slots.push(Slot {
                    record: Some(record),
                    prev: None,
                    next: None,
                });
                id
            }
        };

        let slots = &self.slots;
        let bucket = self.index.entry(key.hash()).or_default();
        let pos = bucket
            .binary_search_by(|&other| key_of(slots, other).cmp(key.bytes()))
            .unwrap_or_else(|pos| pos);
        bucket.insert(pos, id);

        self.link_front(id);
        self.used += charge;
        self.len += 1;
        Some(id)
    }

    /// Remove a record from both indexes and return its memory to the budget.
    pub fn remove(&mut self, id: SlotId) -> Option<Record> {
        let record = self.slots.get_mut(id.index())?.record.take()?;

        self.unlink(id);

        if let Some(bucket) = self.index.get_mut(&record.hash) {
            bucket.retain(|&other| other != id);
            if bucket.is_empty() {
                self.index.remove(&record.hash);
            }
        }

        self.free.push(id);
        self.used -= record.charge();
        self.len -= 1;
        Some(record)
    }

    /// Promote a record to the head of the recency list.
    pub fn move_to_head(&mut self, id: SlotId) {
        if self.head == Some(id) {
            return;
        }
        self.unlink(id);
        self.link_front(id);
    }

    fn link_front(&mut self, id: SlotId) {
        let old_head = self.head;
        {
            let slot = &mut self.slots[id.index()];
            slot.prev = None;
            slot.next = old_head;
        }
        match old_head {
            Some(h) => self.slots[h.index()].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
    }

    fn unlink(&mut self, id: SlotId) {
        let (prev, next) = {
            let slot = &mut self.slots[id.index()];
            (slot.prev.take(), slot.next.take())
        };
        match prev {
            Some(p) => self.slots[p.index()].next = next,
            None if self.head == Some(id) => self.head = next,
            None => {}
        }
        match next {
            Some(n) => self.slots[n.index()].prev = prev,
            None if self.tail == Some(id) => self.tail = prev,
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Timestamp = Timestamp::from_secs(1_700_000_000);
    const RATE: u64 = 10_000;

    fn key(s: &str) -> CompositeKey {
        CompositeKey::from_parts(&[s.as_bytes()])
    }

    fn table() -> ZoneTable {
        ZoneTable::with_capacity(1 << 20)
    }

    #[test]
    fn test_insert_then_find() {
        let mut t = table();
        let id = t.insert(&key("10.0.0.1"), NOW, RATE).unwrap();

        assert_eq!(t.find(&key("10.0.0.1")), Some(id));
        assert_eq!(t.find(&key("10.0.0.2")), None);
        assert_eq!(t.len(), 1);

        let rec = t.get(id).unwrap();
        assert_eq!(rec.key(), b"10.0.0.1");
        assert_eq!(rec.excess, 0);
        assert_eq!(rec.last_update_ms, NOW.as_millis());
        assert_eq!(rec.curr_seg, 1);
    }

    #[test]
    fn test_insert_same_key_reuses_record() {
        let mut t = table();
        let a = t.insert(&key("client"), NOW, RATE).unwrap();
        let b = t.insert(&key("client"), NOW, RATE).unwrap();
        assert_eq!(a, b);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_hash_collisions_resolved_by_full_key() {
        let mut t = table();
        let long = CompositeKey::with_hash(7, b"abcd");
        let short = CompositeKey::with_hash(7, b"abc");
        let other = CompositeKey::with_hash(7, b"abd");

        let a = t.insert(&long, NOW, RATE).unwrap();
        let b = t.insert(&other, NOW, RATE).unwrap();
        let c = t.insert(&short, NOW, RATE).unwrap();

        assert_eq!(t.find(&long), Some(a));
        assert_eq!(t.find(&other), Some(b));
        assert_eq!(t.find(&short), Some(c));
        assert_eq!(t.find(&CompositeKey::with_hash(7, b"ab")), None);

        // bucket ordering: shorter prefix first, then byte order
        assert_eq!(t.index[&7], vec![c, a, b]);
    }

    #[test]
    fn test_recency_order_and_touch() {
        let mut t = table();
        let a = t.insert(&key("a"), NOW, RATE).unwrap();
        let b = t.insert(&key("b"), NOW, RATE).unwrap();
        let c = t.insert(&key("c"), NOW, RATE).unwrap();

        assert_eq!(t.recency().collect::<Vec<_>>(), vec![c, b, a]);
        assert_eq!(t.tail(), Some(a));

        assert_eq!(t.find_and_touch(&key("a")), Some(a));
        assert_eq!(t.recency().collect::<Vec<_>>(), vec![a, c, b]);
        assert_eq!(t.tail(), Some(b));
        assert_eq!(t.head(), Some(a));
    }

    #[test]
    fn test_remove_from_middle_keeps_links() {
        let mut t = table();
        let a = t.insert(&key("a"), NOW, RATE).unwrap();
        let b = t.insert(&key("b"), NOW, RATE).unwrap();
        let c = t.insert(&key("c"), NOW, RATE).unwrap();

        let removed = t.remove(b).unwrap();
        assert_eq!(removed.key(), b"b");
        assert_eq!(t.recency().collect::<Vec<_>>(), vec![c, a]);
        assert_eq!(t.find(&key("b")), None);
        assert_eq!(t.len(), 2);
        assert!(t.remove(b).is_none());
    }

    #[test]
    fn test_slots_are_reused() {
        let mut t = table();
        let a = t.insert(&key("a"), NOW, RATE).unwrap();
        t.remove(a);
        let b = t.insert(&key("b"), NOW, RATE).unwrap();
        assert_eq!(a, b);
        assert_eq!(t.slots.len(), 1);
    }

    #[test]
    fn test_budget_accounting() {
        let mut t = table();
        let a = t.insert(&key("abcd"), NOW, RATE).unwrap();
        assert_eq!(t.used(), ZoneTable::record_size(4));
        t.remove(a);
        assert_eq!(t.used(), 0);
        assert!(t.is_empty());
    }

    #[test]
    fn test_full_table_forces_eviction_of_lru() {
        let mut t = ZoneTable::with_capacity(2 * ZoneTable::record_size(1));
        t.insert(&key("a"), NOW, RATE).unwrap();
        t.insert(&key("b"), NOW, RATE).unwrap();

        // no room: the forced sweep drops "a", the least recently used
        let c = t.insert(&key("c"), NOW, RATE).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.find(&key("a")), None);
        assert_eq!(t.find(&key("c")), Some(c));
    }

    #[test]
    fn test_record_larger_than_zone_fails() {
        let mut t = ZoneTable::with_capacity(ZoneTable::record_size(4));
        assert_eq!(t.insert(&key("too long"), NOW, RATE), Err(TableFull));
        assert!(t.is_empty());
    }
}
