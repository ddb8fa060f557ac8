//! Allocation table and entry lifecycle
//!
//! The table is the runtime's ground truth: one entry per live tracked
//! allocation, keyed by base address, ordered so interior pointers resolve
//! by predecessor lookup. Entries never overlap. A structural mismatch
//! between the table and what the instrumented program actually did
//! (double free, duplicate base) is a desync and panics: once the table
//! lies, nothing built on it can be trusted.

use molt_index::OrderedIndex;
use rustc_hash::FxHashSet;

/// One live tracked allocation.
#[derive(Debug, Clone)]
pub struct AllocationEntry {
    /// Base address of the allocation
    pub base: u64,
    /// Size in bytes; the entry covers `[base, base + size)`
    pub size: u64,
    /// Addresses of memory words known to hold a pointer into this
    /// allocation
    pub escape_set: FxHashSet<u64>,
    /// Pinned entries refuse relocation
    pub pinned: bool,
}

impl AllocationEntry {
    /// Create an entry with an empty escape set.
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            escape_set: FxHashSet::default(),
            pinned: false,
        }
    }

    /// One past the last address covered, saturating at the top of the
    /// address space for entries that would wrap.
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    /// Whether `addr` lies inside the allocation. The end address itself
    /// does not alias the entry.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Offset of `value` into the allocation, if it points inside.
    pub fn offset_of(&self, value: u64) -> Option<u64> {
        if self.contains(value) {
            Some(value - self.base)
        } else {
            None
        }
    }
}

/// Ordered table of live allocations, keyed by base address.
#[derive(Debug, Clone, Default)]
pub struct AllocationTable {
    index: OrderedIndex<u64, AllocationEntry>,
}

impl AllocationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Insert a fresh entry.
    ///
    /// # Panics
    /// Panics if an entry with the same base is already live: the
    /// instrumented program and the table have desynchronized.
    pub fn insert(&mut self, entry: AllocationEntry) {
        let base = entry.base;
        if !self.index.insert_if_absent(base, entry) {
            panic!("allocation table desync: base {base:#x} is already tracked");
        }
    }

    /// Insert an entry, tolerating a duplicate base.
    ///
    /// Used for global registration, where constructors can legitimately
    /// run more than once. Returns false (leaving the existing entry
    /// untouched) on a duplicate.
    pub fn insert_tolerant(&mut self, entry: AllocationEntry) -> bool {
        let base = entry.base;
        self.index.insert_if_absent(base, entry)
    }

    /// Remove and return the entry based at `base`.
    ///
    /// # Panics
    /// Panics if no such entry is live: a free of something the runtime
    /// never saw allocated, or a double free.
    pub fn remove(&mut self, base: u64) -> AllocationEntry {
        match self.index.remove(base) {
            Some(entry) => entry,
            None => panic!("allocation table desync: {base:#x} is not tracked"),
        }
    }

    /// Exact lookup by base address.
    pub fn get(&self, base: u64) -> Option<&AllocationEntry> {
        self.index.get(base)
    }

    /// Resolve any interior address to its covering entry.
    pub fn find_entry(&self, addr: u64) -> Option<&AllocationEntry> {
        match self.index.predecessor(addr) {
            Some((_, entry)) if entry.contains(addr) => Some(entry),
            _ => None,
        }
    }

    /// Resolve any interior address to its covering entry, mutable.
    pub fn find_entry_mut(&mut self, addr: u64) -> Option<&mut AllocationEntry> {
        match self.index.predecessor_mut(addr) {
            Some((_, entry)) if entry.contains(addr) => Some(entry),
            _ => None,
        }
    }

    /// Whether any live entry intersects `[addr, addr + len)`.
    ///
    /// Because live entries never overlap, the entry with the greatest
    /// base at or below the range's last address is the only candidate.
    pub fn overlaps_range(&self, addr: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        let last = addr.saturating_add(len - 1);
        match self.index.predecessor(last) {
            Some((_, entry)) => entry.end() > addr,
            None => false,
        }
    }

    /// Iterate live entries in ascending base order.
    pub fn iter(&self) -> impl Iterator<Item = &AllocationEntry> + '_ {
        self.index.iter().map(|(_, entry)| entry)
    }

    /// Total bytes covered by live entries.
    pub fn tracked_bytes(&self) -> u64 {
        self.iter().map(|entry| entry.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_entry_resolves_interior() {
        let mut table = AllocationTable::new();
        table.insert(AllocationEntry::new(0x1000, 64));
        table.insert(AllocationEntry::new(0x2000, 32));

        // Base, interior, and last byte all resolve
        assert_eq!(table.find_entry(0x1000).unwrap().base, 0x1000);
        assert_eq!(table.find_entry(0x1020).unwrap().base, 0x1000);
        assert_eq!(table.find_entry(0x103F).unwrap().base, 0x1000);

        // One past the end does not alias
        assert!(table.find_entry(0x1040).is_none());
        // Below the first entry resolves to nothing
        assert!(table.find_entry(0xFFF).is_none());
    }

    #[test]
    #[should_panic(expected = "already tracked")]
    fn test_duplicate_insert_panics() {
        let mut table = AllocationTable::new();
        table.insert(AllocationEntry::new(0x1000, 64));
        table.insert(AllocationEntry::new(0x1000, 32));
    }

    #[test]
    #[should_panic(expected = "is not tracked")]
    fn test_remove_missing_panics() {
        let mut table = AllocationTable::new();
        table.remove(0x1000);
    }

    #[test]
    fn test_tolerant_insert_for_globals() {
        let mut table = AllocationTable::new();
        assert!(table.insert_tolerant(AllocationEntry::new(0x1000, 64)));
        // Re-registration is silently ignored
        assert!(!table.insert_tolerant(AllocationEntry::new(0x1000, 128)));
        assert_eq!(table.get(0x1000).unwrap().size, 64);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_overlaps_range() {
        let mut table = AllocationTable::new();
        table.insert(AllocationEntry::new(0x1000, 0x100));

        assert!(table.overlaps_range(0x1080, 0x10));
        assert!(table.overlaps_range(0xF80, 0x100));
        assert!(table.overlaps_range(0x1000, 0x100));

        // Touching the end is not an overlap
        assert!(!table.overlaps_range(0x1100, 0x100));
        // Ending at the base is not an overlap
        assert!(!table.overlaps_range(0xF00, 0x100));
        assert!(!table.overlaps_range(0x1080, 0));
    }

    #[test]
    fn test_entry_at_address_space_edge() {
        let mut table = AllocationTable::new();
        table.insert(AllocationEntry::new(u64::MAX - 0xF, 0x100));

        // The extent saturates instead of wrapping around zero
        let entry = table.find_entry(u64::MAX - 1).unwrap();
        assert_eq!(entry.end(), u64::MAX);
        assert!(table.overlaps_range(u64::MAX - 0x20, 0x40));

        // Low addresses are not aliased by the oversized entry
        assert!(table.find_entry(0x10).is_none());
        assert!(!table.overlaps_range(0x0, 0x100));
    }

    #[test]
    fn test_tracked_bytes() {
        let mut table = AllocationTable::new();
        table.insert(AllocationEntry::new(0x1000, 64));
        table.insert(AllocationEntry::new(0x2000, 36));
        assert_eq!(table.tracked_bytes(), 100);

        table.remove(0x1000);
        assert_eq!(table.tracked_bytes(), 36);
    }

    #[test]
    fn test_entry_offset_of() {
        let entry = AllocationEntry::new(0x1000, 64);
        assert_eq!(entry.offset_of(0x1000), Some(0));
        assert_eq!(entry.offset_of(0x1030), Some(0x30));
        assert_eq!(entry.offset_of(0x1040), None);
        assert_eq!(entry.offset_of(0xFFF), None);
    }
}
