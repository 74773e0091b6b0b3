// Directory entries and the local data array. The directory tracks every
// block held by an upstream child (non-inclusive: a tracked block need not
// be cached locally); the smaller data array holds the subset of lines with
// a local copy. A directory entry and its data slot are related by index,
// both owned here.

use std::collections::BTreeSet;

use super::common::{Addr, Config, PeerId, State};

/// One tracked block: coherence state, upstream sharers and owner, optional
/// local data slot, prefetch mark and the per-line send timestamp.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub base_addr: Addr,
    pub valid: bool,
    state: State,
    sharers: BTreeSet<PeerId>,
    owner: Option<PeerId>,
    pub data_slot: Option<usize>,
    pub prefetch: bool,
    pub timestamp: u64,
    last_used: u64,
}

impl DirEntry {
    fn empty() -> DirEntry {
        DirEntry {
            base_addr: Addr(0),
            valid: false,
            state: State::I,
            sharers: BTreeSet::new(),
            owner: None,
            data_slot: None,
            prefetch: false,
            timestamp: 0,
            last_used: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn in_transition(&self) -> bool {
        self.state.in_transition()
    }

    pub fn num_sharers(&self) -> usize {
        self.sharers.len()
    }

    pub fn is_sharer(&self, id: PeerId) -> bool {
        self.sharers.contains(&id)
    }

    pub fn add_sharer(&mut self, id: PeerId) {
        debug_assert!(self.owner.is_none(), "sharer added while owner present");
        self.sharers.insert(id);
    }

    pub fn remove_sharer(&mut self, id: PeerId) {
        self.sharers.remove(&id);
    }

    /// Deterministic "first" sharer: the one a Fetch is directed at.
    pub fn first_sharer(&self) -> Option<PeerId> {
        self.sharers.iter().next().copied()
    }

    pub fn sharers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.sharers.iter().copied()
    }

    pub fn owner(&self) -> Option<PeerId> {
        self.owner
    }

    pub fn set_owner(&mut self, id: PeerId) {
        debug_assert!(self.sharers.is_empty() || self.sharers.contains(&id),
            "owner granted while foreign sharers present");
        self.owner = Some(id);
    }

    pub fn clear_owner(&mut self) {
        self.owner = None;
    }

    fn reset(&mut self, base_addr: Addr) {
        self.base_addr = base_addr;
        self.valid = true;
        self.state = State::I;
        self.sharers.clear();
        self.owner = None;
        self.data_slot = None;
        self.prefetch = false;
        self.timestamp = 0;
    }
}

/// A local payload slot, tagged with the base address it currently caches.
#[derive(Clone, Debug)]
pub struct DataSlot {
    pub tag: Option<Addr>,
    pub data: Vec<u8>,
    last_used: u64,
}

pub struct CacheArray {
    line_size: usize,
    dir_sets: usize,
    dir_assoc: usize,
    data_sets: usize,
    data_assoc: usize,
    entries: Vec<DirEntry>,
    slots: Vec<DataSlot>,
    lru_tick: u64,
}

impl CacheArray {
    pub fn new(cfg: &Config) -> CacheArray {
        CacheArray {
            line_size: cfg.line_size,
            dir_sets: cfg.dir_sets,
            dir_assoc: cfg.dir_assoc,
            data_sets: cfg.data_sets,
            data_assoc: cfg.data_assoc,
            entries: (0..cfg.dir_sets * cfg.dir_assoc).map(|_| DirEntry::empty()).collect(),
            slots: (0..cfg.data_sets * cfg.data_assoc)
                .map(|_| DataSlot { tag: None, data: vec![0; cfg.line_size], last_used: 0 })
                .collect(),
            lru_tick: 0,
        }
    }

    fn dir_set_of(&self, addr: Addr) -> usize {
        ((addr.0 as usize / self.line_size) % self.dir_sets) * self.dir_assoc
    }

    fn data_set_of(&self, addr: Addr) -> usize {
        ((addr.0 as usize / self.line_size) % self.data_sets) * self.data_assoc
    }

    /// Find the directory entry tracking `addr`. `touch` refreshes LRU.
    pub fn lookup(&mut self, addr: Addr, touch: bool) -> Option<usize> {
        let set = self.dir_set_of(addr);
        for way in 0..self.dir_assoc {
            let idx = set + way;
            if self.entries[idx].valid && self.entries[idx].base_addr == addr {
                if touch {
                    self.lru_tick += 1;
                    self.entries[idx].last_used = self.lru_tick;
                }
                return Some(idx);
            }
        }
        None
    }

    pub fn peek(&self, addr: Addr) -> Option<usize> {
        let set = self.dir_set_of(addr);
        (0..self.dir_assoc)
            .map(|w| set + w)
            .find(|&idx| self.entries[idx].valid && self.entries[idx].base_addr == addr)
    }

    pub fn entry(&self, idx: usize) -> &DirEntry {
        &self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut DirEntry {
        &mut self.entries[idx]
    }

    /// Pick a victim directory entry in `addr`'s set: an invalid way if one
    /// exists, otherwise the least recently used way. The caller checks
    /// whether the victim is in transition before evicting.
    pub fn find_replacement_candidate(&self, addr: Addr) -> usize {
        let set = self.dir_set_of(addr);
        for way in 0..self.dir_assoc {
            if !self.entries[set + way].valid {
                return set + way;
            }
        }
        (0..self.dir_assoc)
            .map(|w| set + w)
            .min_by_key(|&idx| self.entries[idx].last_used)
            .unwrap()
    }

    /// Re-tag a victim entry as a fresh invalid line for `addr`. A data
    /// slot still attached to the victim is released.
    pub fn replace(&mut self, addr: Addr, idx: usize) {
        if let Some(slot) = self.entries[idx].data_slot.take() {
            self.slots[slot].tag = None;
        }
        self.lru_tick += 1;
        self.entries[idx].reset(addr);
        self.entries[idx].last_used = self.lru_tick;
    }

    pub fn invalidate(&mut self, idx: usize) {
        if let Some(slot) = self.entries[idx].data_slot.take() {
            self.slots[slot].tag = None;
        }
        self.entries[idx].valid = false;
        self.entries[idx].set_state(State::I);
    }

    /// Pick a victim data slot in `addr`'s data set: a free slot if one
    /// exists, otherwise the least recently used.
    pub fn find_data_victim(&self, addr: Addr) -> usize {
        let set = self.data_set_of(addr);
        for way in 0..self.data_assoc {
            if self.slots[set + way].tag.is_none() {
                return set + way;
            }
        }
        (0..self.data_assoc)
            .map(|w| set + w)
            .min_by_key(|&idx| self.slots[idx].last_used)
            .unwrap()
    }

    /// The directory entry whose local copy lives in `slot`, if any.
    pub fn dir_entry_of_slot(&self, slot: usize) -> Option<usize> {
        let tag = self.slots[slot].tag?;
        self.peek(tag)
    }

    pub fn attach_slot(&mut self, idx: usize, slot: usize) {
        debug_assert!(self.slots[slot].tag.is_none(), "attaching an occupied slot");
        self.slots[slot].tag = Some(self.entries[idx].base_addr);
        self.slots[slot].data.fill(0);
        self.lru_tick += 1;
        self.slots[slot].last_used = self.lru_tick;
        self.entries[idx].data_slot = Some(slot);
    }

    pub fn detach_slot(&mut self, idx: usize) {
        if let Some(slot) = self.entries[idx].data_slot.take() {
            self.slots[slot].tag = None;
        }
    }

    pub fn is_cached(&self, idx: usize) -> bool {
        self.entries[idx].data_slot.is_some()
    }

    pub fn slot_data(&self, idx: usize) -> Option<&Vec<u8>> {
        self.entries[idx].data_slot.map(|s| &self.slots[s].data)
    }

    pub fn set_slot_data(&mut self, idx: usize, data: &[u8]) {
        if let Some(slot) = self.entries[idx].data_slot {
            let n = data.len().min(self.slots[slot].data.len());
            self.slots[slot].data[..n].copy_from_slice(&data[..n]);
            self.lru_tick += 1;
            self.slots[slot].last_used = self.lru_tick;
        }
    }

    pub fn touch_slot(&mut self, idx: usize) {
        if let Some(slot) = self.entries[idx].data_slot {
            self.lru_tick += 1;
            self.slots[slot].last_used = self.lru_tick;
        }
    }

    /// All valid entries, for invariant checks and stats dumps.
    pub fn valid_entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().filter(|e| e.valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> Config {
        Config {
            dir_sets: 2,
            dir_assoc: 2,
            data_sets: 2,
            data_assoc: 1,
            line_size: 64,
            ..Config::default()
        }
    }

    fn addr(n: u64) -> Addr {
        Addr(n * 64)
    }

    #[test]
    fn lookup_misses_until_replaced() {
        let mut array = CacheArray::new(&small_cfg());
        assert!(array.lookup(addr(0), true).is_none());
        let victim = array.find_replacement_candidate(addr(0));
        array.replace(addr(0), victim);
        let idx = array.lookup(addr(0), true).unwrap();
        assert_eq!(array.entry(idx).base_addr, addr(0));
        assert_eq!(array.entry(idx).state(), State::I);
    }

    #[test]
    fn replacement_prefers_invalid_then_lru() {
        let mut array = CacheArray::new(&small_cfg());
        // same set: addresses 0 and 2 map to set 0 (2 dir sets)
        let v0 = array.find_replacement_candidate(addr(0));
        array.replace(addr(0), v0);
        let v1 = array.find_replacement_candidate(addr(2));
        assert_ne!(v0, v1, "invalid way preferred over eviction");
        array.replace(addr(2), v1);
        // touch addr(0) so addr(2) becomes LRU
        array.lookup(addr(0), true);
        let v2 = array.find_replacement_candidate(addr(4));
        assert_eq!(v2, v1);
    }

    #[test]
    fn data_slot_attach_detach() {
        let mut array = CacheArray::new(&small_cfg());
        let victim = array.find_replacement_candidate(addr(0));
        array.replace(addr(0), victim);
        let idx = array.lookup(addr(0), false).unwrap();
        assert!(!array.is_cached(idx));
        let slot = array.find_data_victim(addr(0));
        array.attach_slot(idx, slot);
        assert!(array.is_cached(idx));
        array.set_slot_data(idx, &[0xab; 64]);
        assert_eq!(array.slot_data(idx).unwrap()[0], 0xab);
        assert_eq!(array.dir_entry_of_slot(slot), Some(idx));
        array.detach_slot(idx);
        assert!(!array.is_cached(idx));
    }

    #[test]
    fn owner_and_sharers_stay_exclusive() {
        let mut entry = DirEntry::empty();
        entry.reset(addr(1));
        entry.add_sharer(PeerId(1));
        entry.add_sharer(PeerId(2));
        assert_eq!(entry.first_sharer(), Some(PeerId(1)));
        entry.remove_sharer(PeerId(1));
        entry.remove_sharer(PeerId(2));
        entry.set_owner(PeerId(3));
        assert_eq!(entry.owner(), Some(PeerId(3)));
        assert_eq!(entry.num_sharers(), 0);
    }
}
