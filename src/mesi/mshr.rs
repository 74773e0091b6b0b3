// Miss/transaction status holding registers. One register per base address
// holds a FIFO of outstanding events, the invalidation-ack countdown, a data
// buffer for payloads shuttled through transitions, and the pending
// writeback mark used to pair Put* requests with their AckPut.

use std::collections::{HashMap, VecDeque};

use log::trace;

use super::common::{Addr, MemEvent};

/// A parked unit of work. `Event` is a request, replacement, flush or
/// stalled invalidation; `Pointer` chains a replacement waiter: when the
/// transaction for this address completes, the head event parked under the
/// pointed-to address is retried.
#[derive(Clone, Debug)]
pub enum MshrEntry {
    Event(MemEvent),
    Pointer(Addr),
}

#[derive(Default)]
struct Register {
    queue: VecDeque<MshrEntry>,
    acks_needed: u32,
    data_buffer: Option<Vec<u8>>,
    pending_writeback: bool,
}

impl Register {
    fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && self.acks_needed == 0
            && self.data_buffer.is_none()
            && !self.pending_writeback
    }
}

pub struct Mshr {
    regs: HashMap<Addr, Register>,
    events: usize,
    capacity: usize,
}

impl Mshr {
    pub fn new(capacity: usize) -> Mshr {
        Mshr {
            regs: HashMap::new(),
            events: 0,
            capacity,
        }
    }

    /// Whether any event or pointer is parked for `addr`.
    pub fn contains(&self, addr: Addr) -> bool {
        self.regs.get(&addr).map_or(false, |r| !r.queue.is_empty())
    }

    pub fn is_full(&self) -> bool {
        self.events >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events == 0
    }

    pub fn queue_len(&self, addr: Addr) -> usize {
        self.regs.get(&addr).map_or(0, |r| r.queue.len())
    }

    /// Park an event at the back of the address FIFO. Fails when full.
    pub fn insert(&mut self, addr: Addr, ev: MemEvent) -> bool {
        if self.is_full() {
            return false;
        }
        trace!("mshr: park {} for {} (back)", ev.cmd, addr);
        self.regs.entry(addr).or_default().queue.push_back(MshrEntry::Event(ev));
        self.events += 1;
        true
    }

    /// Park an event at the head of the address FIFO. Stalled invalidations
    /// and replayed heads go first; capacity only gates new admissions via
    /// `insert`, never events already accepted or sent from below.
    pub fn insert_front(&mut self, addr: Addr, ev: MemEvent) {
        trace!("mshr: park {} for {} (front)", ev.cmd, addr);
        self.regs.entry(addr).or_default().queue.push_front(MshrEntry::Event(ev));
        self.events += 1;
    }

    /// Park an event directly behind the in-flight head.
    pub fn insert_after_front(&mut self, addr: Addr, ev: MemEvent) {
        let reg = self.regs.entry(addr).or_default();
        let pos = 1.min(reg.queue.len());
        reg.queue.insert(pos, MshrEntry::Event(ev));
        self.events += 1;
    }

    /// Chain a replacement waiter: retrying `src`'s queue shall re-attempt
    /// the head parked under `dst`. Pointers do not count against capacity.
    pub fn insert_pointer(&mut self, src: Addr, dst: Addr) {
        trace!("mshr: pointer {} -> {}", src, dst);
        self.regs.entry(src).or_default().queue.push_back(MshrEntry::Pointer(dst));
    }

    /// The head event for `addr`, if the head is an event.
    pub fn lookup_front(&self, addr: Addr) -> Option<&MemEvent> {
        match self.regs.get(&addr).and_then(|r| r.queue.front()) {
            Some(MshrEntry::Event(ev)) => Some(ev),
            _ => None,
        }
    }

    pub fn front_entry(&self, addr: Addr) -> Option<&MshrEntry> {
        self.regs.get(&addr).and_then(|r| r.queue.front())
    }

    pub fn front_mut(&mut self, addr: Addr) -> Option<&mut MemEvent> {
        match self.regs.get_mut(&addr).and_then(|r| r.queue.front_mut()) {
            Some(MshrEntry::Event(ev)) => Some(ev),
            _ => None,
        }
    }

    pub fn remove_front(&mut self, addr: Addr) -> Option<MshrEntry> {
        let entry = self.regs.get_mut(&addr).and_then(|r| r.queue.pop_front());
        if let Some(MshrEntry::Event(ref ev)) = entry {
            trace!("mshr: pop {} for {}", ev.cmd, addr);
            self.events -= 1;
        }
        self.prune(addr);
        entry
    }

    pub fn acks_needed(&self, addr: Addr) -> u32 {
        self.regs.get(&addr).map_or(0, |r| r.acks_needed)
    }

    pub fn increment_acks_needed(&mut self, addr: Addr) {
        self.regs.entry(addr).or_default().acks_needed += 1;
    }

    pub fn decrement_acks_needed(&mut self, addr: Addr) {
        let reg = self.regs.entry(addr).or_default();
        assert!(reg.acks_needed > 0, "ack underflow for {}", addr);
        reg.acks_needed -= 1;
        self.prune(addr);
    }

    pub fn set_data_buffer(&mut self, addr: Addr, data: Vec<u8>) {
        self.regs.entry(addr).or_default().data_buffer = Some(data);
    }

    pub fn data_buffer(&self, addr: Addr) -> Option<&Vec<u8>> {
        self.regs.get(&addr).and_then(|r| r.data_buffer.as_ref())
    }

    pub fn clear_data_buffer(&mut self, addr: Addr) {
        if let Some(reg) = self.regs.get_mut(&addr) {
            reg.data_buffer = None;
        }
        self.prune(addr);
    }

    /// Mark an outbound writeback awaiting its AckPut.
    pub fn insert_writeback(&mut self, addr: Addr) {
        self.regs.entry(addr).or_default().pending_writeback = true;
    }

    pub fn pending_writeback(&self, addr: Addr) -> bool {
        self.regs.get(&addr).map_or(false, |r| r.pending_writeback)
    }

    pub fn remove_writeback(&mut self, addr: Addr) {
        if let Some(reg) = self.regs.get_mut(&addr) {
            reg.pending_writeback = false;
        }
        self.prune(addr);
    }

    fn prune(&mut self, addr: Addr) {
        if self.regs.get(&addr).map_or(false, |r| r.is_idle()) {
            self.regs.remove(&addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesi::common::{Cmd, PeerId};

    fn ev(cmd: Cmd, addr: Addr) -> MemEvent {
        MemEvent::new(PeerId(1), addr, addr, cmd)
    }

    #[test]
    fn fifo_order_per_address() {
        let mut mshr = Mshr::new(8);
        let a = Addr(0x100);
        assert!(mshr.insert(a, ev(Cmd::GetS, a)));
        assert!(mshr.insert(a, ev(Cmd::GetX, a)));
        assert_eq!(mshr.lookup_front(a).unwrap().cmd, Cmd::GetS);
        mshr.remove_front(a);
        assert_eq!(mshr.lookup_front(a).unwrap().cmd, Cmd::GetX);
        mshr.remove_front(a);
        assert!(!mshr.contains(a));
    }

    #[test]
    fn front_insert_takes_priority() {
        let mut mshr = Mshr::new(8);
        let a = Addr(0x100);
        mshr.insert(a, ev(Cmd::GetS, a));
        mshr.insert_front(a, ev(Cmd::Inv, a));
        assert_eq!(mshr.lookup_front(a).unwrap().cmd, Cmd::Inv);
    }

    #[test]
    fn insert_after_front_keeps_head() {
        let mut mshr = Mshr::new(8);
        let a = Addr(0x100);
        mshr.insert(a, ev(Cmd::GetS, a));
        mshr.insert(a, ev(Cmd::GetX, a));
        mshr.insert_after_front(a, ev(Cmd::FetchInv, a));
        assert_eq!(mshr.lookup_front(a).unwrap().cmd, Cmd::GetS);
        mshr.remove_front(a);
        assert_eq!(mshr.lookup_front(a).unwrap().cmd, Cmd::FetchInv);
    }

    #[test]
    fn capacity_excludes_pointers() {
        let mut mshr = Mshr::new(2);
        let a = Addr(0x100);
        let b = Addr(0x200);
        assert!(mshr.insert(a, ev(Cmd::GetS, a)));
        mshr.insert_pointer(a, b);
        assert!(mshr.insert(b, ev(Cmd::GetX, b)));
        assert!(mshr.is_full());
        assert!(!mshr.insert(b, ev(Cmd::GetS, b)));
        // front insertion is exempt from admission control
        mshr.insert_front(b, ev(Cmd::Inv, b));
        assert_eq!(mshr.lookup_front(b).unwrap().cmd, Cmd::Inv);
    }

    #[test]
    fn pointer_chains_to_waiter() {
        let mut mshr = Mshr::new(8);
        let victim = Addr(0x100);
        let waiter = Addr(0x200);
        mshr.insert_pointer(victim, waiter);
        match mshr.front_entry(victim) {
            Some(MshrEntry::Pointer(dst)) => assert_eq!(*dst, waiter),
            other => panic!("expected pointer, got {:?}", other.is_some()),
        }
        assert!(mshr.lookup_front(victim).is_none());
    }

    #[test]
    fn ack_counters_and_writeback_flag() {
        let mut mshr = Mshr::new(8);
        let a = Addr(0x140);
        assert_eq!(mshr.acks_needed(a), 0);
        mshr.increment_acks_needed(a);
        mshr.increment_acks_needed(a);
        mshr.decrement_acks_needed(a);
        assert_eq!(mshr.acks_needed(a), 1);

        mshr.insert_writeback(a);
        assert!(mshr.pending_writeback(a));
        mshr.remove_writeback(a);
        assert!(!mshr.pending_writeback(a));
        assert_eq!(mshr.acks_needed(a), 1);
    }

    #[test]
    fn data_buffer_round_trip() {
        let mut mshr = Mshr::new(8);
        let a = Addr(0x180);
        mshr.set_data_buffer(a, vec![0xaa; 4]);
        assert_eq!(mshr.data_buffer(a).unwrap(), &vec![0xaa; 4]);
        mshr.clear_data_buffer(a);
        assert!(mshr.data_buffer(a).is_none());
    }
}
