// MESI internal directory controller for a non-inclusive cache level with
// multiple upstream children. Routes incoming events to per-(command,
// state) handlers, tracks outstanding transactions in the MSHR, and
// serializes outgoing protocol messages onto two directional queues.
//
// Every stable or transient state is matched exhaustively; a (state, event)
// pair outside the protocol is a fatal violation and panics with context.

use std::collections::VecDeque;

use log::{debug, trace, warn};

use super::common::{Action, Addr, Cmd, Config, MemEvent, OutPacket, PeerId, Protocol, State};
use super::directory::CacheArray;
use super::mshr::{Mshr, MshrEntry};
use super::stats::Stats;
use crate::error::SimError;

pub struct DirController {
    name: PeerId,
    downstream: PeerId,
    cfg: Config,
    array: CacheArray,
    mshr: Mshr,
    stats: Stats,
    out_up: VecDeque<OutPacket>,
    out_down: VecDeque<OutPacket>,
    retry_q: VecDeque<Addr>,
    // set by the send shim within one dispatch; a stalled event that already
    // issued messages is parked in-progress and not blindly re-dispatched
    sent_flag: bool,
}

impl DirController {
    pub fn new(name: PeerId, downstream: PeerId, cfg: Config) -> Result<DirController, SimError> {
        cfg.validate()?;
        Ok(DirController {
            name,
            downstream,
            array: CacheArray::new(&cfg),
            mshr: Mshr::new(cfg.mshr_size),
            stats: Stats::default(),
            out_up: VecDeque::new(),
            out_down: VecDeque::new(),
            retry_q: VecDeque::new(),
            sent_flag: false,
            cfg,
        })
    }

    pub fn name(&self) -> PeerId {
        self.name
    }

    pub fn downstream(&self) -> PeerId {
        self.downstream
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn take_outgoing_up(&mut self) -> Vec<OutPacket> {
        self.out_up.drain(..).collect()
    }

    pub fn take_outgoing_down(&mut self) -> Vec<OutPacket> {
        self.out_down.drain(..).collect()
    }

    // Introspection for the harness, stats and tests.

    pub fn line_state(&self, addr: Addr) -> Option<State> {
        self.array.peek(addr).map(|i| self.array.entry(i).state())
    }

    pub fn sharers_of(&self, addr: Addr) -> Vec<PeerId> {
        self.array
            .peek(addr)
            .map(|i| self.array.entry(i).sharers().collect())
            .unwrap_or_default()
    }

    pub fn owner_of(&self, addr: Addr) -> Option<PeerId> {
        self.array.peek(addr).and_then(|i| self.array.entry(i).owner())
    }

    pub fn is_locally_cached(&self, addr: Addr) -> bool {
        self.array.peek(addr).map_or(false, |i| self.array.is_cached(i))
    }

    pub fn acks_pending(&self, addr: Addr) -> u32 {
        self.mshr.acks_needed(addr)
    }

    pub fn mshr_depth(&self, addr: Addr) -> usize {
        self.mshr.queue_len(addr)
    }

    pub fn mshr_outstanding(&self) -> usize {
        self.mshr.len()
    }

    pub fn writeback_pending(&self, addr: Addr) -> bool {
        self.mshr.pending_writeback(addr)
    }

    /// Check the directory-wide invariants. Used by the soak test after
    /// every step; returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        for entry in self.array.valid_entries() {
            if entry.owner().is_some() && entry.num_sharers() > 0 {
                return Err(format!("{}: owner and sharers both present", entry.base_addr));
            }
            if entry.in_transition() && !self.mshr.contains(entry.base_addr) {
                return Err(format!(
                    "{}: in transition ({}) with empty MSHR",
                    entry.base_addr,
                    entry.state()
                ));
            }
            if matches!(entry.state(), State::S | State::E | State::M)
                && entry.data_slot.is_none()
                && entry.num_sharers() == 0
                && entry.owner().is_none()
            {
                return Err(format!(
                    "{}: uncached {} line with no sharers or owner",
                    entry.base_addr,
                    entry.state()
                ));
            }
        }
        Ok(())
    }

    /// Classify an incoming request against the current line state without
    /// mutating anything. Used for hit/miss profiling.
    pub fn is_cache_hit(&self, ev: &MemEvent) -> bool {
        let idx = self.array.peek(ev.base_addr);
        let mut state = idx.map_or(State::I, |i| self.array.entry(i).state());
        let cmd = if ev.cmd == Cmd::GetSX { Cmd::GetX } else { ev.cmd };

        if state == State::I {
            return false;
        }
        if ev.prefetch && ev.rqstr == self.name {
            return true;
        }
        if state == State::S && self.cfg.last_level {
            state = State::M;
        }
        let entry = self.array.entry(idx.unwrap());
        match state {
            State::S => cmd == Cmd::GetS,
            State::E | State::M => {
                if entry.owner().is_some() {
                    return false;
                }
                if cmd == Cmd::GetS {
                    return true;
                }
                if cmd == Cmd::GetX {
                    return entry.num_sharers() == 0
                        || (entry.is_sharer(ev.src) && entry.num_sharers() == 1);
                }
                false
            }
            State::IS
            | State::IM
            | State::SM
            | State::S_Inv
            | State::E_Inv
            | State::M_Inv
            | State::SM_Inv
            | State::E_InvX
            | State::M_InvX => false,
            _ => true, // profiling only, don't die on transient states
        }
    }

    /*------------------------------------------------------------------
     * Event dispatch
     *----------------------------------------------------------------*/

    /// External entry point: route one incoming event, then replay any
    /// parked work that became eligible.
    pub fn handle_event(&mut self, ev: MemEvent, now: u64) -> Action {
        if matches!(ev.cmd, Cmd::GetS | Cmd::GetX | Cmd::GetSX) {
            if self.is_cache_hit(&ev) {
                self.stats.hits += 1;
            } else {
                self.stats.misses += 1;
            }
        }
        let action = self.dispatch(ev, now, false);
        self.drain_retries(now);
        action
    }

    fn dispatch(&mut self, ev: MemEvent, now: u64, replay: bool) -> Action {
        trace!("{}: dispatch {} for {} (replay={})", self.name, ev.cmd, ev.base_addr, replay);
        match ev.cmd {
            Cmd::GetS | Cmd::GetX | Cmd::GetSX => self.handle_request(ev, now, replay),
            Cmd::PutS | Cmd::PutE | Cmd::PutM => self.handle_replacement(ev, now, replay),
            Cmd::FlushLine | Cmd::FlushLineInv => self.handle_flush(ev, now, replay),
            Cmd::Inv | Cmd::Fetch | Cmd::FetchInv | Cmd::FetchInvX | Cmd::ForceInv => {
                self.handle_invalidation(ev, now, replay)
            }
            Cmd::GetSResp | Cmd::GetXResp | Cmd::FlushLineResp => {
                self.handle_cache_response(ev, now)
            }
            Cmd::FetchResp | Cmd::FetchXResp | Cmd::AckInv | Cmd::AckPut => {
                self.handle_fetch_response(ev, now)
            }
            Cmd::NACK => self.handle_nack(ev, now),
        }
    }

    /// Data requests: GetS, GetX, GetSX.
    fn handle_request(&mut self, ev: MemEvent, now: u64, replay: bool) -> Action {
        self.sent_flag = false;
        let addr = ev.base_addr;

        // admission control up front: a request we cannot park must not
        // touch the line state
        if !replay && self.mshr.is_full() {
            warn!("{}: MSHR full, NACKing {} for {}", self.name, ev.cmd, addr);
            self.send_nack(&ev, now);
            return Action::Stall;
        }

        if let Some(idx) = self.array.lookup(addr, !replay) {
            if self.array.entry(idx).in_transition() {
                self.park(addr, ev, replay, false, now);
                return Action::Stall;
            }
        }

        let idx = match self.array.peek(addr) {
            Some(idx) => idx,
            None => {
                if !self.allocate_line(addr, now) {
                    self.park(addr, ev, replay, false, now);
                    return Action::Stall;
                }
                self.array.peek(addr).expect("freshly allocated line")
            }
        };

        let action = match ev.cmd {
            Cmd::GetS => self.handle_gets(&ev, idx, now, replay),
            Cmd::GetX | Cmd::GetSX => self.handle_getx(&ev, idx, now, replay),
            _ => unreachable!(),
        };
        match action {
            Action::Stall => {
                let in_progress = self.sent_flag;
                self.park(addr, ev, replay, in_progress, now);
            }
            Action::Done => self.schedule_retry(addr),
            _ => {}
        }
        action
    }

    /// Replacements: PutS, PutE, PutM. The return value of the per-command
    /// handler reports on the *racing* transaction at the MSHR head; Put
    /// requests themselves always complete or are absorbed.
    fn handle_replacement(&mut self, ev: MemEvent, now: u64, replay: bool) -> Action {
        self.sent_flag = false;
        let addr = ev.base_addr;
        let idx = self.array.lookup(addr, false).unwrap_or_else(|| {
            panic!("{}: {} for untracked line {}", self.name, ev.cmd, addr)
        });

        // Writebacks need a local slot for their payload. Do not force the
        // issue for lines in transition (deadlock avoidance); the payload
        // lands in the MSHR buffer instead.
        if !self.array.is_cached(idx) {
            let in_trans = self.array.entry(idx).in_transition();
            if !self.allocate_dir_cache_line(addr, idx, in_trans, now) && !in_trans {
                self.park(addr, ev, replay, false, now);
                return Action::Stall;
            }
        }

        let req = self.mshr.lookup_front(addr).cloned();
        let action = match ev.cmd {
            Cmd::PutS => self.handle_puts(&ev, idx, req.as_ref(), now),
            Cmd::PutE | Cmd::PutM => self.handle_putm(&ev, idx, req.as_ref(), now),
            _ => unreachable!(),
        };
        if action == Action::Done {
            if req.is_some() {
                self.mshr.remove_front(addr);
            }
            self.schedule_retry(addr);
        }
        action
    }

    /// Flushes: FlushLine, FlushLineInv. When the handler resolves a racing
    /// head transaction (Done), the head is popped and the flush itself is
    /// re-dispatched against the settled line.
    fn handle_flush(&mut self, ev: MemEvent, now: u64, replay: bool) -> Action {
        self.sent_flag = false;
        let addr = ev.base_addr;

        if !replay && self.mshr.is_full() {
            warn!("{}: MSHR full, NACKing {} for {}", self.name, ev.cmd, addr);
            self.send_nack(&ev, now);
            return Action::Stall;
        }

        let idx = self.array.lookup(addr, false);
        let req = self.mshr.lookup_front(addr).cloned();

        let action = match ev.cmd {
            Cmd::FlushLine => self.handle_flush_line(&ev, idx, req.as_ref(), now, replay),
            Cmd::FlushLineInv => self.handle_flush_line_inv(&ev, idx, req.as_ref(), now, replay),
            _ => unreachable!(),
        };
        match action {
            Action::Done if req.is_some() => {
                self.mshr.remove_front(addr);
                self.schedule_retry(addr);
                return self.handle_flush(ev, now, replay);
            }
            Action::Stall | Action::Block => {
                let in_progress = self.sent_flag;
                self.park(addr, ev, replay, in_progress, now);
            }
            _ => {}
        }
        action
    }

    /// Invalidations from downstream: Inv, Fetch, FetchInv, FetchInvX,
    /// ForceInv. An invalidation racing with our own outstanding Put* to
    /// the same address stands in for the AckPut; both sides are dropped.
    fn handle_invalidation(&mut self, ev: MemEvent, now: u64, replay: bool) -> Action {
        self.sent_flag = false;
        let addr = ev.base_addr;

        if !self.mshr.pending_writeback(addr) && self.mshr.is_full() {
            self.park_inv(addr, ev, false);
            return Action::Stall;
        }

        if self.mshr.pending_writeback(addr) {
            debug!("{}: {} for {} absorbed as AckPut", self.name, ev.cmd, addr);
            let state = self.line_state(addr).unwrap_or(State::I);
            self.stats.record_state_event(ev.cmd, state);
            self.mshr.remove_writeback(addr);
            self.schedule_retry(addr);
            return Action::Done;
        }

        let idx = match self.array.lookup(addr, false) {
            Some(idx) => idx,
            None => {
                // already evicted; whatever we sent downstream serves as the ack
                debug!("{}: {} for untracked line {} dropped", self.name, ev.cmd, addr);
                self.stats.record_state_event(ev.cmd, State::I);
                return Action::Ignore;
            }
        };
        let collision = self.mshr.lookup_front(addr).cloned();

        let action = match ev.cmd {
            Cmd::Inv => self.handle_inv(&ev, idx, now, replay, collision.as_ref()),
            Cmd::Fetch => self.handle_fetch(&ev, idx, now, replay, collision.as_ref()),
            Cmd::FetchInv => self.handle_fetch_inv(&ev, idx, now, replay, collision.as_ref()),
            Cmd::FetchInvX => self.handle_fetch_inv_x(&ev, idx, now, replay, collision.as_ref()),
            Cmd::ForceInv => self.handle_force_inv(&ev, idx, now, replay, collision.as_ref()),
            _ => unreachable!(),
        };
        match action {
            Action::Stall => {
                let in_progress = self.sent_flag;
                self.park_inv(addr, ev, in_progress);
            }
            Action::Block => {
                self.mshr.insert_after_front(addr, ev);
            }
            Action::Done => self.schedule_retry(addr),
            _ => {}
        }
        action
    }

    /// Responses from downstream: GetSResp, GetXResp, FlushLineResp.
    fn handle_cache_response(&mut self, ev: MemEvent, now: u64) -> Action {
        let addr = ev.base_addr;
        let idx = self.array.lookup(addr, false);

        let action = match ev.cmd {
            Cmd::GetSResp | Cmd::GetXResp => {
                let idx = idx.unwrap_or_else(|| {
                    panic!("{}: {} for untracked line {}", self.name, ev.cmd, addr)
                });
                self.handle_data_response(&ev, idx, now)
            }
            Cmd::FlushLineResp => {
                let state = idx.map_or(State::I, |i| self.array.entry(i).state());
                self.stats.record_state_event(ev.cmd, state);
                let req = self
                    .mshr
                    .lookup_front(addr)
                    .cloned()
                    .unwrap_or_else(|| panic!("{}: FlushLineResp with no pending flush for {}", self.name, addr));
                self.send_flush_response(&req, ev.success, now);
                if let Some(i) = idx {
                    if state == State::S_B {
                        self.array.entry_mut(i).set_state(State::S);
                    } else {
                        self.array.entry_mut(i).set_state(State::I);
                    }
                }
                Action::Done
            }
            _ => unreachable!(),
        };
        if action == Action::Done {
            if self.mshr.lookup_front(addr).is_some() {
                self.mshr.remove_front(addr);
            }
            self.schedule_retry(addr);
        }
        action
    }

    /// Responses from upstream: FetchResp, FetchXResp, AckInv, AckPut.
    fn handle_fetch_response(&mut self, ev: MemEvent, now: u64) -> Action {
        let addr = ev.base_addr;
        let idx = self.array.lookup(addr, false);
        let req = self.mshr.lookup_front(addr).cloned();

        let action = match ev.cmd {
            Cmd::FetchResp | Cmd::FetchXResp => {
                let idx = idx.unwrap_or_else(|| {
                    panic!("{}: {} for untracked line {}", self.name, ev.cmd, addr)
                });
                self.handle_fetch_resp(&ev, idx, req.as_ref(), now)
            }
            Cmd::AckInv => {
                let idx = idx.unwrap_or_else(|| {
                    panic!("{}: AckInv for untracked line {}", self.name, addr)
                });
                self.handle_ack_inv(&ev, idx, req.as_ref(), now)
            }
            Cmd::AckPut => {
                self.stats.record_state_event(Cmd::AckPut, State::I);
                self.mshr.remove_writeback(addr);
                self.schedule_retry(addr);
                return Action::Done;
            }
            _ => unreachable!(),
        };
        if action == Action::Done {
            if req.is_some() {
                self.mshr.remove_front(addr);
            }
            self.schedule_retry(addr);
        }
        action
    }

    /// The interconnect bounced one of our messages: decide whether the
    /// preconditions for the original send still hold and resend, else drop.
    fn handle_nack(&mut self, mut ev: MemEvent, now: u64) -> Action {
        let nacked = *ev
            .nacked
            .take()
            .unwrap_or_else(|| panic!("{}: NACK without an original event", self.name));
        self.stats.nacks_received += 1;
        let addr = nacked.base_addr;
        let idx = self.array.lookup(addr, false);
        let state = idx.map_or(State::I, |i| self.array.entry(i).state());

        let resend = match nacked.cmd {
            Cmd::GetS | Cmd::GetX | Cmd::GetSX => true,
            Cmd::PutS | Cmd::PutE | Cmd::PutM => {
                !(self.cfg.expect_writeback_ack && !self.mshr.pending_writeback(addr))
            }
            Cmd::FetchInvX => {
                state != State::I
                    && idx.map_or(false, |i| self.array.entry(i).owner() == Some(nacked.dst))
            }
            Cmd::FetchInv => {
                state != State::I
                    && idx.map_or(false, |i| {
                        let e = self.array.entry(i);
                        e.owner() == Some(nacked.dst) || e.is_sharer(nacked.dst)
                    })
            }
            Cmd::Fetch | Cmd::Inv => {
                state != State::I && idx.map_or(false, |i| self.array.entry(i).is_sharer(nacked.dst))
            }
            other => panic!("{}: NACK received for unrecognized event {} at {}", self.name, other, addr),
        };

        if resend {
            self.stats.nacks_resent += 1;
            debug!("{}: resending NACKed {} for {}", self.name, nacked.cmd, addr);
            self.resend_event(nacked, now);
        } else {
            debug!("{}: dropping stale NACKed {} for {}", self.name, nacked.cmd, addr);
        }
        Action::Done
    }

    /*------------------------------------------------------------------
     * Parking and replay
     *----------------------------------------------------------------*/

    fn park(&mut self, addr: Addr, mut ev: MemEvent, replay: bool, in_progress: bool, now: u64) {
        ev.in_progress = in_progress;
        if replay {
            self.mshr.insert_front(addr, ev);
        } else if !self.mshr.insert(addr, ev.clone()) {
            // admission control: bounce the request, the sender retries
            warn!("{}: MSHR full, NACKing {} for {}", self.name, ev.cmd, addr);
            self.send_nack(&ev, now);
        }
    }

    fn park_inv(&mut self, addr: Addr, mut ev: MemEvent, in_progress: bool) {
        ev.in_progress = in_progress;
        self.mshr.insert_front(addr, ev);
    }

    fn schedule_retry(&mut self, addr: Addr) {
        if !self.retry_q.contains(&addr) {
            self.retry_q.push_back(addr);
        }
    }

    /// Replay parked events whose address made progress. A head that has
    /// already issued its messages (in-progress) is waiting for a response
    /// and is left alone; a pointer hands the retry to the replacement
    /// waiter it chains to.
    fn drain_retries(&mut self, now: u64) {
        let mut budget = 10_000u32;
        while let Some(addr) = self.retry_q.pop_front() {
            budget -= 1;
            if budget == 0 {
                panic!("{}: no forward progress replaying MSHR events", self.name);
            }
            match self.mshr.front_entry(addr) {
                None => continue,
                Some(MshrEntry::Pointer(_)) => {
                    let dst = match self.mshr.remove_front(addr) {
                        Some(MshrEntry::Pointer(d)) => d,
                        _ => unreachable!(),
                    };
                    self.schedule_retry(addr);
                    let waiter = match self.mshr.front_entry(dst) {
                        Some(MshrEntry::Event(ev)) if !ev.in_progress => {
                            match self.mshr.remove_front(dst) {
                                Some(MshrEntry::Event(ev)) => Some(ev),
                                _ => unreachable!(),
                            }
                        }
                        _ => None,
                    };
                    if let Some(ev) = waiter {
                        self.dispatch(ev, now, true);
                    }
                }
                Some(MshrEntry::Event(ev)) => {
                    if ev.in_progress {
                        continue;
                    }
                    let ev = match self.mshr.remove_front(addr) {
                        Some(MshrEntry::Event(ev)) => ev,
                        _ => unreachable!(),
                    };
                    self.dispatch(ev, now, true);
                }
            }
        }
    }

    /*------------------------------------------------------------------
     * Allocation and eviction
     *----------------------------------------------------------------*/

    /// Make room for a new directory entry tracking `addr`. Returns false
    /// when the victim needs a multi-step eviction; a pointer entry chains
    /// the waiter for replay once the victim settles.
    fn allocate_line(&mut self, addr: Addr, now: u64) -> bool {
        let victim = self.array.find_replacement_candidate(addr);
        if self.array.entry(victim).valid {
            let vaddr = self.array.entry(victim).base_addr;
            if self.array.entry(victim).in_transition() {
                self.mshr.insert_pointer(vaddr, addr);
                return false;
            }
            debug!("{}: evicting {} for {}", self.name, vaddr, addr);
            if self.handle_eviction(victim, self.name, false, now) == Action::Stall {
                self.mshr.insert_pointer(vaddr, addr);
                return false;
            }
        }
        self.array.replace(addr, victim);
        true
    }

    /// Attach a local data slot to the directory entry `idx`, evicting the
    /// slot's current holder from the data cache only (lazy deallocation).
    /// With `no_stall`, give up instead of chaining a waiter.
    fn allocate_dir_cache_line(&mut self, addr: Addr, idx: usize, no_stall: bool, now: u64) -> bool {
        let slot = self.array.find_data_victim(addr);
        match self.array.dir_entry_of_slot(slot) {
            None => {
                self.array.attach_slot(idx, slot);
                true
            }
            Some(victim) if victim == idx => true,
            Some(victim) => {
                if self.array.entry(victim).in_transition() {
                    if !no_stall {
                        let vaddr = self.array.entry(victim).base_addr;
                        self.mshr.insert_pointer(vaddr, addr);
                    }
                    return false;
                }
                self.handle_eviction(victim, self.name, true, now);
                self.array.detach_slot(victim);
                self.array.attach_slot(idx, slot);
                true
            }
        }
    }

    /// Evict a block from the directory (`from_data_cache == false`) or
    /// from the local data cache only (`from_data_cache == true`). Returns
    /// Done when the eviction completed synchronously, Stall when the entry
    /// must wait for acks.
    pub fn handle_eviction(
        &mut self,
        idx: usize,
        rqstr: PeerId,
        from_data_cache: bool,
        now: u64,
    ) -> Action {
        let state = self.array.entry(idx).state();
        self.stats.record_eviction(state);
        let wb_addr = self.array.entry(idx).base_addr;
        let is_cached = self.array.is_cached(idx);

        // A stalled replacement to the victim must be resolved first: apply
        // its payload and dirty bit now, or the eviction and the waiting
        // Put deadlock against each other.
        let mut collision = false;
        let front_is_put = self
            .mshr
            .lookup_front(wb_addr)
            .map_or(false, |f| f.cmd.is_writeback());
        if front_is_put {
            let put = match self.mshr.remove_front(wb_addr) {
                Some(MshrEntry::Event(ev)) => ev,
                _ => unreachable!(),
            };
            collision = true;
            if state == State::E && put.dirty {
                self.array.entry_mut(idx).set_state(State::M);
            }
            let entry = self.array.entry_mut(idx);
            if entry.is_sharer(put.src) {
                entry.remove_sharer(put.src);
            } else if entry.owner().is_some() {
                entry.clear_owner();
            }
            self.mshr.set_data_buffer(wb_addr, put.payload);
        }

        let state = self.array.entry(idx).state();
        match state {
            State::I => Action::Done,
            State::S => {
                if self.array.entry(idx).prefetch {
                    self.array.entry_mut(idx).prefetch = false;
                    self.stats.prefetch_evict += 1;
                }
                if self.array.entry(idx).num_sharers() > 0 && !from_data_cache {
                    if is_cached || collision {
                        self.invalidate_all_sharers(idx, self.name, false, now);
                    } else {
                        self.invalidate_all_sharers_and_fetch(idx, self.name, false, now);
                    }
                    self.array.entry_mut(idx).set_state(State::SI);
                    return Action::Stall;
                }
                if !is_cached && !collision {
                    panic!(
                        "{}: evicting uncached block with no sharers, addr {} state {}",
                        self.name, wb_addr, state
                    );
                }
                if from_data_cache && self.array.entry(idx).num_sharers() > 0 {
                    return Action::Done; // lazy deallocation, data lives upstream
                }
                if is_cached {
                    self.send_writeback_from_cache(Cmd::PutS, idx, rqstr, now);
                } else {
                    let data = self.mshr.data_buffer(wb_addr).cloned().unwrap_or_default();
                    self.send_writeback_from_mshr(Cmd::PutS, idx, rqstr, data, now);
                }
                if self.array.entry(idx).num_sharers() == 0 {
                    self.array.entry_mut(idx).set_state(State::I);
                }
                if self.cfg.expect_writeback_ack {
                    self.mshr.insert_writeback(wb_addr);
                }
                Action::Done
            }
            State::E | State::M => {
                if self.array.entry(idx).prefetch {
                    self.array.entry_mut(idx).prefetch = false;
                    self.stats.prefetch_evict += 1;
                }
                let next = if state == State::E { State::EI } else { State::MI };
                if self.array.entry(idx).num_sharers() > 0 && !from_data_cache {
                    if is_cached || collision {
                        self.invalidate_all_sharers(idx, self.name, false, now);
                    } else {
                        self.invalidate_all_sharers_and_fetch(idx, self.name, false, now);
                    }
                    self.array.entry_mut(idx).set_state(next);
                    return Action::Stall;
                }
                if self.array.entry(idx).owner().is_some() && !from_data_cache {
                    self.send_fetch_inv(idx, self.name, false, now);
                    self.mshr.increment_acks_needed(wb_addr);
                    self.array.entry_mut(idx).set_state(next);
                    return Action::Stall;
                }
                if !is_cached && !collision {
                    panic!(
                        "{}: evicting uncached block with no sharers or owner, addr {} state {}",
                        self.name, wb_addr, state
                    );
                }
                let entry = self.array.entry(idx);
                if from_data_cache && (entry.num_sharers() > 0 || entry.owner().is_some()) {
                    return Action::Done; // lazy deallocation
                }
                let cmd = if state == State::E { Cmd::PutE } else { Cmd::PutM };
                if is_cached {
                    self.send_writeback_from_cache(cmd, idx, rqstr, now);
                } else {
                    let data = self.mshr.data_buffer(wb_addr).cloned().unwrap_or_default();
                    self.send_writeback_from_mshr(cmd, idx, rqstr, data, now);
                }
                let entry = self.array.entry_mut(idx);
                if entry.num_sharers() == 0 && entry.owner().is_none() {
                    entry.set_state(State::I);
                }
                if self.cfg.expect_writeback_ack {
                    self.mshr.insert_writeback(wb_addr);
                }
                Action::Done
            }
            // already evicting or mid-transition: wait
            _ => Action::Stall,
        }
    }

    /*------------------------------------------------------------------
     * Request handlers
     *----------------------------------------------------------------*/

    fn handle_gets(&mut self, ev: &MemEvent, idx: usize, now: u64, replay: bool) -> Action {
        let addr = ev.base_addr;
        let state = self.array.entry(idx).state();
        let local_prefetch = ev.prefetch && ev.rqstr == self.name;

        // prefetches fill the local data cache, so they need a slot up front
        if local_prefetch && !self.array.is_cached(idx) && state == State::I {
            if !self.allocate_dir_cache_line(addr, idx, false, now) {
                return Action::Stall;
            }
        }

        self.stats.record_state_event(ev.cmd, state);
        let is_cached = self.array.is_cached(idx);
        match state {
            State::I => {
                self.forward_message(ev, idx, self.cfg.line_size, None, now, replay);
                self.array.entry_mut(idx).set_state(State::IS);
                Action::Stall
            }
            State::S => {
                if local_prefetch {
                    self.stats.prefetch_redundant += 1;
                    return Action::Done;
                }
                if self.array.entry(idx).prefetch {
                    self.array.entry_mut(idx).prefetch = false;
                    self.stats.prefetch_hit += 1;
                }
                if is_cached {
                    self.array.entry_mut(idx).add_sharer(ev.src);
                    self.array.touch_slot(idx);
                    let data = self.array.slot_data(idx).cloned();
                    self.send_response_up(ev, None, data, replay, idx, now);
                    return Action::Done;
                }
                self.send_fetch(idx, ev.rqstr, replay, now);
                self.mshr.increment_acks_needed(addr);
                self.array.entry_mut(idx).set_state(State::S_D);
                Action::Stall
            }
            State::E | State::M => {
                if local_prefetch {
                    self.stats.prefetch_redundant += 1;
                    return Action::Done;
                }
                if self.array.entry(idx).prefetch {
                    self.array.entry_mut(idx).prefetch = false;
                    self.stats.prefetch_hit += 1;
                }
                if self.array.entry(idx).owner().is_some() {
                    self.send_fetch_inv_x(idx, ev.rqstr, replay, now);
                    self.mshr.increment_acks_needed(addr);
                    self.array.entry_mut(idx).set_state(if state == State::E {
                        State::E_InvX
                    } else {
                        State::M_InvX
                    });
                    return Action::Stall;
                }
                if is_cached {
                    if self.cfg.protocol == Protocol::MESI && self.array.entry(idx).num_sharers() == 0
                    {
                        let data = self.array.slot_data(idx).cloned();
                        self.send_response_up(ev, Some(Cmd::GetXResp), data, replay, idx, now);
                        self.array.entry_mut(idx).set_owner(ev.src);
                    } else {
                        let data = self.array.slot_data(idx).cloned();
                        self.send_response_up(ev, None, data, replay, idx, now);
                        self.array.entry_mut(idx).add_sharer(ev.src);
                    }
                    return Action::Done;
                }
                self.send_fetch(idx, ev.rqstr, replay, now);
                self.mshr.increment_acks_needed(addr);
                self.array.entry_mut(idx).set_state(if state == State::E {
                    State::E_D
                } else {
                    State::M_D
                });
                Action::Stall
            }
            _ => panic!(
                "{}: GetS in invalid state {} for {} from {}",
                self.name, state, addr, ev.src
            ),
        }
    }

    fn handle_getx(&mut self, ev: &MemEvent, idx: usize, now: u64, replay: bool) -> Action {
        let addr = ev.base_addr;
        let mut state = self.array.entry(idx).state();
        if state != State::SM {
            self.stats.record_state_event(ev.cmd, state);
        }
        let is_cached = self.array.is_cached(idx);

        // last coherence level: upgrade locally without forwarding
        if state == State::S && self.cfg.last_level {
            self.array.entry_mut(idx).set_state(State::M);
            state = State::M;
        }

        match state {
            State::I => {
                self.forward_message(ev, idx, self.cfg.line_size, Some(ev.payload.clone()), now, replay);
                self.array.entry_mut(idx).set_state(State::IM);
                Action::Stall
            }
            State::S => {
                if self.array.entry(idx).prefetch {
                    self.array.entry_mut(idx).prefetch = false;
                    self.stats.prefetch_upgrade_miss += 1;
                }
                let send_time =
                    self.forward_message(ev, idx, self.cfg.line_size, Some(ev.payload.clone()), now, replay);
                if self.invalidate_sharers_except_requestor(idx, ev.src, ev.rqstr, replay, false, now) {
                    self.array.entry_mut(idx).set_state(State::SM_Inv);
                } else {
                    self.array.entry_mut(idx).set_state(State::SM);
                    self.array.entry_mut(idx).timestamp = send_time;
                }
                Action::Stall
            }
            State::E | State::M => {
                // explicit E -> M promotion, shared M path below
                if state == State::E {
                    self.array.entry_mut(idx).set_state(State::M);
                }
                if self.array.entry(idx).prefetch {
                    self.array.entry_mut(idx).prefetch = false;
                    self.stats.prefetch_hit += 1;
                }
                if self.invalidate_sharers_except_requestor(idx, ev.src, ev.rqstr, replay, !is_cached, now)
                {
                    self.array.entry_mut(idx).set_state(State::M_Inv);
                    return Action::Stall;
                }
                if self.array.entry(idx).owner().is_some() {
                    self.send_fetch_inv(idx, ev.rqstr, replay, now);
                    self.mshr.increment_acks_needed(addr);
                    self.array.entry_mut(idx).set_state(State::M_Inv);
                    return Action::Stall;
                }
                let entry = self.array.entry_mut(idx);
                if entry.is_sharer(ev.src) {
                    entry.remove_sharer(ev.src);
                }
                entry.set_owner(ev.src);
                let data = if is_cached { self.array.slot_data(idx).cloned() } else { None };
                self.send_response_up(ev, None, data, replay, idx, now);
                Action::Done
            }
            // our own upgrade is still in flight; request arrived too early
            State::SM => Action::Stall,
            _ => panic!(
                "{}: {} in invalid state {} for {} from {}",
                self.name, ev.cmd, state, addr, ev.src
            ),
        }
    }

    /*------------------------------------------------------------------
     * Replacement handlers
     *----------------------------------------------------------------*/

    /// PutS from a sharer. `req` is the racing transaction at the MSHR
    /// head, if any; the return value reports on that transaction.
    fn handle_puts(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        req: Option<&MemEvent>,
        now: u64,
    ) -> Action {
        let addr = ev.base_addr;
        let state = self.array.entry(idx).state();
        self.stats.record_state_event(ev.cmd, state);

        // A Put from the sharer we are fetching from carries the data we
        // were waiting for.
        if matches!(state, State::S_D | State::E_D | State::SM_D | State::M_D) {
            if self.array.entry(idx).first_sharer() == Some(ev.src) {
                self.mshr.decrement_acks_needed(addr);
            }
        } else if self.mshr.acks_needed(addr) > 0 {
            self.mshr.decrement_acks_needed(addr);
        }

        if self.array.entry(idx).is_sharer(ev.src) {
            self.array.entry_mut(idx).remove_sharer(ev.src);
        }
        if self.array.is_cached(idx) {
            self.array.set_slot_data(idx, &ev.payload);
        } else if self.mshr.contains(addr) {
            self.mshr.set_data_buffer(addr, ev.payload.clone());
        }

        if self.mshr.acks_needed(addr) > 0 {
            return Action::Ignore; // absorbed, more acks outstanding
        }

        match state {
            State::I | State::S | State::E | State::M | State::S_B => {
                self.send_writeback_ack(ev, now);
                // an unrelated head (e.g. a forwarded flush) stays put
                if req.is_some() {
                    Action::Ignore
                } else {
                    Action::Done
                }
            }
            State::SI | State::EI | State::MI => {
                let cmd = match state {
                    State::SI => Cmd::PutS,
                    State::EI => Cmd::PutE,
                    _ => Cmd::PutM,
                };
                let rqstr = req.map_or(self.name, |r| r.rqstr);
                self.send_writeback_from_mshr(cmd, idx, rqstr, ev.payload.clone(), now);
                if self.cfg.expect_writeback_ack {
                    self.mshr.insert_writeback(addr);
                }
                self.array.entry_mut(idx).set_state(State::I);
                Action::Done
            }
            State::S_Inv => {
                let req = self.expect_req(req, ev, state);
                match req.cmd {
                    Cmd::Inv | Cmd::ForceInv => {
                        self.send_ack_inv(&req, now);
                        self.array.entry_mut(idx).set_state(State::I);
                        Action::Done
                    }
                    Cmd::FlushLineInv => {
                        self.array.entry_mut(idx).set_state(State::S);
                        self.resume_flush(&req, idx, now)
                    }
                    _ => {
                        self.send_response_down_from_mshr(ev, false, now);
                        self.array.entry_mut(idx).set_state(State::I);
                        Action::Done
                    }
                }
            }
            State::SB_Inv => {
                let req = self.expect_req(req, ev, state);
                self.send_ack_inv(&req, now);
                self.array.entry_mut(idx).set_state(State::I_B);
                Action::Done
            }
            State::S_D | State::E_D | State::M_D => {
                // Put raced with our Fetch to the same sharer
                let settled = state.settled();
                self.array.entry_mut(idx).set_state(settled);
                let req = self.expect_req(req, ev, state);
                let wb_cmd = match state {
                    State::S_D => Cmd::PutS,
                    State::E_D => Cmd::PutE,
                    _ => Cmd::PutM,
                };
                match req.cmd {
                    Cmd::Fetch => {
                        if !self.array.is_cached(idx) && self.array.entry(idx).num_sharers() == 0 {
                            self.send_writeback_from_mshr(wb_cmd, idx, req.rqstr, ev.payload.clone(), now);
                            self.array.entry_mut(idx).set_state(State::I);
                        } else {
                            self.send_response_down_from_mshr(ev, false, now);
                        }
                    }
                    Cmd::GetS => {
                        if state != State::S_D && self.array.entry(idx).num_sharers() == 0 {
                            self.send_response_up(&req, Some(Cmd::GetXResp), Some(ev.payload.clone()), true, idx, now);
                            self.array.entry_mut(idx).set_owner(req.src);
                        } else {
                            self.array.entry_mut(idx).add_sharer(req.src);
                            self.send_response_up(&req, None, Some(ev.payload.clone()), true, idx, now);
                        }
                    }
                    other => panic!(
                        "{}: PutS in {} but stalled request is {} for {}",
                        self.name, state, other, addr
                    ),
                }
                Action::Done
            }
            State::SM_D => {
                let req = self.expect_req(req, ev, state);
                if req.cmd == Cmd::Fetch {
                    self.send_response_down_from_mshr(ev, false, now);
                    self.array.entry_mut(idx).set_state(State::SM);
                }
                Action::Done
            }
            State::E_Inv | State::M_Inv => {
                let req = self.expect_req(req, ev, state);
                match req.cmd {
                    Cmd::FetchInv => {
                        let dirty = state == State::M_Inv || ev.dirty;
                        self.send_response_down(&req, idx, ev.payload.clone(), dirty, true, now);
                        self.array.entry_mut(idx).set_state(State::I);
                        Action::Done
                    }
                    Cmd::Inv | Cmd::ForceInv => {
                        self.send_ack_inv(&req, now);
                        self.array.entry_mut(idx).set_state(State::I);
                        Action::Done
                    }
                    Cmd::GetX | Cmd::GetSX => {
                        let entry = self.array.entry_mut(idx);
                        if entry.is_sharer(req.src) {
                            entry.remove_sharer(req.src);
                        }
                        entry.set_owner(req.src);
                        self.send_response_up(&req, None, Some(ev.payload.clone()), true, idx, now);
                        self.array.entry_mut(idx).set_state(State::M);
                        Action::Done
                    }
                    Cmd::FlushLineInv => {
                        let settled = if state == State::M_Inv { State::M } else { State::E };
                        self.array.entry_mut(idx).set_state(settled);
                        self.resume_flush(&req, idx, now)
                    }
                    other => panic!(
                        "{}: PutS in {} but stalled request is {} for {}",
                        self.name, state, other, addr
                    ),
                }
            }
            State::E_InvX => {
                self.array.entry_mut(idx).set_state(State::S);
                let req = self.expect_req(req, ev, state);
                if req.cmd == Cmd::FetchInvX {
                    if !self.array.is_cached(idx) && self.array.entry(idx).num_sharers() == 0 {
                        self.send_writeback_from_mshr(Cmd::PutE, idx, req.rqstr, ev.payload.clone(), now);
                        self.array.entry_mut(idx).set_state(State::I);
                    } else {
                        self.send_response_down_from_mshr(ev, false, now);
                    }
                    Action::Done
                } else {
                    panic!(
                        "{}: PutS in {} but stalled request is {} for {}",
                        self.name, state, req.cmd, addr
                    );
                }
            }
            State::SM_Inv => {
                let req = self.expect_req(req, ev, state);
                match req.cmd {
                    Cmd::Inv => {
                        if self.array.entry(idx).num_sharers() > 0 {
                            self.invalidate_all_sharers(idx, ev.rqstr, true, now);
                            return Action::Ignore;
                        }
                        self.send_ack_inv(&req, now);
                        self.array.entry_mut(idx).set_state(State::IM);
                        Action::Done
                    }
                    Cmd::FetchInv => {
                        if self.array.entry(idx).num_sharers() > 0 {
                            self.invalidate_all_sharers(idx, ev.rqstr, true, now);
                            return Action::Ignore;
                        }
                        self.send_response_down_from_mshr(ev, false, now);
                        self.array.entry_mut(idx).set_state(State::IM);
                        Action::Done
                    }
                    // still waiting on the upgrade data
                    _ => {
                        self.array.entry_mut(idx).set_state(State::SM);
                        Action::Ignore
                    }
                }
            }
            _ => panic!(
                "{}: PutS in unhandled state {} for {} from {}",
                self.name, state, addr, ev.src
            ),
        }
    }

    /// PutE or PutM from the owner. Dirty PutE payloads promote E-family
    /// states to their M counterpart before the shared writeback path.
    fn handle_putm(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        req: Option<&MemEvent>,
        now: u64,
    ) -> Action {
        let addr = ev.base_addr;
        let state = self.array.entry(idx).state();
        self.stats.record_state_event(ev.cmd, state);

        let is_cached = self.array.is_cached(idx);
        if is_cached {
            self.array.set_slot_data(idx, &ev.payload);
        } else if self.mshr.contains(addr) {
            self.mshr.set_data_buffer(addr, ev.payload.clone());
        }
        if self.mshr.acks_needed(addr) > 0 {
            self.mshr.decrement_acks_needed(addr);
        }

        match state {
            State::E | State::M => {
                let settled = if state == State::E && ev.dirty {
                    State::M
                } else {
                    state
                };
                self.array.entry_mut(idx).set_state(settled);
                self.array.entry_mut(idx).clear_owner();
                self.send_writeback_ack(ev, now);
                if !is_cached {
                    let cmd = if settled == State::E { Cmd::PutE } else { Cmd::PutM };
                    self.send_writeback_from_mshr(cmd, idx, ev.rqstr, ev.payload.clone(), now);
                    if self.cfg.expect_writeback_ack {
                        self.mshr.insert_writeback(addr);
                    }
                    self.array.entry_mut(idx).set_state(State::I);
                }
                if req.is_some() {
                    Action::Ignore
                } else {
                    Action::Done
                }
            }
            State::EI | State::MI => {
                // evicting this block anyway; fold the Put into the writeback
                let folded = if state == State::EI && ev.dirty {
                    State::MI
                } else {
                    state
                };
                self.array.entry_mut(idx).clear_owner();
                let cmd = if folded == State::EI { Cmd::PutE } else { Cmd::PutM };
                self.send_writeback_from_mshr(cmd, idx, self.name, ev.payload.clone(), now);
                if self.cfg.expect_writeback_ack {
                    self.mshr.insert_writeback(addr);
                }
                self.array.entry_mut(idx).set_state(State::I);
                Action::Done
            }
            State::E_InvX | State::M_InvX => {
                self.array.entry_mut(idx).clear_owner();
                let req = self.expect_req(req, ev, state);
                match req.cmd {
                    Cmd::FetchInvX => {
                        if !is_cached {
                            let cmd = if state == State::M_InvX || ev.dirty {
                                Cmd::PutM
                            } else {
                                Cmd::PutE
                            };
                            self.send_writeback_from_mshr(cmd, idx, ev.rqstr, ev.payload.clone(), now);
                            if self.cfg.expect_writeback_ack {
                                self.mshr.insert_writeback(addr);
                            }
                            self.array.entry_mut(idx).set_state(State::I);
                        } else {
                            let dirty = state == State::M_InvX || ev.cmd == Cmd::PutM;
                            self.send_response_down_from_mshr(ev, dirty, now);
                            self.array.entry_mut(idx).set_state(State::S);
                        }
                        Action::Done
                    }
                    Cmd::FlushLine => {
                        let settled = if state == State::M_InvX || ev.dirty {
                            State::M
                        } else {
                            State::E
                        };
                        self.array.entry_mut(idx).set_state(settled);
                        self.resume_flush(&req, idx, now)
                    }
                    Cmd::GetS => {
                        if self.cfg.protocol == Protocol::MESI {
                            self.send_response_up(&req, Some(Cmd::GetXResp), Some(ev.payload.clone()), true, idx, now);
                            self.array.entry_mut(idx).set_owner(req.src);
                        } else {
                            self.send_response_up(&req, None, Some(ev.payload.clone()), true, idx, now);
                            self.array.entry_mut(idx).add_sharer(req.src);
                        }
                        let settled = if state == State::M_InvX || ev.dirty {
                            State::M
                        } else {
                            State::E
                        };
                        self.array.entry_mut(idx).set_state(settled);
                        Action::Done
                    }
                    other => panic!(
                        "{}: {} in {} but stalled request is {} for {}",
                        self.name, ev.cmd, state, other, addr
                    ),
                }
            }
            State::E_Inv | State::M_Inv => {
                let folded = if state == State::E_Inv && ev.cmd == Cmd::PutM {
                    self.array.entry_mut(idx).set_state(State::M_Inv);
                    State::M_Inv
                } else {
                    state
                };
                self.array.entry_mut(idx).clear_owner();
                let req = self.expect_req(req, ev, state);
                match req.cmd {
                    Cmd::GetX | Cmd::GetSX => {
                        self.array.entry_mut(idx).set_state(State::M);
                        self.send_response_up(&req, None, Some(ev.payload.clone()), true, idx, now);
                        let entry = self.array.entry_mut(idx);
                        if entry.is_sharer(req.src) {
                            entry.remove_sharer(req.src);
                        }
                        entry.set_owner(req.src);
                        Action::Done
                    }
                    Cmd::ForceInv => {
                        self.send_ack_inv(&req, now);
                        self.array.entry_mut(idx).set_state(State::I);
                        Action::Done
                    }
                    Cmd::FlushLineInv => {
                        let settled = if folded == State::M_Inv { State::M } else { State::E };
                        self.array.entry_mut(idx).set_state(settled);
                        self.resume_flush(&req, idx, now)
                    }
                    _ => {
                        // FetchInv (or Fetch) racing with the owner's writeback
                        self.send_response_down_from_mshr(ev, folded == State::M_Inv, now);
                        self.array.entry_mut(idx).set_state(State::I);
                        Action::Done
                    }
                }
            }
            _ => panic!(
                "{}: {} in unhandled state {} for {} from {}",
                self.name, ev.cmd, state, addr, ev.src
            ),
        }
    }

    fn expect_req(&self, req: Option<&MemEvent>, ev: &MemEvent, state: State) -> MemEvent {
        req.cloned().unwrap_or_else(|| {
            panic!(
                "{}: {} in {} for {} with no stalled request",
                self.name, ev.cmd, state, ev.base_addr
            )
        })
    }

    /// Re-run a parked flush after its racing transaction settled. The
    /// flush stays at the MSHR head; Ignore tells the caller not to pop it.
    /// Once forwarded, the parked copy is marked in-progress so replay
    /// passes leave it waiting for its FlushLineResp.
    fn resume_flush(&mut self, req: &MemEvent, idx: usize, now: u64) -> Action {
        let action = match req.cmd {
            Cmd::FlushLine => self.handle_flush_line(req, Some(idx), None, now, true),
            Cmd::FlushLineInv => self.handle_flush_line_inv(req, Some(idx), None, now, true),
            _ => unreachable!(),
        };
        match action {
            Action::Stall | Action::Block => {
                if let Some(front) = self.mshr.front_mut(req.base_addr) {
                    front.in_progress = true;
                }
                Action::Ignore
            }
            other => other,
        }
    }
}

/*----------------------------------------------------------------------
 * Flush handlers
 *--------------------------------------------------------------------*/

impl DirController {
    /// FlushLine: push the line toward lower memory, preserving sharers.
    /// When the handler resolves the racing head instead, the return value
    /// reports on that head (see `handle_flush`).
    fn handle_flush_line(
        &mut self,
        ev: &MemEvent,
        idx: Option<usize>,
        req: Option<&MemEvent>,
        now: u64,
        replay: bool,
    ) -> Action {
        let addr = ev.base_addr;
        let state = idx.map_or(State::I, |i| self.array.entry(i).state());
        if !replay {
            self.stats.record_state_event(ev.cmd, state);
        }

        let is_cached = idx.map_or(false, |i| self.array.is_cached(i));
        if !ev.payload.is_empty() {
            if let Some(i) = idx {
                if is_cached {
                    self.array.set_slot_data(i, &ev.payload);
                } else if self.mshr.contains(addr) {
                    self.mshr.set_data_buffer(addr, ev.payload.clone());
                }
            }
        }

        // Resolve the flush against the local state; None falls through to
        // the forward path at the bottom.
        let resolved: Option<Action> = match state {
            State::I | State::S | State::I_B | State::S_B => {
                if req.is_some() {
                    Some(Action::Stall)
                } else {
                    None
                }
            }
            State::E | State::M => {
                let i = idx.expect("E/M line must exist");
                if self.array.entry(i).owner() == Some(ev.src) {
                    let entry = self.array.entry_mut(i);
                    entry.clear_owner();
                    entry.add_sharer(ev.src);
                    if ev.dirty {
                        entry.set_state(State::M);
                    }
                }
                if self.array.entry(i).owner().is_some() {
                    // flush by a non-owner: downgrade the owner first
                    self.send_fetch_inv_x(i, ev.rqstr, replay, now);
                    self.mshr.increment_acks_needed(addr);
                    self.array.entry_mut(i).set_state(if state == State::E {
                        State::E_InvX
                    } else {
                        State::M_InvX
                    });
                    Some(Action::Stall)
                } else {
                    None
                }
            }
            // wait for the in-flight request / fetch / invalidation to finish
            State::IM | State::IS | State::SM => Some(Action::Stall),
            State::SM_D | State::S_D | State::E_D | State::M_D => Some(Action::Stall),
            State::S_Inv | State::SI | State::SM_Inv => Some(Action::Stall),
            State::MI | State::EI | State::M_Inv | State::E_Inv => {
                let i = idx.expect("line must exist");
                if self.array.entry(i).owner() == Some(ev.src) {
                    let entry = self.array.entry_mut(i);
                    entry.clear_owner();
                    entry.add_sharer(ev.src); // flusher will treat FetchInv as Inv
                }
                if ev.dirty {
                    if state == State::EI {
                        self.array.entry_mut(i).set_state(State::MI);
                    } else if state == State::E_Inv {
                        self.array.entry_mut(i).set_state(State::M_Inv);
                    }
                }
                Some(Action::Stall)
            }
            State::M_InvX | State::E_InvX => {
                let i = idx.expect("line must exist");
                let mut st = state;
                if self.array.entry(i).owner() == Some(ev.src) {
                    let entry = self.array.entry_mut(i);
                    entry.clear_owner();
                    entry.add_sharer(ev.src);
                    self.mshr.decrement_acks_needed(addr);
                    if ev.dirty {
                        self.array.entry_mut(i).set_state(State::M_InvX);
                        st = State::M_InvX;
                    }
                }
                if self.mshr.acks_needed(addr) == 0 {
                    let req = self.expect_req(req, ev, state);
                    match req.cmd {
                        Cmd::FetchInvX => {
                            self.send_response_down_from_mshr(ev, st == State::M_InvX, now);
                            self.array.entry_mut(i).set_state(State::S);
                            Some(Action::Done)
                        }
                        Cmd::FlushLine => {
                            self.array.entry_mut(i).set_state(st.settled());
                            self.resume_flush(&req, i, now);
                            Some(Action::Stall)
                        }
                        Cmd::FetchInv => {
                            self.array.entry_mut(i).set_state(st.settled());
                            let a = self.handle_fetch_inv(&req, i, now, true, None);
                            if a == Action::Done {
                                Some(Action::Done)
                            } else {
                                if let Some(front) = self.mshr.front_mut(addr) {
                                    front.in_progress = true;
                                }
                                Some(Action::Stall)
                            }
                        }
                        _ => {
                            // a GetS was waiting on the downgrade
                            self.array.entry_mut(i).add_sharer(req.src);
                            let data = self.line_data(i, addr);
                            self.send_response_up(&req, None, Some(data), true, i, now);
                            self.array.entry_mut(i).set_state(st.settled());
                            Some(Action::Done)
                        }
                    }
                } else {
                    Some(Action::Stall)
                }
            }
            _ => panic!(
                "{}: FlushLine in unhandled state {} for {} from {}",
                self.name, state, addr, ev.src
            ),
        };
        if let Some(action) = resolved {
            return action;
        }

        let cur = idx.map_or(State::I, |i| self.array.entry(i).state());
        self.forward_flush_line(ev, idx, cur == State::M, Cmd::FlushLine, now);
        if let Some(i) = idx {
            if cur != State::I {
                self.array.entry_mut(i).set_state(State::S_B);
            } else {
                self.array.entry_mut(i).set_state(State::I_B);
            }
        }
        Action::Stall // wait for FlushLineResp
    }

    /// FlushLineInv: push the line down and invalidate every upstream copy.
    fn handle_flush_line_inv(
        &mut self,
        ev: &MemEvent,
        idx: Option<usize>,
        req: Option<&MemEvent>,
        now: u64,
        replay: bool,
    ) -> Action {
        let addr = ev.base_addr;
        let mut state = idx.map_or(State::I, |i| self.array.entry(i).state());
        if !replay {
            self.stats.record_state_event(ev.cmd, state);
        }

        let is_cached = idx.map_or(false, |i| self.array.is_cached(i));
        if !ev.payload.is_empty() {
            if let Some(i) = idx {
                if is_cached {
                    self.array.set_slot_data(i, &ev.payload);
                } else if self.mshr.contains(addr) {
                    self.mshr.set_data_buffer(addr, ev.payload.clone());
                }
            }
        }

        // the flusher relinquishes ownership up front
        if state == State::M || state == State::E {
            let i = idx.expect("E/M line must exist");
            if self.array.entry(i).owner() == Some(ev.src) {
                self.array.entry_mut(i).clear_owner();
                if ev.dirty {
                    self.array.entry_mut(i).set_state(State::M);
                    state = State::M;
                }
            }
        }

        let resolved: Option<Action> = match state {
            State::I => {
                if req.is_some() {
                    Some(Action::Stall)
                } else {
                    None
                }
            }
            State::S => {
                let i = idx.expect("line must exist");
                if self.array.entry(i).prefetch {
                    self.array.entry_mut(i).prefetch = false;
                    self.stats.prefetch_evict += 1;
                }
                if self.array.entry(i).is_sharer(ev.src) {
                    self.array.entry_mut(i).remove_sharer(ev.src);
                }
                if self.array.entry(i).num_sharers() > 0 {
                    self.invalidate_all_sharers(i, ev.rqstr, replay, now);
                    self.array.entry_mut(i).set_state(State::S_Inv);
                    Some(Action::Stall)
                } else {
                    None
                }
            }
            State::E | State::M => {
                let i = idx.expect("line must exist");
                if self.array.entry(i).prefetch {
                    self.array.entry_mut(i).prefetch = false;
                    self.stats.prefetch_evict += 1;
                }
                if self.array.entry(i).is_sharer(ev.src) {
                    self.array.entry_mut(i).remove_sharer(ev.src);
                }
                let next = if state == State::E { State::E_Inv } else { State::M_Inv };
                if self.array.entry(i).owner().is_some() {
                    self.send_fetch_inv(i, ev.rqstr, replay, now);
                    self.mshr.increment_acks_needed(addr);
                    self.array.entry_mut(i).set_state(next);
                    Some(Action::Stall)
                } else if self.array.entry(i).num_sharers() > 0 {
                    self.invalidate_all_sharers(i, ev.rqstr, replay, now);
                    self.array.entry_mut(i).set_state(next);
                    Some(Action::Stall)
                } else {
                    None
                }
            }
            State::IM | State::IS | State::SM => Some(Action::Stall),
            State::SM_D => {
                let i = idx.expect("line must exist");
                if self.array.entry(i).first_sharer() == Some(ev.src) {
                    self.mshr.decrement_acks_needed(addr);
                }
                if self.mshr.acks_needed(addr) == 0 {
                    let req = self.expect_req(req, ev, state);
                    if req.cmd == Cmd::Fetch {
                        self.array.entry_mut(i).set_state(State::SM);
                        self.send_response_down_from_mshr(ev, false, now);
                        return Action::Done;
                    }
                }
                Some(Action::Stall)
            }
            State::S_D | State::E_D | State::M_D => {
                let i = idx.expect("line must exist");
                if self.array.entry(i).first_sharer() == Some(ev.src) {
                    self.mshr.decrement_acks_needed(addr);
                }
                if self.array.entry(i).is_sharer(ev.src) {
                    self.array.entry_mut(i).remove_sharer(ev.src);
                }
                if self.mshr.acks_needed(addr) == 0 {
                    self.array.entry_mut(i).set_state(state.settled());
                    let req = self.expect_req(req, ev, state);
                    match req.cmd {
                        Cmd::Fetch => {
                            if !self.array.is_cached(i) && self.array.entry(i).num_sharers() == 0 {
                                let cmd = if state == State::M_D || ev.dirty {
                                    Cmd::PutM
                                } else if state == State::E_D {
                                    Cmd::PutE
                                } else {
                                    Cmd::PutS
                                };
                                self.send_writeback_from_mshr(cmd, i, req.rqstr, ev.payload.clone(), now);
                                self.array.entry_mut(i).set_state(State::I);
                            } else {
                                self.send_response_down_from_mshr(ev, state == State::M_D || ev.dirty, now);
                            }
                        }
                        Cmd::GetS => {
                            if self.array.entry(i).num_sharers() > 0 || state == State::S_D {
                                self.array.entry_mut(i).add_sharer(req.src);
                                self.send_response_up(&req, None, Some(ev.payload.clone()), true, i, now);
                            } else {
                                self.send_response_up(&req, Some(Cmd::GetXResp), Some(ev.payload.clone()), true, i, now);
                                self.array.entry_mut(i).set_owner(req.src);
                            }
                        }
                        other => panic!(
                            "{}: FlushLineInv in {} but stalled request is {} for {}",
                            self.name, state, other, addr
                        ),
                    }
                    Some(Action::Done)
                } else {
                    Some(Action::Stall)
                }
            }
            State::S_Inv => {
                let i = idx.expect("line must exist");
                if self.array.entry(i).is_sharer(ev.src) {
                    self.array.entry_mut(i).remove_sharer(ev.src);
                    self.mshr.decrement_acks_needed(addr);
                }
                if self.mshr.acks_needed(addr) == 0 {
                    let req = self.expect_req(req, ev, state);
                    match req.cmd {
                        Cmd::Inv | Cmd::ForceInv => {
                            self.send_ack_inv(&req, now);
                            self.array.entry_mut(i).set_state(State::I);
                            Some(Action::Done)
                        }
                        Cmd::Fetch | Cmd::FetchInv | Cmd::FetchInvX => {
                            self.send_response_down_from_mshr(ev, false, now);
                            self.array.entry_mut(i).set_state(State::I);
                            Some(Action::Done)
                        }
                        Cmd::FlushLineInv => {
                            self.forward_flush_line(&req, idx, false, Cmd::FlushLineInv, now);
                            self.array.entry_mut(i).set_state(State::I_B);
                            if let Some(front) = self.mshr.front_mut(addr) {
                                front.in_progress = true;
                            }
                            Some(Action::Stall)
                        }
                        other => panic!(
                            "{}: FlushLineInv in {} but stalled request is {} for {}",
                            self.name, state, other, addr
                        ),
                    }
                } else {
                    Some(Action::Stall)
                }
            }
            State::SM_Inv => {
                let i = idx.expect("line must exist");
                if self.array.entry(i).is_sharer(ev.src) {
                    self.array.entry_mut(i).remove_sharer(ev.src);
                    self.mshr.decrement_acks_needed(addr);
                }
                if self.mshr.acks_needed(addr) == 0 {
                    let req = self.expect_req(req, ev, state);
                    if req.cmd == Cmd::Inv {
                        if self.array.entry(i).num_sharers() > 0 {
                            self.invalidate_all_sharers(i, req.rqstr, true, now);
                            return Action::Stall;
                        }
                        self.send_ack_inv(&req, now);
                        self.array.entry_mut(i).set_state(State::IM);
                        return Action::Done;
                    }
                }
                Some(Action::Stall)
            }
            State::MI | State::EI | State::SI => {
                let i = idx.expect("line must exist");
                let entry = self.array.entry_mut(i);
                if entry.owner() == Some(ev.src) {
                    entry.clear_owner();
                    self.mshr.decrement_acks_needed(addr);
                } else if entry.is_sharer(ev.src) {
                    entry.remove_sharer(ev.src);
                    self.mshr.decrement_acks_needed(addr);
                }
                let folded = if state == State::EI && ev.dirty { State::MI } else { state };
                if folded != state {
                    self.array.entry_mut(i).set_state(folded);
                }
                if self.mshr.acks_needed(addr) == 0 {
                    let cmd = match folded {
                        State::SI => Cmd::PutS,
                        State::EI => Cmd::PutE,
                        _ => Cmd::PutM,
                    };
                    if self.array.is_cached(i) {
                        self.send_writeback_from_cache(cmd, i, self.name, now);
                    } else {
                        let data = self.mshr.data_buffer(addr).cloned().unwrap_or_else(|| ev.payload.clone());
                        self.send_writeback_from_mshr(cmd, i, self.name, data, now);
                    }
                    if self.cfg.expect_writeback_ack {
                        self.mshr.insert_writeback(addr);
                    }
                    self.array.entry_mut(i).set_state(State::I);
                    Some(Action::Done)
                } else {
                    Some(Action::Stall)
                }
            }
            State::M_Inv | State::E_Inv => {
                let i = idx.expect("line must exist");
                let entry = self.array.entry_mut(i);
                if entry.is_sharer(ev.src) {
                    entry.remove_sharer(ev.src);
                    self.mshr.decrement_acks_needed(addr);
                } else if entry.owner() == Some(ev.src) {
                    entry.clear_owner();
                    self.mshr.decrement_acks_needed(addr);
                }
                if self.mshr.acks_needed(addr) == 0 {
                    let req = self.expect_req(req, ev, state);
                    match req.cmd {
                        Cmd::FetchInv => {
                            let dirty = state == State::M_Inv || ev.dirty;
                            self.send_response_down(&req, i, ev.payload.clone(), dirty, true, now);
                            self.array.entry_mut(i).set_state(State::I);
                            Some(Action::Done)
                        }
                        Cmd::GetX | Cmd::GetSX => {
                            let entry = self.array.entry_mut(i);
                            if entry.is_sharer(req.src) {
                                entry.remove_sharer(req.src);
                            }
                            entry.set_owner(req.src);
                            let data = self.line_data(i, addr);
                            self.send_response_up(&req, None, Some(data), true, i, now);
                            self.array.entry_mut(i).set_state(State::M);
                            Some(Action::Done)
                        }
                        Cmd::FlushLineInv => {
                            let dirty = state == State::M_Inv;
                            self.forward_flush_line(&req, idx, dirty, Cmd::FlushLineInv, now);
                            self.array.entry_mut(i).set_state(State::I_B);
                            if let Some(front) = self.mshr.front_mut(addr) {
                                front.in_progress = true;
                            }
                            Some(Action::Stall)
                        }
                        other => panic!(
                            "{}: FlushLineInv in {} but stalled request is {} for {}",
                            self.name, state, other, addr
                        ),
                    }
                } else {
                    Some(Action::Stall)
                }
            }
            State::M_InvX | State::E_InvX => {
                let i = idx.expect("line must exist");
                if self.array.entry(i).prefetch {
                    self.array.entry_mut(i).prefetch = false;
                    self.stats.prefetch_evict += 1;
                }
                if self.array.entry(i).owner() == Some(ev.src) {
                    self.mshr.decrement_acks_needed(addr);
                    self.array.entry_mut(i).clear_owner();
                }
                if self.mshr.acks_needed(addr) == 0 {
                    let req = self.expect_req(req, ev, state);
                    match req.cmd {
                        Cmd::FetchInvX => {
                            if !self.array.is_cached(i) {
                                let cmd = if ev.dirty || state == State::M_InvX {
                                    Cmd::PutM
                                } else {
                                    Cmd::PutE
                                };
                                self.send_writeback_from_mshr(cmd, i, ev.rqstr, ev.payload.clone(), now);
                                if self.cfg.expect_writeback_ack {
                                    self.mshr.insert_writeback(addr);
                                }
                                self.array.entry_mut(i).set_state(State::I);
                            } else {
                                self.send_response_down_from_mshr(ev, state == State::M_InvX || ev.dirty, now);
                                self.array.entry_mut(i).set_state(State::S);
                            }
                            Some(Action::Done)
                        }
                        Cmd::GetS => {
                            self.array.entry_mut(i).add_sharer(req.src);
                            self.send_response_up(&req, None, Some(ev.payload.clone()), true, i, now);
                            let settled = if state == State::M_InvX || ev.dirty {
                                State::M
                            } else {
                                State::E
                            };
                            self.array.entry_mut(i).set_state(settled);
                            Some(Action::Done)
                        }
                        other => panic!(
                            "{}: FlushLineInv in {} but stalled request is {} for {}",
                            self.name, state, other, addr
                        ),
                    }
                } else {
                    Some(Action::Stall)
                }
            }
            _ => panic!(
                "{}: FlushLineInv in unhandled state {} for {} from {}",
                self.name, state, addr, ev.src
            ),
        };
        if let Some(action) = resolved {
            return action;
        }

        let cur = idx.map_or(State::I, |i| self.array.entry(i).state());
        self.forward_flush_line(ev, idx, cur == State::M, Cmd::FlushLineInv, now);
        if let Some(i) = idx {
            self.array.entry_mut(i).set_state(State::I_B);
        }
        Action::Stall // wait for FlushLineResp
    }
}

/*----------------------------------------------------------------------
 * Invalidation handlers
 *--------------------------------------------------------------------*/

impl DirController {
    /// Inv: invalidate every upstream sharer, then acknowledge downstream.
    /// Parked PutS replacements to the same line are absorbed; their
    /// senders observe our Inv instead of an AckPut.
    fn handle_inv(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        now: u64,
        replay: bool,
        _collision: Option<&MemEvent>,
    ) -> Action {
        let addr = ev.base_addr;
        let state = self.array.entry(idx).state();
        self.stats.record_state_event(ev.cmd, state);

        if self.array.entry(idx).prefetch {
            self.array.entry_mut(idx).prefetch = false;
            self.stats.prefetch_inv += 1;
        }

        match state {
            // our earlier message downstream already implies invalid
            State::I | State::IS | State::IM => Action::Ignore,
            State::I_B => Action::Done, // flush already forwarded
            State::S | State::S_B => {
                if self.array.entry(idx).num_sharers() > 0 {
                    self.invalidate_all_sharers(idx, ev.rqstr, replay, now);
                    self.array.entry_mut(idx).set_state(if state == State::S_B {
                        State::SB_Inv
                    } else {
                        State::S_Inv
                    });
                    self.absorb_parked_puts(addr, idx);
                    if self.mshr.acks_needed(addr) > 0 {
                        return Action::Stall;
                    }
                }
                self.send_ack_inv(ev, now);
                self.array.entry_mut(idx).set_state(if state == State::S_B {
                    State::I_B
                } else {
                    State::I
                });
                Action::Done
            }
            State::SM => {
                if self.array.entry(idx).num_sharers() > 0 {
                    self.invalidate_all_sharers(idx, ev.rqstr, replay, now);
                    self.array.entry_mut(idx).set_state(State::SM_Inv);
                    self.absorb_parked_puts(addr, idx);
                    if self.mshr.acks_needed(addr) > 0 {
                        return Action::Stall;
                    }
                }
                self.send_ack_inv(ev, now);
                self.array.entry_mut(idx).set_state(State::IM);
                Action::Done
            }
            State::SI | State::S_Inv | State::S_D => Action::Block,
            State::SM_Inv => Action::Stall,
            _ => panic!(
                "{}: Inv in unhandled state {} for {} from {}",
                self.name, state, addr, ev.src
            ),
        }
    }

    /// Drop parked PutS events racing with an invalidation we just
    /// broadcast. Each absorbed Put removes its sender from the sharer set
    /// and cancels the ack we were about to wait on.
    fn absorb_parked_puts(&mut self, addr: Addr, idx: usize) {
        loop {
            let src = match self.mshr.lookup_front(addr) {
                Some(f) if f.cmd == Cmd::PutS => f.src,
                _ => break,
            };
            self.mshr.remove_front(addr);
            self.array.entry_mut(idx).remove_sharer(src);
            self.mshr.decrement_acks_needed(addr);
        }
    }

    /// ForceInv: invalidate regardless of cleanliness; never forward data
    /// with the acknowledgment. Parked replacements are acked and treated
    /// as already applied.
    fn handle_force_inv(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        now: u64,
        replay: bool,
        _collision: Option<&MemEvent>,
    ) -> Action {
        let addr = ev.base_addr;
        let state = self.array.entry(idx).state();
        self.stats.record_state_event(ev.cmd, state);

        if self.array.entry(idx).prefetch {
            self.array.entry_mut(idx).prefetch = false;
            self.stats.prefetch_inv += 1;
        }

        // resolve parked replacements as having already occurred
        loop {
            match self.mshr.lookup_front(addr) {
                Some(f) if f.cmd.is_writeback() => {}
                _ => break,
            }
            let put = match self.mshr.remove_front(addr) {
                Some(MshrEntry::Event(put)) => put,
                _ => unreachable!(),
            };
            let entry = self.array.entry_mut(idx);
            if entry.is_sharer(put.src) {
                entry.remove_sharer(put.src);
            }
            if entry.owner().is_some() {
                entry.clear_owner();
            }
            self.send_writeback_ack(&put, now);
        }

        match state {
            State::I | State::IS | State::IM | State::I_B => Action::Ignore,
            State::S | State::S_B | State::SM => {
                if self.array.entry(idx).num_sharers() > 0 {
                    self.invalidate_all_sharers(idx, ev.rqstr, replay, now);
                    self.array.entry_mut(idx).set_state(match state {
                        State::S => State::S_Inv,
                        State::S_B => State::SB_Inv,
                        _ => State::SM_Inv,
                    });
                    if self.mshr.acks_needed(addr) > 0 {
                        return Action::Stall;
                    }
                }
                self.send_ack_inv(ev, now);
                self.array.entry_mut(idx).set_state(match state {
                    State::S => State::I,
                    State::S_B => State::I_B,
                    _ => State::IM,
                });
                Action::Done
            }
            State::E | State::M => {
                let next = if state == State::E { State::E_Inv } else { State::M_Inv };
                if self.array.entry(idx).owner().is_some() {
                    self.send_force_inv(idx, ev.rqstr, replay, now);
                    self.mshr.increment_acks_needed(addr);
                    self.array.entry_mut(idx).set_state(next);
                    return Action::Stall;
                }
                if self.array.entry(idx).num_sharers() > 0 {
                    self.invalidate_all_sharers(idx, ev.rqstr, replay, now);
                    self.array.entry_mut(idx).set_state(next);
                    return Action::Stall;
                }
                self.send_ack_inv(ev, now);
                self.array.entry_mut(idx).set_state(State::I);
                Action::Done
            }
            // fold the force into the in-flight eviction
            State::SI => {
                self.array.entry_mut(idx).set_state(State::S_Inv);
                Action::Stall
            }
            State::EI => {
                self.array.entry_mut(idx).set_state(State::E_Inv);
                Action::Stall
            }
            State::MI => {
                self.array.entry_mut(idx).set_state(State::M_Inv);
                Action::Stall
            }
            State::S_D
            | State::E_D
            | State::M_D
            | State::SM_D
            | State::E_InvX
            | State::M_InvX
            | State::M_Inv
            | State::S_Inv
            | State::E_Inv
            | State::SM_Inv
            | State::SB_Inv => {
                // handle an incoming inval ahead of a pending flush (deadlock
                // avoidance); otherwise wait for the head to finish
                match self.mshr.lookup_front(addr) {
                    Some(f) if matches!(f.cmd, Cmd::FlushLine | Cmd::FlushLineInv) => Action::Stall,
                    _ => Action::Block,
                }
            }
            _ => panic!(
                "{}: ForceInv in unhandled state {} for {} from {}",
                self.name, state, addr, ev.src
            ),
        }
    }

    /// Fetch: the lower level wants the data without invalidation.
    fn handle_fetch(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        now: u64,
        replay: bool,
        collision: Option<&MemEvent>,
    ) -> Action {
        let addr = ev.base_addr;
        let state = self.array.entry(idx).state();
        self.stats.record_state_event(ev.cmd, state);

        match state {
            State::I | State::IS | State::IM => Action::Ignore,
            State::S | State::SM => {
                if self.array.is_cached(idx) {
                    let data = self.array.slot_data(idx).cloned().unwrap_or_default();
                    self.send_response_down(ev, idx, data, false, replay, now);
                    return Action::Done;
                }
                // a parked replacement carries the payload we need
                if let Some(put) = collision.filter(|c| c.cmd.is_writeback()) {
                    self.send_response_down(ev, idx, put.payload.clone(), false, replay, now);
                    return Action::Done;
                }
                self.send_fetch(idx, ev.rqstr, replay, now);
                self.mshr.increment_acks_needed(addr);
                self.array.entry_mut(idx).set_state(if state == State::S {
                    State::S_D
                } else {
                    State::SM_D
                });
                Action::Stall
            }
            State::S_Inv | State::SI | State::S_D => Action::Block,
            _ => panic!(
                "{}: Fetch in unhandled state {} for {} from {}",
                self.name, state, addr, ev.src
            ),
        }
    }

    /// FetchInv: invalidate all upstream copies and return the data.
    fn handle_fetch_inv(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        now: u64,
        replay: bool,
        collision_ev: Option<&MemEvent>,
    ) -> Action {
        let addr = ev.base_addr;
        let mut state = self.array.entry(idx).state();
        self.stats.record_state_event(ev.cmd, state);

        if self.array.entry(idx).prefetch {
            self.array.entry_mut(idx).prefetch = false;
            self.stats.prefetch_inv += 1;
        }

        let is_cached = self.array.is_cached(idx);
        let mut collision = false;
        // A parked replacement is treated as having raced to completion
        // ahead of this invalidation: apply it, ack it, keep its payload.
        if collision_ev.map_or(false, |c| c.cmd.is_writeback()) {
            collision = true;
            let put = match self.mshr.remove_front(addr) {
                Some(MshrEntry::Event(put)) => put,
                _ => unreachable!(),
            };
            let entry = self.array.entry_mut(idx);
            if entry.is_sharer(put.src) {
                entry.remove_sharer(put.src);
            }
            if entry.owner().is_some() {
                entry.clear_owner();
            }
            self.mshr.set_data_buffer(addr, put.payload.clone());
            if state == State::E && put.dirty {
                self.array.entry_mut(idx).set_state(State::M);
            }
            state = State::M;
            self.send_writeback_ack(&put, now);
        }

        match state {
            State::I | State::IS | State::IM | State::I_B => Action::Ignore,
            State::S | State::SM => {
                if self.array.entry(idx).num_sharers() > 0 {
                    if is_cached || collision {
                        self.invalidate_all_sharers(idx, ev.rqstr, replay, now);
                    } else {
                        self.invalidate_all_sharers_and_fetch(idx, ev.rqstr, replay, now);
                    }
                    self.array.entry_mut(idx).set_state(if state == State::S {
                        State::S_Inv
                    } else {
                        State::SM_Inv
                    });
                    return Action::Stall;
                }
                if !is_cached && !collision {
                    panic!(
                        "{}: uncached block must have owners or sharers, addr {} state {} at FetchInv",
                        self.name, addr, state
                    );
                }
                let data = self.response_data(idx, addr, collision);
                self.send_response_down(ev, idx, data, false, replay, now);
                if collision {
                    self.mshr.clear_data_buffer(addr);
                }
                self.array.entry_mut(idx).set_state(if state == State::S {
                    State::I
                } else {
                    State::IM
                });
                Action::Done
            }
            State::S_B => {
                if self.array.entry(idx).num_sharers() > 0 {
                    self.invalidate_all_sharers(idx, ev.rqstr, replay, now);
                    self.array.entry_mut(idx).set_state(State::SB_Inv);
                    return Action::Stall;
                }
                self.send_ack_inv(ev, now);
                self.array.entry_mut(idx).set_state(State::I_B);
                Action::Done
            }
            State::E | State::M => {
                let next = if state == State::E { State::E_Inv } else { State::M_Inv };
                if self.array.entry(idx).owner().is_some() {
                    self.send_fetch_inv(idx, ev.rqstr, replay, now);
                    self.mshr.increment_acks_needed(addr);
                    self.array.entry_mut(idx).set_state(next);
                    return Action::Stall;
                }
                if self.array.entry(idx).num_sharers() > 0 {
                    if is_cached || collision {
                        self.invalidate_all_sharers(idx, ev.rqstr, replay, now);
                    } else {
                        self.invalidate_all_sharers_and_fetch(idx, ev.rqstr, replay, now);
                    }
                    self.array.entry_mut(idx).set_state(next);
                    return Action::Stall;
                }
                if !is_cached && !collision {
                    panic!(
                        "{}: uncached block must have owners or sharers, addr {} state {} at FetchInv",
                        self.name, addr, state
                    );
                }
                let data = self.response_data(idx, addr, collision);
                self.send_response_down(ev, idx, data, state == State::M, replay, now);
                if collision {
                    self.mshr.clear_data_buffer(addr);
                }
                self.array.entry_mut(idx).set_state(State::I);
                Action::Done
            }
            State::EI => {
                self.array.entry_mut(idx).set_state(State::E_Inv);
                Action::Stall
            }
            State::MI => {
                self.array.entry_mut(idx).set_state(State::M_Inv);
                Action::Stall
            }
            State::S_D
            | State::E_D
            | State::M_D
            | State::E_Inv
            | State::E_InvX
            | State::M_Inv
            | State::M_InvX => match self.mshr.lookup_front(addr) {
                Some(f) if matches!(f.cmd, Cmd::FlushLine | Cmd::FlushLineInv) => Action::Stall,
                _ => Action::Block,
            },
            _ => panic!(
                "{}: FetchInv in unhandled state {} for {} from {}",
                self.name, state, addr, ev.src
            ),
        }
    }

    /// FetchInvX: downgrade the owner to sharer and return the data; other
    /// sharers keep their copies.
    fn handle_fetch_inv_x(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        now: u64,
        replay: bool,
        collision_ev: Option<&MemEvent>,
    ) -> Action {
        let addr = ev.base_addr;
        let mut state = self.array.entry(idx).state();
        self.stats.record_state_event(ev.cmd, state);

        let is_cached = self.array.is_cached(idx);
        let collision = collision_ev.map_or(false, |c| c.cmd.is_writeback());
        if collision {
            if state == State::E && collision_ev.map_or(false, |c| c.dirty) {
                self.array.entry_mut(idx).set_state(State::M);
            }
            state = State::M;
        }

        match state {
            State::I | State::IS | State::IM | State::I_B | State::S_B => Action::Ignore,
            State::E | State::M => {
                if collision {
                    // the parked replacement already carries the data; the
                    // downgraded owner stays on as a sharer and its Put is
                    // replaced by a synthetic PutS
                    let put = collision_ev.unwrap().clone();
                    if self.array.entry(idx).owner().is_some() {
                        self.array.entry_mut(idx).clear_owner();
                        self.array.entry_mut(idx).add_sharer(put.src);
                        self.mshr.remove_front(addr);
                        let mut puts = MemEvent::new(put.src, addr, put.addr, Cmd::PutS);
                        puts.dst = self.name;
                        puts.rqstr = put.rqstr;
                        puts.size = put.size;
                        puts.payload = put.payload.clone();
                        self.mshr.insert_front(addr, puts);
                    }
                    self.array.entry_mut(idx).set_state(State::S);
                    self.send_response_down(ev, idx, put.payload.clone(), true, replay, now);
                    return Action::Done;
                }
                let next = if state == State::E { State::E_InvX } else { State::M_InvX };
                if self.array.entry(idx).owner().is_some() {
                    self.send_fetch_inv_x(idx, ev.rqstr, replay, now);
                    self.mshr.increment_acks_needed(addr);
                    self.array.entry_mut(idx).set_state(next);
                    return Action::Stall;
                }
                if is_cached {
                    let data = self.array.slot_data(idx).cloned().unwrap_or_default();
                    self.send_response_down(ev, idx, data, state == State::M, replay, now);
                    self.array.entry_mut(idx).set_state(State::S);
                    return Action::Done;
                }
                // shared upstream but not cached locally
                self.send_fetch(idx, ev.rqstr, replay, now);
                self.mshr.increment_acks_needed(addr);
                self.array.entry_mut(idx).set_state(next);
                Action::Stall
            }
            State::E_D
            | State::M_D
            | State::EI
            | State::MI
            | State::E_Inv
            | State::E_InvX
            | State::M_Inv
            | State::M_InvX => match self.mshr.lookup_front(addr) {
                Some(f) if matches!(f.cmd, Cmd::FlushLine | Cmd::FlushLineInv) => Action::Stall,
                _ => Action::Block,
            },
            _ => panic!(
                "{}: FetchInvX in unhandled state {} for {} from {}",
                self.name, state, addr, ev.src
            ),
        }
    }

    /// Data to answer a downstream fetch with: the local copy when cached,
    /// else the payload buffered from a raced replacement.
    fn response_data(&self, idx: usize, addr: Addr, collision: bool) -> Vec<u8> {
        if collision {
            self.mshr.data_buffer(addr).cloned().unwrap_or_default()
        } else {
            self.array.slot_data(idx).cloned().unwrap_or_default()
        }
    }

    /// Local line payload: cached copy first, MSHR buffer as fallback.
    fn line_data(&self, idx: usize, addr: Addr) -> Vec<u8> {
        self.array
            .slot_data(idx)
            .cloned()
            .or_else(|| self.mshr.data_buffer(addr).cloned())
            .unwrap_or_default()
    }
}

/*----------------------------------------------------------------------
 * Response handlers
 *--------------------------------------------------------------------*/

impl DirController {
    /// GetSResp / GetXResp from downstream: fill the line and deliver to
    /// the waiting requestor. Prefetches we originated fill silently.
    fn handle_data_response(&mut self, ev: &MemEvent, idx: usize, now: u64) -> Action {
        let addr = ev.base_addr;
        let state = self.array.entry(idx).state();
        self.stats.record_state_event(ev.cmd, state);

        let orig = self
            .mshr
            .lookup_front(addr)
            .cloned()
            .unwrap_or_else(|| panic!("{}: {} with no pending request for {}", self.name, ev.cmd, addr));
        if let Some(front) = self.mshr.front_mut(addr) {
            front.mem_flags = ev.mem_flags;
        }
        let local_prefetch = orig.prefetch && orig.rqstr == self.name;
        let is_cached = self.array.is_cached(idx);

        match state {
            State::IS => {
                let next = if ev.cmd == Cmd::GetXResp && self.cfg.protocol == Protocol::MESI {
                    State::E
                } else {
                    State::S
                };
                self.array.entry_mut(idx).set_state(next);
                if is_cached {
                    self.array.set_slot_data(idx, &ev.payload);
                }
                if local_prefetch {
                    self.array.entry_mut(idx).prefetch = true;
                    return Action::Done;
                }
                if next == State::E {
                    self.send_response_up(&orig, Some(Cmd::GetXResp), Some(ev.payload.clone()), true, idx, now);
                    self.array.entry_mut(idx).set_owner(orig.src);
                } else {
                    self.array.entry_mut(idx).add_sharer(orig.src);
                    self.send_response_up(&orig, None, Some(ev.payload.clone()), true, idx, now);
                }
                Action::Done
            }
            State::IM | State::SM => {
                if state == State::IM && is_cached {
                    self.array.set_slot_data(idx, &ev.payload);
                }
                self.array.entry_mut(idx).set_state(State::M);
                {
                    let entry = self.array.entry_mut(idx);
                    entry.set_owner(orig.src);
                    if entry.is_sharer(orig.src) {
                        entry.remove_sharer(orig.src);
                    }
                }
                let data = if is_cached {
                    self.array.slot_data(idx).cloned().unwrap_or_default()
                } else {
                    ev.payload.clone()
                };
                self.send_response_up(&orig, None, Some(data), true, idx, now);
                Action::Done
            }
            State::SM_Inv => {
                // upgrade data arrived before the invalidation acks
                self.mshr.set_data_buffer(addr, ev.payload.clone());
                self.array.entry_mut(idx).set_state(State::M_Inv);
                Action::Stall
            }
            _ => panic!(
                "{}: {} in unhandled state {} for {}",
                self.name, ev.cmd, state, addr
            ),
        }
    }

    /// FetchResp / FetchXResp from a sharer or owner answering our Fetch*.
    fn handle_fetch_resp(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        req: Option<&MemEvent>,
        now: u64,
    ) -> Action {
        let addr = ev.base_addr;
        let state = self.array.entry(idx).state();
        self.stats.record_state_event(ev.cmd, state);

        if self.mshr.acks_needed(addr) > 0 {
            self.mshr.decrement_acks_needed(addr);
        }
        let action = if self.mshr.acks_needed(addr) == 0 {
            Action::Done
        } else {
            Action::Ignore
        };

        let is_cached = self.array.is_cached(idx);
        if is_cached {
            self.array.set_slot_data(idx, &ev.payload);
        }

        match state {
            State::S_D | State::SM_D | State::E_D | State::M_D => {
                let settled = state.settled();
                self.array.entry_mut(idx).set_state(settled);
                let req = self.expect_req(req, ev, state);
                match req.cmd {
                    Cmd::Fetch => {
                        self.send_response_down_from_mshr(ev, settled == State::M || ev.dirty, now);
                    }
                    Cmd::GetS => {
                        self.array.entry_mut(idx).add_sharer(req.src);
                        self.send_response_up(&req, None, Some(ev.payload.clone()), true, idx, now);
                    }
                    other => panic!(
                        "{}: FetchResp in {} but stalled request is {} for {}",
                        self.name, state, other, addr
                    ),
                }
                action
            }
            State::SI => {
                self.array.entry_mut(idx).remove_sharer(ev.src);
                self.mshr.set_data_buffer(addr, ev.payload.clone());
                if action == Action::Done {
                    let rqstr = req.map_or(self.name, |r| r.rqstr);
                    self.send_writeback_from_mshr(Cmd::PutS, idx, rqstr, ev.payload.clone(), now);
                    if self.cfg.expect_writeback_ack {
                        self.mshr.insert_writeback(addr);
                    }
                    self.array.entry_mut(idx).set_state(State::I);
                }
                action
            }
            State::EI | State::MI => {
                let folded = if state == State::EI && ev.dirty { State::MI } else { state };
                if folded != state {
                    self.array.entry_mut(idx).set_state(folded);
                }
                let entry = self.array.entry_mut(idx);
                if entry.owner() == Some(ev.src) {
                    entry.clear_owner();
                }
                if entry.is_sharer(ev.src) {
                    entry.remove_sharer(ev.src);
                }
                if action == Action::Done {
                    let cmd = if folded == State::EI { Cmd::PutE } else { Cmd::PutM };
                    self.send_writeback_from_mshr(cmd, idx, self.name, ev.payload.clone(), now);
                    if self.cfg.expect_writeback_ack {
                        self.mshr.insert_writeback(addr);
                    }
                    self.array.entry_mut(idx).set_state(State::I);
                }
                action
            }
            State::E_InvX | State::M_InvX => {
                {
                    let entry = self.array.entry_mut(idx);
                    if entry.owner() == Some(ev.src) {
                        entry.clear_owner();
                        entry.add_sharer(ev.src);
                    }
                }
                if !is_cached {
                    self.mshr.set_data_buffer(addr, ev.payload.clone());
                }
                let req = self.expect_req(req, ev, state);
                match req.cmd {
                    Cmd::FetchInvX => {
                        self.send_response_down_from_mshr(ev, state == State::M_InvX || ev.dirty, now);
                        self.array.entry_mut(idx).set_state(State::S);
                        action
                    }
                    Cmd::FetchInv => {
                        // an external FetchInv raced with our downgrade
                        let dirty = state == State::M_InvX || ev.dirty;
                        if self.array.entry(idx).num_sharers() > 0 {
                            self.invalidate_all_sharers(idx, req.rqstr, true, now);
                            self.array.entry_mut(idx).set_state(if dirty {
                                State::M_Inv
                            } else {
                                State::E_Inv
                            });
                            return Action::Stall;
                        }
                        self.array.entry_mut(idx).set_state(if dirty { State::M } else { State::E });
                        self.send_response_down_from_mshr(ev, dirty, now);
                        action
                    }
                    Cmd::FlushLine => {
                        let dirty = state == State::M_InvX || ev.dirty;
                        self.array.entry_mut(idx).set_state(if dirty { State::M } else { State::E });
                        self.resume_flush(&req, idx, now)
                    }
                    _ => {
                        // GetS waiting on the downgrade
                        self.array.entry_mut(idx).add_sharer(req.src);
                        self.send_response_up(&req, None, Some(ev.payload.clone()), true, idx, now);
                        let settled = if ev.dirty || state == State::M_InvX {
                            State::M
                        } else {
                            State::E
                        };
                        self.array.entry_mut(idx).set_state(settled);
                        action
                    }
                }
            }
            State::E_Inv | State::M_Inv => {
                {
                    let entry = self.array.entry_mut(idx);
                    if entry.is_sharer(ev.src) {
                        entry.remove_sharer(ev.src);
                    }
                    if entry.owner() == Some(ev.src) {
                        entry.clear_owner();
                    }
                }
                if action != Action::Done {
                    if ev.dirty {
                        self.array.entry_mut(idx).set_state(State::M_Inv);
                    }
                    self.mshr.set_data_buffer(addr, ev.payload.clone());
                    return action;
                }
                let req = self.expect_req(req, ev, state);
                match req.cmd {
                    Cmd::GetX | Cmd::GetSX => {
                        {
                            let entry = self.array.entry_mut(idx);
                            if entry.is_sharer(req.src) {
                                entry.remove_sharer(req.src);
                            }
                            entry.set_owner(req.src);
                        }
                        self.send_response_up(&req, None, Some(ev.payload.clone()), true, idx, now);
                        self.array.entry_mut(idx).set_state(State::M);
                        action
                    }
                    Cmd::FlushLineInv => {
                        if ev.dirty {
                            if is_cached {
                                self.array.set_slot_data(idx, &ev.payload);
                            } else {
                                self.mshr.set_data_buffer(addr, ev.payload.clone());
                            }
                        }
                        let settled = if ev.dirty || state == State::M_Inv {
                            State::M
                        } else {
                            State::E
                        };
                        self.array.entry_mut(idx).set_state(settled);
                        self.resume_flush(&req, idx, now)
                    }
                    Cmd::ForceInv => {
                        self.send_ack_inv(&req, now);
                        self.array.entry_mut(idx).set_state(State::I);
                        action
                    }
                    _ => {
                        self.send_response_down_from_mshr(ev, state == State::M_Inv || ev.dirty, now);
                        self.array.entry_mut(idx).set_state(State::I);
                        action
                    }
                }
            }
            State::S_Inv | State::SM_Inv => {
                self.array.entry_mut(idx).remove_sharer(ev.src);
                if action != Action::Done {
                    self.mshr.set_data_buffer(addr, ev.payload.clone());
                } else {
                    self.send_response_down_from_mshr(ev, false, now);
                    self.array.entry_mut(idx).set_state(if state == State::S_Inv {
                        State::I
                    } else {
                        State::IM
                    });
                }
                action
            }
            _ => panic!(
                "{}: {} in unhandled state {} for {}",
                self.name, ev.cmd, state, addr
            ),
        }
    }

    /// AckInv from an upstream child we invalidated.
    fn handle_ack_inv(
        &mut self,
        ack: &MemEvent,
        idx: usize,
        req: Option<&MemEvent>,
        now: u64,
    ) -> Action {
        let addr = ack.base_addr;
        let state = self.array.entry(idx).state();
        self.stats.record_state_event(ack.cmd, state);

        if self.array.entry(idx).is_sharer(ack.src) {
            self.array.entry_mut(idx).remove_sharer(ack.src);
        }
        if self.array.entry(idx).owner() == Some(ack.src) {
            self.array.entry_mut(idx).clear_owner();
        }
        if self.mshr.acks_needed(addr) > 0 {
            self.mshr.decrement_acks_needed(addr);
        }
        trace!("{}: AckInv for {}, acks left {}", self.name, addr, self.mshr.acks_needed(addr));
        let action = if self.mshr.acks_needed(addr) == 0 {
            Action::Done
        } else {
            Action::Ignore
        };
        if action != Action::Done {
            return action;
        }
        let data = self.line_data(idx, addr);

        match state {
            State::S_Inv => {
                let req = self.expect_req(req, ack, state);
                match req.cmd {
                    Cmd::FetchInv => {
                        self.send_response_down(&req, idx, data, false, true, now);
                        self.array.entry_mut(idx).set_state(State::I);
                        action
                    }
                    Cmd::FlushLineInv => {
                        self.array.entry_mut(idx).set_state(State::S);
                        self.resume_flush(&req, idx, now)
                    }
                    _ => {
                        self.send_ack_inv(&req, now);
                        self.array.entry_mut(idx).set_state(State::I);
                        action
                    }
                }
            }
            State::E_Inv | State::M_Inv => {
                let req = self.expect_req(req, ack, state);
                match req.cmd {
                    Cmd::FetchInv => {
                        self.send_response_down(&req, idx, data, state == State::M_Inv, true, now);
                        self.array.entry_mut(idx).set_state(State::I);
                        self.mshr.clear_data_buffer(addr);
                        action
                    }
                    Cmd::ForceInv => {
                        self.send_ack_inv(&req, now);
                        self.array.entry_mut(idx).set_state(State::I);
                        self.mshr.clear_data_buffer(addr);
                        action
                    }
                    Cmd::Inv => {
                        // the Inv outran our own upgrade; abandon the stashed
                        // data and let the upgrade restart from I
                        self.send_ack_inv(&req, now);
                        self.array.entry_mut(idx).set_state(State::I);
                        self.mshr.clear_data_buffer(addr);
                        action
                    }
                    Cmd::FlushLineInv => {
                        let settled = if state == State::M_Inv { State::M } else { State::E };
                        self.array.entry_mut(idx).set_state(settled);
                        self.resume_flush(&req, idx, now)
                    }
                    _ => {
                        // GetX / GetSX waiting on the invalidations
                        {
                            let entry = self.array.entry_mut(idx);
                            if entry.is_sharer(req.src) {
                                entry.remove_sharer(req.src);
                            }
                            entry.set_owner(req.src);
                        }
                        self.send_response_up(&req, None, Some(data), true, idx, now);
                        self.array.entry_mut(idx).set_state(State::M);
                        self.mshr.clear_data_buffer(addr);
                        action
                    }
                }
            }
            State::SM_Inv => {
                let req = self.expect_req(req, ack, state);
                match req.cmd {
                    Cmd::Inv | Cmd::ForceInv => {
                        if self.array.entry(idx).num_sharers() > 0 {
                            // the GetX requestor was spared; invalidate again
                            self.invalidate_all_sharers(idx, req.rqstr, true, now);
                            return Action::Stall;
                        }
                        self.send_ack_inv(&req, now);
                        self.array.entry_mut(idx).set_state(State::IM);
                        action
                    }
                    Cmd::FetchInv => {
                        self.send_response_down(&req, idx, data, false, true, now);
                        self.array.entry_mut(idx).set_state(State::IM);
                        action
                    }
                    _ => {
                        // still waiting on the upgrade data
                        self.array.entry_mut(idx).set_state(State::SM);
                        Action::Ignore
                    }
                }
            }
            State::SB_Inv => {
                let req = self.expect_req(req, ack, state);
                if self.array.entry(idx).num_sharers() > 0 {
                    self.invalidate_all_sharers(idx, req.rqstr, true, now);
                    return Action::Ignore;
                }
                self.send_ack_inv(&req, now);
                self.array.entry_mut(idx).set_state(State::I_B);
                action
            }
            State::SI | State::EI | State::MI => {
                let cmd = match state {
                    State::SI => Cmd::PutS,
                    State::EI => Cmd::PutE,
                    _ => Cmd::PutM,
                };
                let rqstr = req.map_or(self.name, |r| r.rqstr);
                self.send_writeback_from_mshr(cmd, idx, rqstr, data, now);
                if self.cfg.expect_writeback_ack {
                    self.mshr.insert_writeback(addr);
                }
                self.array.entry_mut(idx).set_state(State::I);
                action
            }
            _ => panic!(
                "{}: AckInv in unhandled state {} for {} from {}",
                self.name, state, addr, ack.src
            ),
        }
    }
}

/*----------------------------------------------------------------------
 * Send shim: serialize outgoing messages onto the directional queues.
 * Sends tied to a line obey its timestamp: deliver_at is never earlier
 * than the line's most recent scheduled message.
 *--------------------------------------------------------------------*/

impl DirController {
    fn queue_up(&mut self, ev: MemEvent, deliver_at: u64) {
        trace!("{}: -> up {} {} to {} @ {}", self.name, ev.cmd, ev.base_addr, ev.dst, deliver_at);
        self.stats.record_sent_up(ev.cmd);
        let bytes = self.cfg.packet_header_bytes + ev.payload.len();
        self.sent_flag = true;
        self.out_up.push_back(OutPacket { event: ev, deliver_at, bytes });
    }

    fn queue_down(&mut self, ev: MemEvent, deliver_at: u64) {
        trace!("{}: -> down {} {} to {} @ {}", self.name, ev.cmd, ev.base_addr, ev.dst, deliver_at);
        self.stats.record_sent_down(ev.cmd);
        let bytes = self.cfg.packet_header_bytes + ev.payload.len();
        self.sent_flag = true;
        self.out_down.push_back(OutPacket { event: ev, deliver_at, bytes });
    }

    fn line_send_time(&self, idx: usize, now: u64, latency: u64) -> u64 {
        now.max(self.array.entry(idx).timestamp) + latency
    }

    fn inv_latency(&self, replay: bool) -> u64 {
        if replay {
            self.cfg.mshr_latency
        } else {
            self.cfg.tag_latency
        }
    }

    /// Invalidate every sharer; one ack is expected per invalidation.
    fn invalidate_all_sharers(&mut self, idx: usize, rqstr: PeerId, replay: bool, now: u64) {
        let base = self.array.entry(idx).base_addr;
        let deliver = self.line_send_time(idx, now, self.inv_latency(replay));
        let sharers: Vec<PeerId> = self.array.entry(idx).sharers().collect();
        let mut sent = false;
        for dst in sharers {
            let mut inv = MemEvent::new(self.name, base, base, Cmd::Inv);
            inv.dst = dst;
            inv.rqstr = rqstr;
            self.queue_up(inv, deliver);
            self.mshr.increment_acks_needed(base);
            sent = true;
        }
        if sent {
            self.array.entry_mut(idx).timestamp = deliver;
        }
    }

    /// Invalidate every sharer and pull the data back from the first one.
    fn invalidate_all_sharers_and_fetch(&mut self, idx: usize, rqstr: PeerId, replay: bool, now: u64) {
        let base = self.array.entry(idx).base_addr;
        let deliver = self.line_send_time(idx, now, self.inv_latency(replay));
        let sharers: Vec<PeerId> = self.array.entry(idx).sharers().collect();
        let mut fetched = false;
        let mut sent = false;
        for dst in sharers {
            let cmd = if fetched { Cmd::Inv } else { Cmd::FetchInv };
            fetched = true;
            let mut inv = MemEvent::new(self.name, base, base, cmd);
            inv.dst = dst;
            inv.rqstr = rqstr;
            inv.size = self.cfg.line_size;
            self.queue_up(inv, deliver);
            self.mshr.increment_acks_needed(base);
            sent = true;
        }
        if sent {
            self.array.entry_mut(idx).timestamp = deliver;
        }
    }

    /// Invalidate all sharers except the requestor. When the block is not
    /// cached locally and the requestor holds no copy either, the first
    /// invalidation upgrades to a FetchInv to bring the data back.
    fn invalidate_sharers_except_requestor(
        &mut self,
        idx: usize,
        requestor: PeerId,
        orig_rqstr: PeerId,
        replay: bool,
        uncached: bool,
        now: u64,
    ) -> bool {
        let base = self.array.entry(idx).base_addr;
        let deliver = self.line_send_time(idx, now, self.inv_latency(replay));
        let sharers: Vec<PeerId> = self.array.entry(idx).sharers().collect();
        let mut need_fetch = uncached && !sharers.contains(&requestor);
        let mut sent = false;
        for dst in sharers {
            if dst == requestor {
                continue;
            }
            let cmd = if need_fetch {
                need_fetch = false;
                Cmd::FetchInv
            } else {
                Cmd::Inv
            };
            let mut inv = MemEvent::new(self.name, base, base, cmd);
            inv.dst = dst;
            inv.rqstr = orig_rqstr;
            inv.size = self.cfg.line_size;
            self.queue_up(inv, deliver);
            self.mshr.increment_acks_needed(base);
            sent = true;
        }
        if sent {
            self.array.entry_mut(idx).timestamp = deliver;
        }
        sent
    }

    /// Fetch data from the first sharer without invalidating it.
    fn send_fetch(&mut self, idx: usize, rqstr: PeerId, _replay: bool, now: u64) {
        let base = self.array.entry(idx).base_addr;
        let dst = self
            .array
            .entry(idx)
            .first_sharer()
            .unwrap_or_else(|| panic!("{}: Fetch with no sharers for {}", self.name, base));
        let deliver = self.line_send_time(idx, now, self.cfg.tag_latency);
        let mut fetch = MemEvent::new(self.name, base, base, Cmd::Fetch);
        fetch.dst = dst;
        fetch.rqstr = rqstr;
        self.queue_up(fetch, deliver);
        self.array.entry_mut(idx).timestamp = deliver;
    }

    fn send_fetch_inv(&mut self, idx: usize, rqstr: PeerId, replay: bool, now: u64) {
        let base = self.array.entry(idx).base_addr;
        let dst = self
            .array
            .entry(idx)
            .owner()
            .or_else(|| self.array.entry(idx).first_sharer())
            .unwrap_or_else(|| panic!("{}: FetchInv with no owner or sharers for {}", self.name, base));
        let deliver = self.line_send_time(idx, now, self.inv_latency(replay));
        let mut fetch = MemEvent::new(self.name, base, base, Cmd::FetchInv);
        fetch.dst = dst;
        fetch.rqstr = rqstr;
        fetch.size = self.cfg.line_size;
        self.queue_up(fetch, deliver);
        self.array.entry_mut(idx).timestamp = deliver;
    }

    fn send_fetch_inv_x(&mut self, idx: usize, rqstr: PeerId, replay: bool, now: u64) {
        let base = self.array.entry(idx).base_addr;
        let dst = self
            .array
            .entry(idx)
            .owner()
            .unwrap_or_else(|| panic!("{}: FetchInvX with no owner for {}", self.name, base));
        let deliver = self.line_send_time(idx, now, self.inv_latency(replay));
        let mut fetch = MemEvent::new(self.name, base, base, Cmd::FetchInvX);
        fetch.dst = dst;
        fetch.rqstr = rqstr;
        fetch.size = self.cfg.line_size;
        self.queue_up(fetch, deliver);
        self.array.entry_mut(idx).timestamp = deliver;
    }

    fn send_force_inv(&mut self, idx: usize, rqstr: PeerId, replay: bool, now: u64) {
        let base = self.array.entry(idx).base_addr;
        let dst = self
            .array
            .entry(idx)
            .owner()
            .unwrap_or_else(|| panic!("{}: ForceInv with no owner for {}", self.name, base));
        let deliver = self.line_send_time(idx, now, self.inv_latency(replay));
        let mut inv = MemEvent::new(self.name, base, base, Cmd::ForceInv);
        inv.dst = dst;
        inv.rqstr = rqstr;
        inv.size = self.cfg.line_size;
        self.queue_up(inv, deliver);
        self.array.entry_mut(idx).timestamp = deliver;
    }

    /// Respond upstream to a request, optionally overriding the response
    /// command (exclusive grants use GetXResp).
    fn send_response_up(
        &mut self,
        req: &MemEvent,
        cmd: Option<Cmd>,
        data: Option<Vec<u8>>,
        replay: bool,
        idx: usize,
        now: u64,
    ) {
        let mut resp = req.make_response();
        if let Some(cmd) = cmd {
            resp.cmd = cmd;
        }
        if let Some(data) = data {
            resp.size = data.len();
            resp.payload = data;
        }
        let latency = if replay {
            self.cfg.mshr_latency
        } else {
            self.cfg.access_latency
        };
        let deliver = self.line_send_time(idx, now, latency);
        self.queue_up(resp, deliver);
        self.array.entry_mut(idx).timestamp = deliver;
    }

    /// Respond downstream (FetchResp / FetchXResp / AckInv payloads).
    fn send_response_down(
        &mut self,
        req: &MemEvent,
        idx: usize,
        data: Vec<u8>,
        dirty: bool,
        replay: bool,
        now: u64,
    ) {
        let mut resp = req.make_response();
        resp.size = data.len();
        resp.payload = data;
        resp.dirty = dirty;
        let latency = if replay {
            self.cfg.mshr_latency
        } else {
            self.cfg.access_latency
        };
        let deliver = self.line_send_time(idx, now, latency);
        self.queue_down(resp, deliver);
        self.array.entry_mut(idx).timestamp = deliver;
    }

    /// Respond downstream on behalf of the MSHR head, carrying `ev`'s
    /// payload. Used when the data arrived by race rather than by fetch.
    fn send_response_down_from_mshr(&mut self, ev: &MemEvent, dirty: bool, now: u64) {
        let req = self
            .mshr
            .lookup_front(ev.base_addr)
            .unwrap_or_else(|| panic!("{}: no MSHR head to respond for {}", self.name, ev.base_addr));
        let mut resp = req.make_response();
        resp.size = ev.payload.len().max(req.size);
        resp.payload = ev.payload.clone();
        resp.dirty = dirty;
        let deliver = now + self.cfg.mshr_latency;
        self.queue_down(resp, deliver);
    }

    fn send_ack_inv(&mut self, req: &MemEvent, now: u64) {
        let mut ack = req.make_response();
        ack.cmd = Cmd::AckInv; // the original need not have been an Inv
        ack.dst = self.downstream;
        ack.payload.clear();
        let deliver = now + self.cfg.tag_latency;
        self.queue_down(ack, deliver);
    }

    fn send_writeback_ack(&mut self, put: &MemEvent, now: u64) {
        let mut ack = MemEvent::new(self.name, put.base_addr, put.base_addr, Cmd::AckPut);
        ack.dst = put.src;
        ack.rqstr = put.src;
        ack.size = put.size;
        let deliver = now + self.cfg.tag_latency;
        self.queue_up(ack, deliver);
    }

    fn send_writeback_from_cache(&mut self, cmd: Cmd, idx: usize, rqstr: PeerId, now: u64) {
        let base = self.array.entry(idx).base_addr;
        let mut wb = MemEvent::new(self.name, base, base, cmd);
        wb.dst = self.downstream;
        wb.rqstr = rqstr;
        wb.size = self.cfg.line_size;
        if cmd == Cmd::PutM || self.cfg.writeback_clean_blocks {
            wb.payload = self.array.slot_data(idx).cloned().unwrap_or_default();
        }
        if cmd == Cmd::PutM {
            wb.dirty = true;
        }
        let deliver = self.line_send_time(idx, now, self.cfg.access_latency);
        self.queue_down(wb, deliver);
        self.array.entry_mut(idx).timestamp = deliver;
    }

    fn send_writeback_from_mshr(&mut self, cmd: Cmd, idx: usize, rqstr: PeerId, data: Vec<u8>, now: u64) {
        let base = self.array.entry(idx).base_addr;
        let mut wb = MemEvent::new(self.name, base, base, cmd);
        wb.dst = self.downstream;
        wb.rqstr = rqstr;
        wb.size = self.cfg.line_size;
        if cmd == Cmd::PutM || self.cfg.writeback_clean_blocks {
            wb.payload = data;
        }
        if cmd == Cmd::PutM {
            wb.dirty = true;
        }
        let deliver = now + self.cfg.access_latency;
        self.queue_down(wb, deliver);
        // the buffered payload went down with the writeback
        self.mshr.clear_data_buffer(base);
    }

    fn send_flush_response(&mut self, req: &MemEvent, success: bool, now: u64) {
        let mut resp = req.make_response();
        resp.success = success;
        let deliver = now + self.cfg.mshr_latency;
        self.queue_up(resp, deliver);
    }

    /// Forward a flush downstream, carrying whatever data is on hand.
    fn forward_flush_line(
        &mut self,
        orig: &MemEvent,
        idx: Option<usize>,
        dirty: bool,
        cmd: Cmd,
        now: u64,
    ) {
        let mut flush = MemEvent::new(self.name, orig.base_addr, orig.base_addr, cmd);
        flush.dst = self.downstream;
        flush.rqstr = orig.rqstr;
        flush.size = self.cfg.line_size;
        flush.dirty = dirty;
        if let Some(i) = idx {
            if let Some(data) = self.array.slot_data(i) {
                flush.payload = data.clone();
            } else if let Some(data) = self.mshr.data_buffer(orig.base_addr) {
                flush.payload = data.clone();
            } else if !orig.payload.is_empty() {
                flush.payload = orig.payload.clone();
            }
        }
        let base = idx.map_or(now, |i| now.max(self.array.entry(i).timestamp));
        let deliver = base + self.cfg.tag_latency;
        self.queue_down(flush, deliver);
        if let Some(i) = idx {
            self.array.entry_mut(i).timestamp = deliver - 1;
        }
    }

    /// Forward a request downstream (misses and upgrades).
    fn forward_message(
        &mut self,
        ev: &MemEvent,
        idx: usize,
        size: usize,
        payload: Option<Vec<u8>>,
        now: u64,
        replay: bool,
    ) -> u64 {
        let mut fwd = MemEvent::new(self.name, ev.base_addr, ev.addr, ev.cmd);
        fwd.dst = self.downstream;
        fwd.rqstr = ev.rqstr;
        fwd.size = size;
        fwd.mem_flags = ev.mem_flags;
        if let Some(data) = payload {
            fwd.payload = data;
        }
        let latency = if replay {
            self.cfg.mshr_latency
        } else {
            self.cfg.tag_latency
        };
        let deliver = self.line_send_time(idx, now, latency);
        self.queue_down(fwd, deliver);
        self.array.entry_mut(idx).timestamp = deliver;
        deliver
    }

    /// Bounce an event we cannot accept back to its sender.
    fn send_nack(&mut self, ev: &MemEvent, now: u64) {
        let nack = ev.make_nack(self.name);
        let deliver = now + self.cfg.tag_latency;
        self.queue_up(nack, deliver);
    }

    /// Re-issue a NACKed event on its original direction.
    fn resend_event(&mut self, ev: MemEvent, now: u64) {
        let deliver = now + self.cfg.mshr_latency;
        match ev.cmd {
            Cmd::Inv | Cmd::Fetch | Cmd::FetchInv | Cmd::FetchInvX | Cmd::ForceInv | Cmd::AckPut => {
                self.queue_up(ev, deliver)
            }
            _ => self.queue_down(ev, deliver),
        }
    }
}
