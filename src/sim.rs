// A minimal closed-loop system around the directory controller: scripted
// upstream children above, a flat memory below, and a delayed message queue
// carrying everything in between. Used by the demo driver and the
// randomized soak test; protocol-level unit tests drive the controller
// directly instead.

use std::collections::{HashMap, VecDeque};

use log::{debug, info, trace};

use crate::delayed_q::DelayedQ;
use crate::mesi::{Addr, Cmd, Config, DirController, MemEvent, PeerId};

/// One scripted operation of an upstream child.
#[derive(Clone, Debug)]
pub enum ChildOp {
    Read(Addr),
    Write(Addr, u8),
    Flush(Addr),
    FlushInv(Addr),
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum ChildState {
    Shared,
    Exclusive,
    Modified,
}

struct ChildBlock {
    state: ChildState,
    data: Vec<u8>,
    dirty: bool,
    last_used: u64,
}

/// A private L1-like child: holds a handful of blocks, issues its script,
/// and answers the directory's fetches and invalidations.
pub struct ChildModel {
    pub id: PeerId,
    ctrl: PeerId,
    line_size: usize,
    capacity: usize,
    blocks: HashMap<Addr, ChildBlock>,
    script: VecDeque<ChildOp>,
    outstanding: Option<(Addr, ChildOp)>,
    use_ctr: u64,
    pub ops_done: u64,
}

impl ChildModel {
    pub fn new(id: PeerId, ctrl: PeerId, line_size: usize, capacity: usize, script: Vec<ChildOp>) -> Self {
        ChildModel {
            id,
            ctrl,
            line_size,
            capacity,
            blocks: HashMap::new(),
            script: script.into(),
            outstanding: None,
            use_ctr: 0,
            ops_done: 0,
        }
    }

    pub fn done(&self) -> bool {
        self.script.is_empty() && self.outstanding.is_none()
    }

    fn request(&self, cmd: Cmd, addr: Addr) -> MemEvent {
        let mut ev = MemEvent::new(self.id, addr, addr, cmd);
        ev.dst = self.ctrl;
        ev.size = self.line_size;
        ev
    }

    fn touch(&mut self, addr: Addr) {
        self.use_ctr += 1;
        if let Some(b) = self.blocks.get_mut(&addr) {
            b.last_used = self.use_ctr;
        }
    }

    /// Install a block, evicting the least recently used one if needed.
    /// Evictions emit the matching Put* writeback.
    fn install(&mut self, addr: Addr, state: ChildState, data: Vec<u8>, out: &mut Vec<MemEvent>) {
        if !self.blocks.contains_key(&addr) && self.blocks.len() >= self.capacity {
            let victim = self
                .blocks
                .iter()
                .min_by_key(|(_, b)| b.last_used)
                .map(|(a, _)| *a)
                .unwrap();
            let block = self.blocks.remove(&victim).unwrap();
            let cmd = match block.state {
                ChildState::Shared => Cmd::PutS,
                ChildState::Exclusive => Cmd::PutE,
                ChildState::Modified => Cmd::PutM,
            };
            trace!("{}: evicting {} with {}", self.id, victim, cmd);
            let mut put = self.request(cmd, victim);
            put.payload = block.data;
            put.dirty = block.dirty;
            out.push(put);
        }
        self.use_ctr += 1;
        self.blocks.insert(
            addr,
            ChildBlock { state, data, dirty: false, last_used: self.use_ctr },
        );
    }

    /// Issue the next scripted operation when idle.
    pub fn tick(&mut self) -> Vec<MemEvent> {
        let mut out = Vec::new();
        if self.outstanding.is_some() {
            return out;
        }
        let Some(op) = self.script.pop_front() else {
            return out;
        };
        match op.clone() {
            ChildOp::Read(addr) => {
                if self.blocks.contains_key(&addr) {
                    self.touch(addr);
                    self.ops_done += 1;
                } else {
                    out.push(self.request(Cmd::GetS, addr));
                    self.outstanding = Some((addr, op));
                }
            }
            ChildOp::Write(addr, byte) => match self.blocks.get_mut(&addr) {
                Some(b) if b.state != ChildState::Shared => {
                    b.state = ChildState::Modified;
                    b.dirty = true;
                    b.data[0] = byte;
                    self.touch(addr);
                    self.ops_done += 1;
                }
                _ => {
                    out.push(self.request(Cmd::GetX, addr));
                    self.outstanding = Some((addr, op));
                }
            },
            ChildOp::Flush(addr) => {
                if let Some(b) = self.blocks.get(&addr) {
                    let mut flush = self.request(Cmd::FlushLine, addr);
                    flush.payload = b.data.clone();
                    flush.dirty = b.dirty;
                    out.push(flush);
                    self.outstanding = Some((addr, op));
                } else {
                    self.ops_done += 1;
                }
            }
            ChildOp::FlushInv(addr) => {
                if let Some(b) = self.blocks.get(&addr) {
                    let mut flush = self.request(Cmd::FlushLineInv, addr);
                    flush.payload = b.data.clone();
                    flush.dirty = b.dirty;
                    out.push(flush);
                    self.outstanding = Some((addr, op));
                } else {
                    self.ops_done += 1;
                }
            }
        }
        out
    }

    /// React to a message from the directory.
    pub fn handle(&mut self, ev: MemEvent) -> Vec<MemEvent> {
        let mut out = Vec::new();
        let addr = ev.base_addr;
        // Races are resolved by letting whatever we already have in flight
        // stand in: a written-back block's Put answers for an invalidation,
        // and an outstanding flush answers for the inval it crossed.
        let flushing_inv = matches!(&self.outstanding,
            Some((a, ChildOp::FlushInv(_))) if *a == addr);
        let flushing = flushing_inv
            || matches!(&self.outstanding, Some((a, ChildOp::Flush(_))) if *a == addr);
        match ev.cmd {
            Cmd::Inv | Cmd::ForceInv => {
                if flushing_inv {
                    // our FlushLineInv already carries the invalidation
                } else if self.blocks.remove(&addr).is_some() {
                    out.push(self.request(Cmd::AckInv, addr));
                }
            }
            Cmd::Fetch => {
                if flushing_inv {
                    // the flush payload answers the fetch
                } else if let Some(b) = self.blocks.get(&addr) {
                    let mut resp = self.request(Cmd::FetchResp, addr);
                    resp.payload = b.data.clone();
                    out.push(resp);
                }
            }
            Cmd::FetchInv => {
                if flushing_inv {
                    // covered by the FlushLineInv in flight
                } else if flushing {
                    // treat as a plain Inv; the flush carries the data
                    self.blocks.remove(&addr);
                    out.push(self.request(Cmd::AckInv, addr));
                } else if let Some(b) = self.blocks.remove(&addr) {
                    let mut resp = self.request(Cmd::FetchResp, addr);
                    resp.payload = b.data;
                    resp.dirty = b.dirty;
                    out.push(resp);
                }
            }
            Cmd::FetchInvX => {
                if flushing {
                    // the flush in flight downgrades us already
                } else if self.blocks.contains_key(&addr) {
                    let mut resp = self.request(Cmd::FetchXResp, addr);
                    let b = self.blocks.get_mut(&addr).unwrap();
                    resp.payload = b.data.clone();
                    resp.dirty = b.dirty;
                    b.state = ChildState::Shared;
                    b.dirty = false;
                    out.push(resp);
                }
            }
            Cmd::GetSResp => {
                self.install(addr, ChildState::Shared, ev.payload, &mut out);
                self.complete(addr, &mut out);
            }
            Cmd::GetXResp => {
                let was_write =
                    matches!(&self.outstanding, Some((a, ChildOp::Write(..))) if *a == addr);
                let state = if was_write { ChildState::Modified } else { ChildState::Exclusive };
                self.install(addr, state, ev.payload, &mut out);
                self.complete(addr, &mut out);
            }
            Cmd::FlushLineResp => {
                if let Some((a, op)) = self.outstanding.clone() {
                    if a == addr {
                        match op {
                            ChildOp::FlushInv(_) => {
                                self.blocks.remove(&addr);
                            }
                            _ => {
                                if let Some(b) = self.blocks.get_mut(&addr) {
                                    b.dirty = false;
                                    b.state = ChildState::Shared;
                                }
                            }
                        }
                        self.outstanding = None;
                        self.ops_done += 1;
                    }
                }
            }
            Cmd::AckPut => {} // writeback acknowledged, nothing held
            Cmd::NACK => {
                if let Some(inner) = ev.nacked {
                    debug!("{}: re-issuing NACKed {}", self.id, inner.cmd);
                    out.push(*inner);
                }
            }
            other => panic!("{}: child received unexpected {}", self.id, other),
        }
        out
    }

    /// Finish the outstanding operation now that the block arrived.
    fn complete(&mut self, addr: Addr, _out: &mut [MemEvent]) {
        if let Some((a, op)) = self.outstanding.clone() {
            if a != addr {
                return;
            }
            if let ChildOp::Write(_, byte) = op {
                if let Some(b) = self.blocks.get_mut(&addr) {
                    b.state = ChildState::Modified;
                    b.dirty = true;
                    b.data[0] = byte;
                }
            }
            self.outstanding = None;
            self.ops_done += 1;
        }
    }

    pub fn holds(&self, addr: Addr) -> bool {
        self.blocks.contains_key(&addr)
    }

    pub fn block_data(&self, addr: Addr) -> Option<&Vec<u8>> {
        self.blocks.get(&addr).map(|b| &b.data)
    }
}

/// Flat backing memory answering the directory's downstream traffic.
pub struct MemModel {
    pub id: PeerId,
    ctrl: PeerId,
    line_size: usize,
    send_acks: bool,
    store: HashMap<Addr, Vec<u8>>,
}

impl MemModel {
    pub fn new(id: PeerId, ctrl: PeerId, line_size: usize, send_acks: bool) -> Self {
        MemModel {
            id,
            ctrl,
            line_size,
            send_acks,
            store: HashMap::new(),
        }
    }

    fn line(&mut self, addr: Addr) -> Vec<u8> {
        let line_size = self.line_size;
        self.store
            .entry(addr)
            .or_insert_with(|| vec![(addr.0 / line_size as u64) as u8; line_size])
            .clone()
    }

    pub fn handle(&mut self, ev: MemEvent) -> Vec<MemEvent> {
        let mut out = Vec::new();
        let addr = ev.base_addr;
        match ev.cmd {
            Cmd::GetS | Cmd::GetX | Cmd::GetSX => {
                let mut resp = ev.make_response();
                // memory always grants exclusively
                resp.cmd = Cmd::GetXResp;
                resp.src = self.id;
                resp.payload = self.line(addr);
                resp.size = self.line_size;
                out.push(resp);
            }
            Cmd::PutS | Cmd::PutE | Cmd::PutM => {
                if !ev.payload.is_empty() {
                    self.store.insert(addr, ev.payload.clone());
                }
                if self.send_acks {
                    let mut ack = MemEvent::new(self.id, addr, addr, Cmd::AckPut);
                    ack.dst = self.ctrl;
                    out.push(ack);
                }
            }
            Cmd::FlushLine | Cmd::FlushLineInv => {
                if !ev.payload.is_empty() {
                    self.store.insert(addr, ev.payload.clone());
                }
                let mut resp = ev.make_response();
                resp.src = self.id;
                resp.success = true;
                out.push(resp);
            }
            Cmd::FetchResp | Cmd::AckInv => {} // nothing waiting down here
            other => debug!("{}: memory ignoring {}", self.id, other),
        }
        out
    }

    pub fn stored(&self, addr: Addr) -> Option<&Vec<u8>> {
        self.store.get(&addr)
    }
}

/// The wired-together system: children, directory controller, memory, and
/// the delayed queue that carries their messages.
pub struct System {
    pub ctrl: DirController,
    pub children: Vec<ChildModel>,
    pub mem: MemModel,
    q: DelayedQ<MemEvent>,
    time: u64,
    pub check_invariants: bool,
}

pub const CTRL_ID: PeerId = PeerId(100);
pub const MEM_ID: PeerId = PeerId(200);

impl System {
    pub fn new(cfg: Config, scripts: Vec<Vec<ChildOp>>, child_capacity: usize) -> System {
        let send_acks = cfg.expect_writeback_ack;
        let line_size = cfg.line_size;
        let ctrl = DirController::new(CTRL_ID, MEM_ID, cfg).expect("valid config");
        let children = scripts
            .into_iter()
            .enumerate()
            .map(|(i, script)| {
                ChildModel::new(PeerId(i as u32 + 1), CTRL_ID, line_size, child_capacity, script)
            })
            .collect();
        System {
            ctrl,
            children,
            mem: MemModel::new(MEM_ID, CTRL_ID, line_size, send_acks),
            q: DelayedQ::new(),
            time: 0,
            check_invariants: false,
        }
    }

    fn route(&mut self, ev: MemEvent) {
        let dst = ev.dst;
        let now = self.time;
        if dst == self.ctrl.name() {
            self.ctrl.handle_event(ev, now);
            self.drain_controller();
            if self.check_invariants {
                if let Err(msg) = self.ctrl.check_invariants() {
                    panic!("invariant violated at cycle {}: {}", now, msg);
                }
            }
        } else if dst == self.mem.id {
            for resp in self.mem.handle(ev) {
                self.q.send(resp, 1);
            }
        } else {
            let child = self
                .children
                .iter_mut()
                .find(|c| c.id == dst)
                .unwrap_or_else(|| panic!("no such child {}", dst));
            for resp in child.handle(ev) {
                self.q.send(resp, 1);
            }
        }
    }

    fn drain_controller(&mut self) {
        for pkt in self.ctrl.take_outgoing_up() {
            self.q.send_at(pkt.event, pkt.deliver_at.max(self.time + 1));
        }
        for pkt in self.ctrl.take_outgoing_down() {
            self.q.send_at(pkt.event, pkt.deliver_at.max(self.time + 1));
        }
    }

    pub fn tick(&mut self) {
        self.q.update_time(self.time);
        for i in 0..self.children.len() {
            for ev in self.children[i].tick() {
                self.q.send(ev, 1);
            }
        }
        while let Some(ev) = self.q.try_fetch() {
            self.route(ev);
        }
        self.time += 1;
    }

    /// Run until all scripts complete and the system drains, or the cycle
    /// budget runs out. Returns whether the system went quiet.
    pub fn run(&mut self, max_cycles: u64) -> bool {
        while self.time < max_cycles {
            self.tick();
            let quiet = self.q.is_empty()
                && self.children.iter().all(|c| c.done())
                && self.ctrl.mshr_outstanding() == 0;
            if quiet {
                info!("system quiet after {} cycles", self.time);
                return true;
            }
            // fast-forward across idle gaps
            if let Some(next) = self.q.next_time() {
                if next > self.time {
                    self.time = next;
                }
            }
        }
        false
    }

    pub fn time(&self) -> u64 {
        self.time
    }
}
