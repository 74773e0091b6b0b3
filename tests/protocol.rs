// Protocol-level tests driving the directory controller directly: cold
// misses, sharer invalidation, replacement/invalidation races, flushes,
// NACK handling and the configuration variants.

use cachesim_dir::mesi::{
    Action, Addr, Cmd, Config, DirController, MemEvent, OutPacket, PeerId, Protocol, State,
};

const CTRL: PeerId = PeerId(100);
const MEM: PeerId = PeerId(200);
const C1: PeerId = PeerId(1);
const C2: PeerId = PeerId(2);

const LINE: usize = 64;

fn a(n: u64) -> Addr {
    Addr(n * LINE as u64)
}

fn ctrl(cfg: Config) -> DirController {
    DirController::new(CTRL, MEM, cfg).unwrap()
}

fn ctrl_default() -> DirController {
    ctrl(Config::default())
}

/// Tiny geometry: one directory way and one data slot, every line collides.
fn tiny_cfg() -> Config {
    Config {
        dir_sets: 1,
        dir_assoc: 1,
        data_sets: 1,
        data_assoc: 1,
        ..Config::default()
    }
}

fn req(src: PeerId, cmd: Cmd, addr: Addr) -> MemEvent {
    let mut ev = MemEvent::new(src, addr, addr, cmd);
    ev.dst = CTRL;
    ev.size = LINE;
    ev
}

fn mem_resp(cmd: Cmd, addr: Addr, payload: Vec<u8>) -> MemEvent {
    let mut ev = MemEvent::new(MEM, addr, addr, cmd);
    ev.dst = CTRL;
    ev.size = payload.len();
    ev.payload = payload;
    ev
}

fn child_resp(src: PeerId, cmd: Cmd, addr: Addr, payload: Vec<u8>, dirty: bool) -> MemEvent {
    let mut ev = MemEvent::new(src, addr, addr, cmd);
    ev.dst = CTRL;
    ev.size = payload.len();
    ev.payload = payload;
    ev.dirty = dirty;
    ev
}

fn put(src: PeerId, cmd: Cmd, addr: Addr, payload: Vec<u8>, dirty: bool) -> MemEvent {
    let mut ev = req(src, cmd, addr);
    ev.payload = payload;
    ev.dirty = dirty;
    ev
}

fn find<'a>(pkts: &'a [OutPacket], cmd: Cmd) -> Option<&'a OutPacket> {
    pkts.iter().find(|p| p.event.cmd == cmd)
}

/// Bring a line to S with `child` as the only sharer, uncached locally.
fn line_to_shared(c: &mut DirController, addr: Addr, child: PeerId, now: u64) {
    assert_eq!(c.handle_event(req(child, Cmd::GetS, addr), now), Action::Stall);
    c.take_outgoing_down();
    assert_eq!(
        c.handle_event(mem_resp(Cmd::GetSResp, addr, vec![0; LINE]), now + 5),
        Action::Done
    );
    c.take_outgoing_up();
    assert_eq!(c.line_state(addr), Some(State::S));
    assert_eq!(c.sharers_of(addr), vec![child]);
}

/// Bring a line to M with `child` as owner, uncached locally.
fn line_to_owned(c: &mut DirController, addr: Addr, child: PeerId, now: u64) {
    assert_eq!(c.handle_event(req(child, Cmd::GetX, addr), now), Action::Stall);
    c.take_outgoing_down();
    assert_eq!(
        c.handle_event(mem_resp(Cmd::GetXResp, addr, vec![0; LINE]), now + 5),
        Action::Done
    );
    c.take_outgoing_up();
    assert_eq!(c.line_state(addr), Some(State::M));
    assert_eq!(c.owner_of(addr), Some(child));
}

#[test]
fn scenario_a_cold_read_grants_exclusive() {
    let mut c = ctrl_default();

    assert_eq!(c.handle_event(req(C1, Cmd::GetS, a(0)), 10), Action::Stall);
    assert_eq!(c.line_state(a(0)), Some(State::IS));
    let down = c.take_outgoing_down();
    let fwd = find(&down, Cmd::GetS).expect("miss forwarded downstream");
    assert_eq!(fwd.dst, MEM);
    assert_eq!(fwd.rqstr, C1);
    assert!(fwd.deliver_at >= 10 + c.config().tag_latency);

    let payload = vec![0xAA; LINE];
    assert_eq!(
        c.handle_event(mem_resp(Cmd::GetXResp, a(0), payload.clone()), 20),
        Action::Done
    );
    assert_eq!(c.line_state(a(0)), Some(State::E));
    assert_eq!(c.owner_of(a(0)), Some(C1));
    assert!(c.sharers_of(a(0)).is_empty());

    let up = c.take_outgoing_up();
    let resp = find(&up, Cmd::GetXResp).expect("exclusive grant upstream");
    assert_eq!(resp.dst, C1);
    assert_eq!(resp.payload, payload);
    c.check_invariants().unwrap();
}

#[test]
fn msi_read_never_grants_ownership() {
    let mut c = ctrl(Config { protocol: Protocol::MSI, ..Config::default() });

    c.handle_event(req(C1, Cmd::GetS, a(0)), 0);
    c.take_outgoing_down();
    c.handle_event(mem_resp(Cmd::GetXResp, a(0), vec![1; LINE]), 5);

    assert_eq!(c.line_state(a(0)), Some(State::S));
    assert_eq!(c.owner_of(a(0)), None);
    assert_eq!(c.sharers_of(a(0)), vec![C1]);
    let up = c.take_outgoing_up();
    assert!(find(&up, Cmd::GetSResp).is_some());
    assert!(find(&up, Cmd::GetXResp).is_none());
}

#[test]
fn scenario_b_write_invalidates_sharers() {
    let mut c = ctrl_default();
    line_to_shared(&mut c, a(0), C1, 0);

    // second reader fetches the data from the first sharer
    assert_eq!(c.handle_event(req(C2, Cmd::GetS, a(0)), 10), Action::Stall);
    assert_eq!(c.line_state(a(0)), Some(State::S_D));
    let up = c.take_outgoing_up();
    assert_eq!(find(&up, Cmd::Fetch).unwrap().dst, C1);
    assert_eq!(
        c.handle_event(child_resp(C1, Cmd::FetchResp, a(0), vec![7; LINE], false), 15),
        Action::Done
    );
    c.take_outgoing_up();
    assert_eq!(c.sharers_of(a(0)), vec![C1, C2]);

    // upgrade: C2 writes, C1 must be invalidated
    assert_eq!(c.handle_event(req(C2, Cmd::GetX, a(0)), 20), Action::Stall);
    assert_eq!(c.line_state(a(0)), Some(State::SM_Inv));
    let down = c.take_outgoing_down();
    let fwd = find(&down, Cmd::GetX).expect("upgrade forwarded");
    let up = c.take_outgoing_up();
    let inv = find(&up, Cmd::Inv).expect("sharer invalidated");
    assert_eq!(inv.dst, C1);
    assert!(inv.deliver_at > fwd.deliver_at, "per-line sends stay ordered");
    assert_eq!(c.acks_pending(a(0)), 1);

    assert_eq!(
        c.handle_event(child_resp(C1, Cmd::AckInv, a(0), vec![], false), 25),
        Action::Ignore
    );
    assert_eq!(c.line_state(a(0)), Some(State::SM));
    assert_eq!(c.acks_pending(a(0)), 0);

    let payload = vec![0xBB; LINE];
    assert_eq!(
        c.handle_event(mem_resp(Cmd::GetXResp, a(0), payload.clone()), 30),
        Action::Done
    );
    assert_eq!(c.line_state(a(0)), Some(State::M));
    assert_eq!(c.owner_of(a(0)), Some(C2));
    assert!(c.sharers_of(a(0)).is_empty());
    let up = c.take_outgoing_up();
    assert_eq!(find(&up, Cmd::GetXResp).unwrap().payload, payload);
    c.check_invariants().unwrap();
}

#[test]
fn scenario_c_fetch_inv_races_with_putm() {
    let mut c = ctrl_default();
    line_to_owned(&mut c, a(0), C1, 0);

    // downstream wants the line back
    let mut fetch_inv = MemEvent::new(MEM, a(0), a(0), Cmd::FetchInv);
    fetch_inv.dst = CTRL;
    assert_eq!(c.handle_event(fetch_inv, 10), Action::Stall);
    assert_eq!(c.line_state(a(0)), Some(State::M_Inv));
    let up = c.take_outgoing_up();
    assert_eq!(find(&up, Cmd::FetchInv).unwrap().dst, C1);

    // the owner's PutM was already on the wire
    let payload = vec![0xCD; LINE];
    c.handle_event(put(C1, Cmd::PutM, a(0), payload.clone(), true), 12);

    assert_eq!(c.line_state(a(0)), Some(State::I));
    assert_eq!(c.owner_of(a(0)), None);
    let down = c.take_outgoing_down();
    let resp = find(&down, Cmd::FetchResp).expect("fetch answered from the raced Put");
    assert_eq!(resp.payload, payload);
    assert!(resp.dirty);
    assert_eq!(resp.dst, MEM);

    // a stray AckPut afterwards is side-effect free
    let mut ack = MemEvent::new(MEM, a(0), a(0), Cmd::AckPut);
    ack.dst = CTRL;
    assert_eq!(c.handle_event(ack, 20), Action::Done);
    assert!(!c.writeback_pending(a(0)));
    c.check_invariants().unwrap();
}

#[test]
fn scenario_d_evicting_uncached_line_fetches_from_sharer() {
    let mut c = ctrl(tiny_cfg());
    line_to_shared(&mut c, a(0), C1, 0);

    // a(1) maps to the same (only) directory way; a(0) must leave first
    assert_eq!(c.handle_event(req(C2, Cmd::GetS, a(1)), 10), Action::Stall);
    assert_eq!(c.line_state(a(0)), Some(State::SI));
    let up = c.take_outgoing_up();
    assert_eq!(find(&up, Cmd::FetchInv).unwrap().dst, C1);
    assert_eq!(c.acks_pending(a(0)), 1);

    // data comes back from the sharer, the writeback goes down, and the
    // stalled request replays into the freed entry
    let payload = vec![0xD0; LINE];
    c.handle_event(child_resp(C1, Cmd::FetchResp, a(0), payload.clone(), false), 20);

    let down = c.take_outgoing_down();
    let wb = find(&down, Cmd::PutS).expect("eviction writeback");
    assert_eq!(wb.payload, payload);
    assert_eq!(find(&down, Cmd::GetS).unwrap().base_addr, a(1));
    assert_eq!(c.line_state(a(1)), Some(State::IS));
    assert_eq!(c.line_state(a(0)), None, "entry re-tagged for the new line");
    c.check_invariants().unwrap();
}

#[test]
fn scenario_e_flush_line_inv_with_foreign_owner() {
    let mut c = ctrl_default();
    line_to_owned(&mut c, a(0), C1, 0);

    assert_eq!(c.handle_event(req(C2, Cmd::FlushLineInv, a(0)), 10), Action::Stall);
    assert_eq!(c.line_state(a(0)), Some(State::M_Inv));
    let up = c.take_outgoing_up();
    assert_eq!(find(&up, Cmd::FetchInv).unwrap().dst, C1);

    let payload = vec![0xEE; LINE];
    c.handle_event(child_resp(C1, Cmd::FetchResp, a(0), payload.clone(), true), 20);
    assert_eq!(c.line_state(a(0)), Some(State::I_B));
    let down = c.take_outgoing_down();
    let fwd = find(&down, Cmd::FlushLineInv).expect("flush forwarded");
    assert_eq!(fwd.payload, payload);
    assert!(fwd.dirty);

    let mut resp = mem_resp(Cmd::FlushLineResp, a(0), vec![]);
    resp.success = true;
    assert_eq!(c.handle_event(resp, 30), Action::Done);
    assert_eq!(c.line_state(a(0)), Some(State::I));
    let up = c.take_outgoing_up();
    let flush_resp = find(&up, Cmd::FlushLineResp).expect("flusher unblocked");
    assert_eq!(flush_resp.dst, C2);
    assert!(flush_resp.success);
    c.check_invariants().unwrap();
}

#[test]
fn scenario_f_nacked_fetch_to_former_sharer_is_dropped() {
    let mut c = ctrl_default();

    // line is gone entirely: nothing to resend to
    let mut stale = MemEvent::new(CTRL, a(0), a(0), Cmd::FetchInv);
    stale.dst = C1;
    let nack = stale.make_nack(C1);
    assert_eq!(c.handle_event(nack, 10), Action::Done);
    assert!(c.take_outgoing_up().is_empty());
    assert!(c.take_outgoing_down().is_empty());
    assert_eq!(c.stats().nacks_received, 1);
    assert_eq!(c.stats().nacks_resent, 0);
}

#[test]
fn nacked_fetch_to_current_owner_is_resent() {
    let mut c = ctrl_default();
    line_to_owned(&mut c, a(0), C1, 0);

    let mut sent = MemEvent::new(CTRL, a(0), a(0), Cmd::FetchInvX);
    sent.dst = C1;
    c.handle_event(sent.make_nack(C1), 10);
    let up = c.take_outgoing_up();
    assert_eq!(find(&up, Cmd::FetchInvX).unwrap().dst, C1);
    assert_eq!(c.stats().nacks_resent, 1);
}

#[test]
fn nacked_writeback_is_resent_without_ack_tracking() {
    let mut c = ctrl_default();
    let mut wb = MemEvent::new(CTRL, a(0), a(0), Cmd::PutS);
    wb.dst = MEM;
    c.handle_event(wb.make_nack(MEM), 10);
    let down = c.take_outgoing_down();
    assert!(find(&down, Cmd::PutS).is_some());
}

#[test]
fn last_level_upgrades_shared_line_locally() {
    let mut c = ctrl(Config { last_level: true, ..Config::default() });
    line_to_shared(&mut c, a(0), C1, 0);

    assert_eq!(c.handle_event(req(C1, Cmd::GetX, a(0)), 10), Action::Done);
    assert_eq!(c.line_state(a(0)), Some(State::M));
    assert_eq!(c.owner_of(a(0)), Some(C1));
    assert!(c.take_outgoing_down().is_empty(), "no forward at the last level");
    let up = c.take_outgoing_up();
    assert!(find(&up, Cmd::GetXResp).is_some());
    c.check_invariants().unwrap();
}

#[test]
fn second_getx_stalls_until_owner_reclaimed() {
    let mut c = ctrl_default();
    line_to_owned(&mut c, a(0), C1, 0);

    assert_eq!(c.handle_event(req(C2, Cmd::GetX, a(0)), 10), Action::Stall);
    assert_eq!(c.line_state(a(0)), Some(State::M_Inv));
    let up = c.take_outgoing_up();
    assert_eq!(find(&up, Cmd::FetchInv).unwrap().dst, C1);

    let payload = vec![0x5F; LINE];
    c.handle_event(child_resp(C1, Cmd::FetchResp, a(0), payload.clone(), true), 20);
    assert_eq!(c.line_state(a(0)), Some(State::M));
    assert_eq!(c.owner_of(a(0)), Some(C2), "ownership moved exactly once");
    let up = c.take_outgoing_up();
    assert_eq!(find(&up, Cmd::GetXResp).unwrap().payload, payload);
    c.check_invariants().unwrap();
}

#[test]
fn clean_writeback_omits_payload_when_configured() {
    let mut c = ctrl(Config { writeback_clean_blocks: false, ..tiny_cfg() });

    // E line whose data came back via the owner's clean PutE
    c.handle_event(req(C1, Cmd::GetS, a(0)), 0);
    c.take_outgoing_down();
    c.handle_event(mem_resp(Cmd::GetXResp, a(0), vec![3; LINE]), 5);
    c.take_outgoing_up();
    assert_eq!(c.line_state(a(0)), Some(State::E));
    c.handle_event(put(C1, Cmd::PutE, a(0), vec![3; LINE], false), 10);
    c.take_outgoing_up();
    assert!(c.is_locally_cached(a(0)));

    // replacement: the clean PutE goes down without its payload
    c.handle_event(req(C2, Cmd::GetS, a(1)), 20);
    let down = c.take_outgoing_down();
    let wb = find(&down, Cmd::PutE).expect("clean writeback");
    assert!(wb.payload.is_empty());
    assert!(!wb.dirty);
}

#[test]
fn inv_racing_with_tracked_writeback_acts_as_ackput() {
    let mut c = ctrl(Config { expect_writeback_ack: true, ..tiny_cfg() });
    line_to_shared(&mut c, a(0), C1, 0);

    // sharer writes the line back; the directory now holds the only copy
    c.handle_event(put(C1, Cmd::PutS, a(0), vec![9; LINE], false), 5);
    c.take_outgoing_up();

    // eviction writes it downstream and waits for the AckPut
    c.handle_event(req(C2, Cmd::GetS, a(1)), 10);
    let down = c.take_outgoing_down();
    assert!(find(&down, Cmd::PutS).is_some());
    assert!(c.writeback_pending(a(0)));

    // an Inv crossing the writeback counts as its ack; both sides drop
    let mut inv = MemEvent::new(MEM, a(0), a(0), Cmd::Inv);
    inv.dst = CTRL;
    assert_eq!(c.handle_event(inv, 20), Action::Done);
    assert!(!c.writeback_pending(a(0)));
    assert!(c.take_outgoing_up().is_empty());
    assert!(c.take_outgoing_down().is_empty());
}

#[test]
fn fetch_answered_from_local_copy() {
    let mut c = ctrl_default();
    line_to_shared(&mut c, a(0), C1, 0);
    let payload = vec![0x42; LINE];
    c.handle_event(put(C1, Cmd::PutS, a(0), payload.clone(), false), 5);
    c.take_outgoing_up();
    assert!(c.is_locally_cached(a(0)));

    let mut fetch = MemEvent::new(MEM, a(0), a(0), Cmd::Fetch);
    fetch.dst = CTRL;
    assert_eq!(c.handle_event(fetch, 10), Action::Done);
    let down = c.take_outgoing_down();
    let resp = find(&down, Cmd::FetchResp).unwrap();
    assert_eq!(resp.payload, payload);
    assert!(!resp.dirty);
    assert_eq!(c.line_state(a(0)), Some(State::S));
}

#[test]
fn queued_request_replays_after_head_completes() {
    let mut c = ctrl_default();

    c.handle_event(req(C1, Cmd::GetS, a(0)), 0);
    c.take_outgoing_down();
    // second request hits the line mid-transition and queues behind
    assert_eq!(c.handle_event(req(C2, Cmd::GetS, a(0)), 1), Action::Stall);
    assert_eq!(c.mshr_depth(a(0)), 2);

    c.handle_event(mem_resp(Cmd::GetSResp, a(0), vec![4; LINE]), 10);
    // C1 answered; C2 replayed into a fetch from the new sharer
    let up = c.take_outgoing_up();
    assert_eq!(find(&up, Cmd::GetSResp).unwrap().dst, C1);
    assert_eq!(find(&up, Cmd::Fetch).unwrap().dst, C1);
    assert_eq!(c.line_state(a(0)), Some(State::S_D));

    c.handle_event(child_resp(C1, Cmd::FetchResp, a(0), vec![4; LINE], false), 20);
    let up = c.take_outgoing_up();
    assert_eq!(find(&up, Cmd::GetSResp).unwrap().dst, C2);
    assert_eq!(c.sharers_of(a(0)), vec![C1, C2]);
    assert_eq!(c.mshr_depth(a(0)), 0);
}

#[test]
fn flush_line_forwards_and_settles_back_to_shared() {
    let mut c = ctrl_default();
    line_to_shared(&mut c, a(0), C1, 0);

    assert_eq!(c.handle_event(req(C1, Cmd::FlushLine, a(0)), 10), Action::Stall);
    assert_eq!(c.line_state(a(0)), Some(State::S_B));
    let down = c.take_outgoing_down();
    assert!(find(&down, Cmd::FlushLine).is_some());

    let mut resp = mem_resp(Cmd::FlushLineResp, a(0), vec![]);
    resp.success = true;
    c.handle_event(resp, 20);
    assert_eq!(c.line_state(a(0)), Some(State::S));
    let up = c.take_outgoing_up();
    assert!(find(&up, Cmd::FlushLineResp).unwrap().success);
    assert_eq!(c.sharers_of(a(0)), vec![C1], "flush preserves the sharer");
}

/// Park a PutM behind a busy data array, then resolve it via FetchInv.
#[test]
fn parked_putm_resolved_by_fetch_inv() {
    let cfg = Config {
        dir_sets: 2,
        dir_assoc: 2,
        data_sets: 1,
        data_assoc: 1,
        ..Config::default()
    };
    let mut c = ctrl(cfg);

    // a(0): shared, locally cached, then stuck in S_Inv holding the only slot
    line_to_shared(&mut c, a(0), C1, 0);
    c.handle_event(put(C1, Cmd::PutS, a(0), vec![1; LINE], false), 2);
    c.take_outgoing_up();
    c.handle_event(req(C2, Cmd::GetS, a(0)), 4);
    c.take_outgoing_up();
    assert_eq!(c.sharers_of(a(0)), vec![C2]);
    let mut inv = MemEvent::new(MEM, a(0), a(0), Cmd::Inv);
    inv.dst = CTRL;
    assert_eq!(c.handle_event(inv, 6), Action::Stall);
    assert_eq!(c.line_state(a(0)), Some(State::S_Inv));
    c.take_outgoing_up();

    // a(1): owned by C1; its PutM cannot get a data slot and parks
    line_to_owned(&mut c, a(1), C1, 10);
    let payload = vec![0xAB; LINE];
    assert_eq!(
        c.handle_event(put(C1, Cmd::PutM, a(1), payload.clone(), true), 12),
        Action::Stall
    );
    assert_eq!(c.mshr_depth(a(1)), 1);
    assert_eq!(c.line_state(a(1)), Some(State::M));

    // FetchInv finds the parked PutM: ack it, answer from its payload
    let mut fetch_inv = MemEvent::new(MEM, a(1), a(1), Cmd::FetchInv);
    fetch_inv.dst = CTRL;
    assert_eq!(c.handle_event(fetch_inv, 14), Action::Done);
    assert_eq!(c.line_state(a(1)), Some(State::I));
    assert_eq!(c.owner_of(a(1)), None);
    let up = c.take_outgoing_up();
    assert_eq!(find(&up, Cmd::AckPut).unwrap().dst, C1);
    let down = c.take_outgoing_down();
    let resp = find(&down, Cmd::FetchResp).unwrap();
    assert_eq!(resp.payload, payload);
    assert!(resp.dirty);
    c.check_invariants().unwrap();
}

/// An Inv broadcast absorbs a parked PutS instead of waiting for an ack
/// that will never come.
#[test]
fn inv_absorbs_parked_puts() {
    let cfg = Config {
        dir_sets: 2,
        dir_assoc: 2,
        data_sets: 1,
        data_assoc: 1,
        ..Config::default()
    };
    let mut c = ctrl(cfg);

    // occupy the only data slot with an in-transition line
    line_to_shared(&mut c, a(0), C1, 0);
    c.handle_event(put(C1, Cmd::PutS, a(0), vec![1; LINE], false), 2);
    c.take_outgoing_up();
    c.handle_event(req(C2, Cmd::GetS, a(0)), 4);
    c.take_outgoing_up();
    let mut inv = MemEvent::new(MEM, a(0), a(0), Cmd::Inv);
    inv.dst = CTRL;
    c.handle_event(inv, 6);
    c.take_outgoing_up();

    // a(1): shared by C1, whose PutS parks for want of a slot
    line_to_shared(&mut c, a(1), C1, 10);
    assert_eq!(
        c.handle_event(put(C1, Cmd::PutS, a(1), vec![2; LINE], false), 12),
        Action::Stall
    );
    assert_eq!(c.mshr_depth(a(1)), 1);

    let mut inv = MemEvent::new(MEM, a(1), a(1), Cmd::Inv);
    inv.dst = CTRL;
    assert_eq!(c.handle_event(inv, 14), Action::Done);
    assert_eq!(c.line_state(a(1)), Some(State::I));
    assert!(c.sharers_of(a(1)).is_empty());
    assert_eq!(c.acks_pending(a(1)), 0);
    assert_eq!(c.mshr_depth(a(1)), 0, "parked Put absorbed");
    let down = c.take_outgoing_down();
    assert!(find(&down, Cmd::AckInv).is_some());
}

#[test]
fn getx_in_exclusive_promotes_before_granting() {
    let mut c = ctrl_default();

    // E with no owner: data lives locally after a clean PutE
    c.handle_event(req(C1, Cmd::GetS, a(0)), 0);
    c.take_outgoing_down();
    c.handle_event(mem_resp(Cmd::GetXResp, a(0), vec![6; LINE]), 5);
    c.take_outgoing_up();
    c.handle_event(put(C1, Cmd::PutE, a(0), vec![6; LINE], false), 8);
    c.take_outgoing_up();
    assert_eq!(c.line_state(a(0)), Some(State::E));

    assert_eq!(c.handle_event(req(C2, Cmd::GetX, a(0)), 10), Action::Done);
    assert_eq!(c.line_state(a(0)), Some(State::M));
    assert_eq!(c.owner_of(a(0)), Some(C2));
    let up = c.take_outgoing_up();
    assert_eq!(find(&up, Cmd::GetXResp).unwrap().payload, vec![6; LINE]);
}
