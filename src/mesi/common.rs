// Shared protocol vocabulary: addresses, peers, commands, coherence states,
// events, handler outcomes and the controller configuration.

use std::fmt;

use crate::error::SimError;

/// Byte address. Line-granular identities are obtained via `line_base`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Addr(pub u64);

impl Addr {
    /// Align down to the containing cache line.
    pub fn line_base(self, line_size: usize) -> Addr {
        Addr(self.0 & !(line_size as u64 - 1))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Identifier of a component on the memory hierarchy: an upstream child,
/// the downstream level, or this controller itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protocol {
    MESI,
    MSI,
}

/// Protocol message commands, grouped the way the dispatcher routes them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Cmd {
    // data requests from upstream
    GetS,
    GetX,
    GetSX,
    // replacements from upstream
    PutS,
    PutE,
    PutM,
    // flushes from upstream
    FlushLine,
    FlushLineInv,
    // invalidations / fetches (issued by a directory towards sharers or owners)
    Inv,
    Fetch,
    FetchInv,
    FetchInvX,
    ForceInv,
    // responses
    GetSResp,
    GetXResp,
    FlushLineResp,
    FetchResp,
    FetchXResp,
    AckInv,
    AckPut,
    // interconnect hazard
    NACK,
}

impl Cmd {
    pub fn is_writeback(self) -> bool {
        matches!(self, Cmd::PutS | Cmd::PutE | Cmd::PutM)
    }

    /// The response command paired with a request, for `MemEvent::make_response`.
    pub fn response(self) -> Cmd {
        match self {
            Cmd::GetS => Cmd::GetSResp,
            Cmd::GetX | Cmd::GetSX => Cmd::GetXResp,
            Cmd::FlushLine | Cmd::FlushLineInv => Cmd::FlushLineResp,
            Cmd::Fetch | Cmd::FetchInv => Cmd::FetchResp,
            Cmd::FetchInvX => Cmd::FetchXResp,
            Cmd::Inv | Cmd::ForceInv => Cmd::AckInv,
            _ => panic!("no response command defined for {:?}", self),
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Outcome of handling one event, as seen by the dispatcher.
///
/// `Done`: event consumed, the transaction at the head of the MSHR completed.
/// `Stall`: event parked, retry when the line makes progress.
/// `Block`: event parked, do not retry before the current head completes.
/// `Ignore`: event consumed (absorbed) without completing the head.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Action {
    Done,
    Stall,
    Block,
    Ignore,
}

/// Per-line coherence state of the internal directory.
///
/// Stable: I, S, E, M. Upgrades in flight: IS, IM, SM. Writeback to the
/// lower level in flight: SI, EI, MI. Invalidation or downgrade of upstream
/// copies in flight: *_Inv, *_InvX. Data fetch from a sharer in flight: *_D.
/// Flush forwarded and awaiting the response: S_B, I_B, SB_Inv.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum State {
    I,
    S,
    E,
    M,
    IS,
    IM,
    SM,
    SI,
    EI,
    MI,
    S_Inv,
    E_Inv,
    M_Inv,
    SM_Inv,
    E_InvX,
    M_InvX,
    S_D,
    E_D,
    M_D,
    SM_D,
    S_B,
    I_B,
    SB_Inv,
}

impl State {
    pub fn is_stable(self) -> bool {
        matches!(self, State::I | State::S | State::E | State::M)
    }

    pub fn in_transition(self) -> bool {
        !self.is_stable()
    }

    /// The state a transient data-fetch or writeback state settles into once
    /// its outstanding acknowledgments arrive.
    pub fn settled(self) -> State {
        match self {
            State::S_D => State::S,
            State::E_D => State::E,
            State::M_D => State::M,
            State::SM_D => State::SM,
            State::E_InvX => State::E,
            State::M_InvX => State::M,
            State::SI | State::EI | State::MI => State::I,
            s => s,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One protocol message. Payload may be empty (control messages, clean
/// writebacks with payload suppression). `rqstr` names the original
/// requestor across forwards; `src`/`dst` are per-hop.
#[derive(Clone, Debug)]
pub struct MemEvent {
    pub cmd: Cmd,
    pub addr: Addr,
    pub base_addr: Addr,
    pub src: PeerId,
    pub dst: PeerId,
    pub rqstr: PeerId,
    pub size: usize,
    pub payload: Vec<u8>,
    pub dirty: bool,
    pub success: bool,
    pub prefetch: bool,
    pub mem_flags: u32,
    pub in_progress: bool,
    pub nacked: Option<Box<MemEvent>>,
}

impl MemEvent {
    pub fn new(src: PeerId, base_addr: Addr, addr: Addr, cmd: Cmd) -> MemEvent {
        MemEvent {
            cmd,
            addr,
            base_addr,
            src,
            dst: src,
            rqstr: src,
            size: 0,
            payload: Vec::new(),
            dirty: false,
            success: false,
            prefetch: false,
            mem_flags: 0,
            in_progress: false,
            nacked: None,
        }
    }

    /// Build the matching response: command paired via `Cmd::response`,
    /// src/dst swapped, requestor, size and memory flags carried over.
    pub fn make_response(&self) -> MemEvent {
        let mut resp = MemEvent::new(self.dst, self.base_addr, self.addr, self.cmd.response());
        resp.dst = self.src;
        resp.rqstr = self.rqstr;
        resp.size = self.size;
        resp.mem_flags = self.mem_flags;
        resp
    }

    /// Wrap this event in a NACK heading back to its sender.
    pub fn make_nack(&self, from: PeerId) -> MemEvent {
        let mut nack = MemEvent::new(from, self.base_addr, self.addr, Cmd::NACK);
        nack.dst = self.src;
        nack.nacked = Some(Box::new(self.clone()));
        nack
    }
}

/// An event scheduled onto one of the two directional outgoing queues.
/// `bytes` accounts for header plus payload for link utilization stats.
#[derive(Clone, Debug)]
pub struct OutPacket {
    pub event: MemEvent,
    pub deliver_at: u64,
    pub bytes: usize,
}

impl std::ops::Deref for OutPacket {
    type Target = MemEvent;
    fn deref(&self) -> &MemEvent {
        &self.event
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub protocol: Protocol,         //              MESI
    pub last_level: bool,           //              false
    pub expect_writeback_ack: bool, //              false
    pub writeback_clean_blocks: bool, //            true
    pub tag_latency: u64,           // cycles       2
    pub mshr_latency: u64,          // cycles       2
    pub access_latency: u64,        // cycles       6
    pub line_size: usize,           // bytes        64
    pub packet_header_bytes: usize, // bytes        8
    pub mshr_size: usize,           // entries      16
    pub dir_sets: usize,            //              64
    pub dir_assoc: usize,           // entries      8
    pub data_sets: usize,           //              32
    pub data_assoc: usize,          // lines        4
}

impl Default for Config {
    fn default() -> Config {
        Config {
            protocol: Protocol::MESI,
            last_level: false,
            expect_writeback_ack: false,
            writeback_clean_blocks: true,
            tag_latency: 2,
            mshr_latency: 2,
            access_latency: 6,
            line_size: 64,
            packet_header_bytes: 8,
            mshr_size: 16,
            dir_sets: 64,
            dir_assoc: 8,
            data_sets: 32,
            data_assoc: 4,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), SimError> {
        if !self.line_size.is_power_of_two() {
            return Err(SimError::Config(format!(
                "line_size must be a power of two, got {}",
                self.line_size
            )));
        }
        if self.mshr_size < 2 {
            return Err(SimError::Config("mshr_size must be at least 2".into()));
        }
        if self.tag_latency == 0 || self.mshr_latency == 0 || self.access_latency == 0 {
            return Err(SimError::Config("latencies must be at least one cycle".into()));
        }
        if self.dir_sets == 0 || self.dir_assoc == 0 || self.data_sets == 0 || self.data_assoc == 0 {
            return Err(SimError::Config("array geometry must be non-zero".into()));
        }
        if self.dir_sets * self.dir_assoc < self.data_sets * self.data_assoc {
            return Err(SimError::Config(
                "directory must track at least as many lines as the data array holds".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_base_masks_low_bits() {
        assert_eq!(Addr(0x1234).line_base(64), Addr(0x1200));
        assert_eq!(Addr(0x1200).line_base(64), Addr(0x1200));
    }

    #[test]
    fn response_commands_pair_up() {
        assert_eq!(Cmd::GetS.response(), Cmd::GetSResp);
        assert_eq!(Cmd::GetSX.response(), Cmd::GetXResp);
        assert_eq!(Cmd::FetchInv.response(), Cmd::FetchResp);
        assert_eq!(Cmd::FetchInvX.response(), Cmd::FetchXResp);
        assert_eq!(Cmd::ForceInv.response(), Cmd::AckInv);
        assert_eq!(Cmd::FlushLineInv.response(), Cmd::FlushLineResp);
    }

    #[test]
    fn make_response_swaps_endpoints() {
        let mut req = MemEvent::new(PeerId(1), Addr(0x40), Addr(0x48), Cmd::GetS);
        req.dst = PeerId(9);
        req.rqstr = PeerId(1);
        req.size = 64;
        let resp = req.make_response();
        assert_eq!(resp.cmd, Cmd::GetSResp);
        assert_eq!(resp.src, PeerId(9));
        assert_eq!(resp.dst, PeerId(1));
        assert_eq!(resp.rqstr, PeerId(1));
        assert_eq!(resp.size, 64);
    }

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }
}
