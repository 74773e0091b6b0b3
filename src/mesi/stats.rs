// Event/state occurrence counters. Every handled event records its
// (command, line state) pair regardless of outcome, so dropped races and
// absorbed acks remain visible in the final report.

use std::collections::HashMap;
use std::fmt::Write as _;

use super::common::{Cmd, State};

#[derive(Default)]
pub struct Stats {
    event_state: HashMap<(Cmd, State), u64>,
    sent_up: HashMap<Cmd, u64>,
    sent_down: HashMap<Cmd, u64>,
    evictions: HashMap<State, u64>,
    pub misses: u64,
    pub hits: u64,
    pub prefetch_evict: u64,
    pub prefetch_hit: u64,
    pub prefetch_inv: u64,
    pub prefetch_redundant: u64,
    pub prefetch_upgrade_miss: u64,
    pub nacks_received: u64,
    pub nacks_resent: u64,
}

impl Stats {
    pub fn record_state_event(&mut self, cmd: Cmd, state: State) {
        *self.event_state.entry((cmd, state)).or_insert(0) += 1;
    }

    pub fn record_sent_up(&mut self, cmd: Cmd) {
        *self.sent_up.entry(cmd).or_insert(0) += 1;
    }

    pub fn record_sent_down(&mut self, cmd: Cmd) {
        *self.sent_down.entry(cmd).or_insert(0) += 1;
    }

    pub fn record_eviction(&mut self, state: State) {
        *self.evictions.entry(state).or_insert(0) += 1;
    }

    pub fn event_state_count(&self, cmd: Cmd, state: State) -> u64 {
        self.event_state.get(&(cmd, state)).copied().unwrap_or(0)
    }

    pub fn sent_up_count(&self, cmd: Cmd) -> u64 {
        self.sent_up.get(&cmd).copied().unwrap_or(0)
    }

    pub fn sent_down_count(&self, cmd: Cmd) -> u64 {
        self.sent_down.get(&cmd).copied().unwrap_or(0)
    }

    pub fn eviction_count(&self, state: State) -> u64 {
        self.evictions.get(&state).copied().unwrap_or(0)
    }

    /// Render the end-of-run summary table.
    pub fn report(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "misses: {}  hits: {}", self.misses, self.hits);
        let _ = writeln!(
            s,
            "prefetch: hit {} evict {} inv {} redundant {} upgrade-miss {}",
            self.prefetch_hit,
            self.prefetch_evict,
            self.prefetch_inv,
            self.prefetch_redundant,
            self.prefetch_upgrade_miss
        );
        let _ = writeln!(s, "nacks: received {} resent {}", self.nacks_received, self.nacks_resent);

        let mut rows: Vec<_> = self.event_state.iter().collect();
        rows.sort_by_key(|((cmd, state), _)| (format!("{:?}", cmd), format!("{:?}", state)));
        let _ = writeln!(s, "events by (command, state):");
        for ((cmd, state), n) in rows {
            let _ = writeln!(s, "  {:<14} {:<8} {}", format!("{}", cmd), format!("{}", state), n);
        }

        let mut up: Vec<_> = self.sent_up.iter().collect();
        up.sort_by_key(|(cmd, _)| format!("{:?}", cmd));
        let _ = writeln!(s, "sent upstream:");
        for (cmd, n) in up {
            let _ = writeln!(s, "  {:<14} {}", format!("{}", cmd), n);
        }

        let mut down: Vec<_> = self.sent_down.iter().collect();
        down.sort_by_key(|(cmd, _)| format!("{:?}", cmd));
        let _ = writeln!(s, "sent downstream:");
        for (cmd, n) in down {
            let _ = writeln!(s, "  {:<14} {}", format!("{}", cmd), n);
        }

        let mut ev: Vec<_> = self.evictions.iter().collect();
        ev.sort_by_key(|(state, _)| format!("{:?}", state));
        let _ = writeln!(s, "evictions by state:");
        for (state, n) in ev {
            let _ = writeln!(s, "  {:<8} {}", format!("{}", state), n);
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut stats = Stats::default();
        stats.record_state_event(Cmd::GetS, State::I);
        stats.record_state_event(Cmd::GetS, State::I);
        stats.record_state_event(Cmd::GetS, State::S);
        stats.record_sent_down(Cmd::GetS);
        stats.record_eviction(State::M);
        assert_eq!(stats.event_state_count(Cmd::GetS, State::I), 2);
        assert_eq!(stats.event_state_count(Cmd::GetS, State::S), 1);
        assert_eq!(stats.sent_down_count(Cmd::GetS), 1);
        assert_eq!(stats.eviction_count(State::M), 1);
        assert!(stats.report().contains("GetS"));
    }
}
