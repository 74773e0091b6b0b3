// implements a message queue with discrete message delays, based on a
// binary heap of absolute-time messages

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A message scheduled for an absolute delivery time. The heap is a
/// max-heap, so ordering is reversed to pop the earliest message first.
struct TimedMsg<MsgType> {
    t: u64,
    seq: u64,
    msg: MsgType,
}

impl<MsgType> PartialEq for TimedMsg<MsgType> {
    fn eq(&self, other: &Self) -> bool {
        self.t == other.t && self.seq == other.seq
    }
}

impl<MsgType> Eq for TimedMsg<MsgType> {}

impl<MsgType> Ord for TimedMsg<MsgType> {
    fn cmp(&self, other: &Self) -> Ordering {
        // earliest first; FIFO among equal timestamps
        other.t.cmp(&self.t).then(other.seq.cmp(&self.seq))
    }
}

impl<MsgType> PartialOrd for TimedMsg<MsgType> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Discrete-delay message queue. Messages become fetchable once the queue
/// time reaches their delivery timestamp.
pub struct DelayedQ<MsgType> {
    q: BinaryHeap<TimedMsg<MsgType>>,
    time: u64,
    seq: u64,
}

impl<MsgType> DelayedQ<MsgType> {
    pub fn new() -> Self {
        DelayedQ {
            q: BinaryHeap::new(),
            time: 0,
            seq: 0,
        }
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn update_time(&mut self, new_time: u64) {
        self.time = new_time;
    }

    /// Schedule a message for an absolute delivery time. Times already in
    /// the past deliver on the next fetch.
    pub fn send_at(&mut self, msg: MsgType, t: u64) {
        self.seq += 1;
        self.q.push(TimedMsg { t, seq: self.seq, msg });
    }

    /// Schedule a message `delay` cycles from now.
    pub fn send(&mut self, msg: MsgType, delay: u64) {
        let t = self.time + delay;
        self.send_at(msg, t);
    }

    pub fn msg_available(&self) -> bool {
        self.q.peek().map_or(false, |m| m.t <= self.time)
    }

    pub fn try_fetch(&mut self) -> Option<MsgType> {
        if self.msg_available() {
            return self.q.pop().map(|m| m.msg);
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Next pending delivery time, for fast-forwarding quiet periods.
    pub fn next_time(&self) -> Option<u64> {
        self.q.peek().map(|m| m.t)
    }
}

impl<MsgType> Default for DelayedQ<MsgType> {
    fn default() -> Self {
        DelayedQ::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delayed_queue() {
        let mut dq = DelayedQ::<i32>::new();

        dq.send(42, 0);
        dq.send(43, 0);
        dq.send(44, 1);

        let mut seen = Vec::new();
        let mut c = 0;
        while !dq.is_empty() {
            while let Some(msg) = dq.try_fetch() {
                seen.push((c, msg));
                if msg == 42 {
                    dq.send(100, 0);
                }
            }
            c += 1;
            dq.update_time(c);
        }

        assert_eq!(seen, vec![(0, 42), (0, 43), (0, 100), (1, 44)]);
    }

    #[test]
    fn fifo_among_equal_timestamps() {
        let mut dq = DelayedQ::<&str>::new();
        dq.send_at("a", 5);
        dq.send_at("b", 5);
        dq.send_at("c", 3);
        dq.update_time(5);
        assert_eq!(dq.try_fetch(), Some("c"));
        assert_eq!(dq.try_fetch(), Some("a"));
        assert_eq!(dq.try_fetch(), Some("b"));
        assert_eq!(dq.try_fetch(), None);
    }
}
