//! Virtual time (§4.7): each VCPU gets its own TSC offset so RDTSC reads a
//! guest-consistent value regardless of when the core actually started
//! running on hardware, plus a per-VM list of software timers the core
//! polls on every guest exit.
//!
//! TSC *scaling* (running the guest's TSC at a different rate than the
//! host's) is intentionally not implemented: §4.7 leaves this as an open
//! question pending host-reported TSC frequency, and the decision recorded
//! in DESIGN.md is to support only the additive offset until a host
//! actually reports a frequency to scale against.

use std::collections::BinaryHeap;
use std::cmp::Reverse;

/// One VCPU's view of the timestamp counter: `host_tsc + offset` is what
/// the guest should see on the next `RDTSC`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TscState {
    offset: i64,
}

impl TscState {
    pub fn new() -> Self {
        Self { offset: 0 }
    }

    /// Rebase so that a subsequent read of `host_tsc` reports `target`
    /// (used when restoring a checkpoint, or synchronizing a newly started
    /// AP to the BSP's TSC).
    pub fn rebase(&mut self, host_tsc: u64, target: u64) {
        self.offset = target as i64 - host_tsc as i64;
    }

    pub fn guest_tsc(&self, host_tsc: u64) -> u64 {
        (host_tsc as i64 + self.offset) as u64
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// A one-shot or periodic deadline the core checks on every VM exit
/// (§4.7: "timers are polled, not interrupt-driven, to avoid a host
/// signal-handling dependency").
pub struct Timer {
    pub id: u32,
    deadline_ns: u64,
    period_ns: Option<u64>,
}

impl Timer {
    pub fn one_shot(id: u32, deadline_ns: u64) -> Self {
        Self {
            id,
            deadline_ns,
            period_ns: None,
        }
    }

    pub fn periodic(id: u32, first_deadline_ns: u64, period_ns: u64) -> Self {
        Self {
            id,
            deadline_ns: first_deadline_ns,
            period_ns: Some(period_ns),
        }
    }
}

struct Entry {
    deadline_ns: u64,
    timer: Timer,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ns == other.deadline_ns
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline_ns.cmp(&other.deadline_ns)
    }
}

/// A min-heap of timer deadlines, polled once per guest exit.
#[derive(Default)]
pub struct TimerList {
    heap: BinaryHeap<Reverse<Entry>>,
}

impl TimerList {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn insert(&mut self, timer: Timer) {
        self.heap.push(Reverse(Entry {
            deadline_ns: timer.deadline_ns,
            timer,
        }));
    }

    /// Pop every timer whose deadline has passed `now_ns`, re-inserting
    /// periodic ones at their next deadline. Returns the fired timer ids,
    /// in deadline order.
    pub fn poll(&mut self, now_ns: u64) -> Vec<u32> {
        let mut fired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline_ns > now_ns {
                break;
            }
            let Reverse(Entry { timer, .. }) = self.heap.pop().unwrap();
            fired.push(timer.id);
            if let Some(period) = timer.period_ns {
                self.insert(Timer::periodic(timer.id, timer.deadline_ns + period, period));
            }
        }
        fired
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(e)| e.deadline_ns)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
