//! Per-core run-state machine and scheduling policy (§4.8, §5).
//!
//! Each VCPU's host thread drives a small state machine (`Init` ->
//! `Running` -> `Halted`/`Stopped`/`Resetting`) and consults a
//! [`YieldStrategy`] to decide how hard to spin versus yield the host
//! thread while the guest is halted waiting for an interrupt.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::host::HostEnvironment;

/// A core's run state. Transitions are driven by the run loop itself
/// (`Running` <-> `Halted` as HLT/interrupt come and go) or by an external
/// request (`Stopped` on shutdown, `Resetting` on INIT-SIPI or a
/// guest-requested reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CoreState {
    Init = 0,
    Running = 1,
    Halted = 2,
    Resetting = 3,
    Stopped = 4,
}

impl CoreState {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => CoreState::Init,
            1 => CoreState::Running,
            2 => CoreState::Halted,
            3 => CoreState::Resetting,
            _ => CoreState::Stopped,
        }
    }
}

/// How aggressively a halted core spins versus yields the host thread
/// (§4.8: "a halted guest should not burn a full host core unless told
/// to").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldStrategy {
    /// Never yield; re-check for a pending interrupt immediately. Lowest
    /// wake latency, highest host CPU cost.
    Greedy,
    /// Yield the host thread on every halted iteration.
    Friendly,
    /// Spin for a handful of iterations, then start yielding; resets to
    /// spinning as soon as the core leaves `Halted`. Balances wake latency
    /// against host CPU cost for workloads that halt briefly and often.
    Adaptive,
}

const ADAPTIVE_SPIN_ITERATIONS: u32 = 256;

/// The vector a double fault is delivered on, regardless of what the two
/// colliding exceptions were.
pub const DOUBLE_FAULT_VECTOR: u8 = 8;

/// What a core should do with an exception it was about to inject, once
/// escalation against any already-pending exception is accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionOutcome {
    /// Deliver this vector to the guest.
    Deliver(u8),
    /// A double fault occurred while a double fault was already pending:
    /// the guest cannot make forward progress. The VM is stopped.
    Shutdown,
}

/// Per-core scheduling and state-machine bookkeeping. Cheap to share
/// across threads (an `AtomicU32` for state, a plain counter for the
/// adaptive spin budget that only the owning thread touches).
pub struct CoreRuntime {
    core_id: u32,
    state: AtomicU32,
    strategy: YieldStrategy,
    spins_since_halt: u32,
    pending_exception: Option<u8>,
}

impl CoreRuntime {
    pub fn new(core_id: u32, strategy: YieldStrategy) -> Self {
        Self {
            core_id,
            state: AtomicU32::new(CoreState::Init as u32),
            strategy,
            spins_since_halt: 0,
            pending_exception: None,
        }
    }

    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    pub fn state(&self) -> CoreState {
        CoreState::from_u32(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CoreState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Transition into `Running`; called once per successful guest entry.
    pub fn mark_running(&mut self) {
        self.spins_since_halt = 0;
        self.set_state(CoreState::Running);
    }

    /// Transition into `Halted` after a HLT exit with no interrupt
    /// immediately pending.
    pub fn mark_halted(&self) {
        self.set_state(CoreState::Halted);
    }

    pub fn request_stop(&self) {
        self.set_state(CoreState::Stopped);
    }

    pub fn request_reset(&self) {
        self.set_state(CoreState::Resetting);
    }

    pub fn should_stop(&self) -> bool {
        self.state() == CoreState::Stopped
    }

    /// Deliver an exception vector, escalating against whatever is already
    /// pending: re-raising the same vector while it is still pending
    /// escalates to a double fault, and a double fault while a double
    /// fault is already pending is a triple fault — unrecoverable, so the
    /// core requests the VM stop rather than deliver anything further.
    pub fn inject(&mut self, vector: u8) -> ExceptionOutcome {
        let outcome = match self.pending_exception {
            Some(DOUBLE_FAULT_VECTOR) => ExceptionOutcome::Shutdown,
            Some(pending) if pending == vector => ExceptionOutcome::Deliver(DOUBLE_FAULT_VECTOR),
            _ => ExceptionOutcome::Deliver(vector),
        };
        match outcome {
            ExceptionOutcome::Shutdown => {
                self.pending_exception = None;
                self.request_stop();
            }
            ExceptionOutcome::Deliver(delivered) => {
                self.pending_exception = Some(delivered);
            }
        }
        outcome
    }

    /// Clear the pending-exception slot once the guest has handled it
    /// (e.g. an IRET past the handler, or a context switch on reset).
    pub fn acknowledge_exception(&mut self) {
        self.pending_exception = None;
    }

    /// Called once per loop iteration while halted, before re-checking for
    /// a pending interrupt. Applies the configured yield strategy.
    pub fn idle_tick(&mut self, host: &dyn HostEnvironment) {
        match self.strategy {
            YieldStrategy::Greedy => {}
            YieldStrategy::Friendly => host.yield_now(),
            YieldStrategy::Adaptive => {
                if self.spins_since_halt >= ADAPTIVE_SPIN_ITERATIONS {
                    host.yield_now();
                } else {
                    self.spins_since_halt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NativeHostEnvironment;

    #[test]
    fn starts_in_init_and_tracks_explicit_transitions() {
        let mut core = CoreRuntime::new(0, YieldStrategy::Greedy);
        assert_eq!(core.state(), CoreState::Init);
        core.mark_running();
        assert_eq!(core.state(), CoreState::Running);
        core.mark_halted();
        assert_eq!(core.state(), CoreState::Halted);
        core.request_stop();
        assert!(core.should_stop());
    }

    #[test]
    fn adaptive_strategy_spins_before_yielding() {
        let mut core = CoreRuntime::new(1, YieldStrategy::Adaptive);
        let host = NativeHostEnvironment::new();
        for _ in 0..ADAPTIVE_SPIN_ITERATIONS {
            core.idle_tick(&host);
        }
        assert_eq!(core.spins_since_halt, ADAPTIVE_SPIN_ITERATIONS);
        // One more tick crosses the threshold and yields instead of
        // incrementing further.
        core.idle_tick(&host);
        assert_eq!(core.spins_since_halt, ADAPTIVE_SPIN_ITERATIONS);
    }

    #[test]
    fn a_fresh_vector_is_simply_delivered() {
        let mut core = CoreRuntime::new(0, YieldStrategy::Greedy);
        assert_eq!(core.inject(13), ExceptionOutcome::Deliver(13));
    }

    #[test]
    fn the_same_vector_recurring_while_pending_escalates_to_double_fault() {
        let mut core = CoreRuntime::new(0, YieldStrategy::Greedy);
        assert_eq!(core.inject(13), ExceptionOutcome::Deliver(13));
        assert_eq!(
            core.inject(13),
            ExceptionOutcome::Deliver(DOUBLE_FAULT_VECTOR)
        );
    }

    #[test]
    fn a_double_fault_recurring_while_pending_triple_faults_and_stops_the_core() {
        let mut core = CoreRuntime::new(0, YieldStrategy::Greedy);
        core.mark_running();
        assert_eq!(
            core.inject(DOUBLE_FAULT_VECTOR),
            ExceptionOutcome::Deliver(DOUBLE_FAULT_VECTOR)
        );
        assert_eq!(
            core.inject(DOUBLE_FAULT_VECTOR),
            ExceptionOutcome::Shutdown
        );
        assert!(core.should_stop());
    }

    #[test]
    fn acknowledging_clears_the_pending_slot() {
        let mut core = CoreRuntime::new(0, YieldStrategy::Greedy);
        core.inject(13);
        core.acknowledge_exception();
        assert_eq!(core.inject(13), ExceptionOutcome::Deliver(13));
    }

    #[test]
    fn mark_running_resets_the_adaptive_spin_budget() {
        let mut core = CoreRuntime::new(2, YieldStrategy::Adaptive);
        let host = NativeHostEnvironment::new();
        core.idle_tick(&host);
        core.idle_tick(&host);
        assert_eq!(core.spins_since_halt, 2);
        core.mark_running();
        assert_eq!(core.spins_since_halt, 0);
    }
}


