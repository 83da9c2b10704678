//! VM-wide barrier (§5): lets one core (or the embedding host) pause every
//! running core at its next safe point before mutating VM-wide state —
//! installing a hook across `Mmap`, reconfiguring the interrupt router
//! chain, taking a checkpoint — without tearing down and restarting the
//! whole VM.
//!
//! Modeled as a generation counter plus a "barrier raised" flag under one
//! mutex: a core checks `wait_at_barrier` at each safe point (the top of
//! its run loop, between a guest exit and the next entry) and parks on the
//! condvar until the generation advances.

use std::sync::{Condvar, Mutex};

struct State {
    raised: bool,
    generation: u64,
    parked: usize,
    core_count: usize,
}

/// Shared across every core's run-loop thread (§5: "a VM owns exactly one
/// barrier, shared by all its cores").
pub struct Barrier {
    state: Mutex<State>,
    cv: Condvar,
}

impl Barrier {
    pub fn new(core_count: usize) -> Self {
        Self {
            state: Mutex::new(State {
                raised: false,
                generation: 0,
                parked: 0,
                core_count,
            }),
            cv: Condvar::new(),
        }
    }

    /// Ask every core to stop at its next safe point. Returns immediately;
    /// the caller should poll [`Barrier::all_parked`] or just proceed once
    /// it trusts cores check in promptly.
    pub fn raise(&self) {
        let mut state = self.state.lock().unwrap();
        state.raised = true;
    }

    /// A core's safe-point check: parks here while the barrier is raised,
    /// and returns once it's lowered again.
    pub fn wait_at_barrier(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.raised {
            return;
        }
        state.parked += 1;
        self.cv.notify_all();
        let target_generation = state.generation;
        while state.raised && state.generation == target_generation {
            state = self.cv.wait(state).unwrap();
        }
        state.parked -= 1;
    }

    /// True once every core has reached the barrier and is parked.
    pub fn all_parked(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.raised && state.parked >= state.core_count
    }

    /// Release every parked core and advance the generation, so cores that
    /// haven't reached the barrier yet don't immediately re-park on it.
    pub fn lower(&self) {
        let mut state = self.state.lock().unwrap();
        state.raised = false;
        state.generation += 1;
        self.cv.notify_all();
    }

    pub fn parked_count(&self) -> usize {
        self.state.lock().unwrap().parked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn a_core_not_at_a_raised_barrier_passes_straight_through() {
        let barrier = Barrier::new(1);
        barrier.wait_at_barrier();
    }

    #[test]
    fn raising_parks_a_waiting_core_until_lowered() {
        let barrier = Arc::new(Barrier::new(1));
        barrier.raise();
        let b = barrier.clone();
        let handle = thread::spawn(move || {
            b.wait_at_barrier();
        });

        // Give the spawned thread a chance to park before lowering.
        while !barrier.all_parked() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(barrier.parked_count(), 1);
        barrier.lower();
        handle.join().unwrap();
    }

    #[test]
    fn all_parked_is_false_until_every_core_checks_in() {
        let barrier = Arc::new(Barrier::new(2));
        barrier.raise();
        let b = barrier.clone();
        let handle = thread::spawn(move || {
            b.wait_at_barrier();
        });
        while barrier.parked_count() < 1 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!barrier.all_parked());
        barrier.lower();
        handle.join().unwrap();
    }
}


