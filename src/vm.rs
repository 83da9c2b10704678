//! VM runtime (§2, §4.8): the object that owns a VM's cores, its memory
//! map, the I/O/MSR/hypercall tables, host-event subscriptions, and the
//! barrier that serializes mutation of all of the above across cores.
//!
//! This is deliberately the "owns everything, does little itself" layer:
//! the actual guest-entry loop lives on each core's host thread (driven by
//! `core_runtime::CoreRuntime` plus a KVM-backed `VcpuFd`), and reaches
//! back into this struct's tables only while holding the barrier or while
//! the core's own per-VCPU state is uncontested.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::barrier::Barrier;
use crate::config::{ConfigError, ConfigNode, VmConfig};
use crate::core_runtime::{CoreRuntime, CoreState};
use crate::events::EventBus;
use crate::hcalls::HcallTable;
use crate::host::HostEnvironment;
use crate::iomap::IoMap;
use crate::mmap::Mmap;
use crate::msrmap::MsrMap;
use crate::paging::PagingStrategy;

/// VM-wide run state (Data Model §3: "run-state {INVALID, RUNNING,
/// STOPPED, ERROR}").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VmRunState {
    Invalid = 0,
    Running = 1,
    Stopped = 2,
    Error = 3,
}

impl VmRunState {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => VmRunState::Invalid,
            1 => VmRunState::Running,
            2 => VmRunState::Stopped,
            _ => VmRunState::Error,
        }
    }
}

/// Everything shared, barrier-protected VM state that isn't a VCPU's own
/// register file or pending-interrupt state (§5's "shared-resource
/// policy"). Grouped behind one mutex since every mutation to any of them
/// already requires holding the barrier; a finer-grained lock per table
/// would just be more ways to deadlock for no concurrency gained.
struct Shared {
    mmap: Mmap,
    iomap: IoMap,
    msrmap: MsrMap,
    hcalls: HcallTable,
    events: EventBus,
}

/// The VM runtime. `id` and `run_state` are read far more often than the
/// shared tables are mutated, so they get their own lock-free slots.
pub struct VM {
    id: u64,
    run_state: AtomicU32,
    paging_strategy: PagingStrategy,
    barrier: Barrier,
    cores: Vec<CoreRuntime>,
    shared: Mutex<Shared>,
    host: std::sync::Arc<dyn HostEnvironment>,
}

impl VM {
    /// Create a VM from a host-supplied configuration tree (§6). Installs
    /// the reserved hypercall stubs so core services always resolve, even
    /// before any device model registers anything.
    pub fn create(
        id: u64,
        config_node: &dyn ConfigNode,
        host: std::sync::Arc<dyn HostEnvironment>,
    ) -> Result<Self, ConfigError> {
        let config = VmConfig::from_node(config_node)?;
        Ok(Self::from_config(id, &config, host))
    }

    /// Build directly from an already-parsed [`VmConfig`], for callers
    /// that don't have a `ConfigNode` handy (e.g. in-process tests).
    pub fn from_config(id: u64, config: &VmConfig, host: std::sync::Arc<dyn HostEnvironment>) -> Self {
        let cores = (0..config.vcpu_count)
            .map(|core_id| CoreRuntime::new(core_id, config.yield_strategy))
            .collect();

        let mut hcalls = HcallTable::new();
        hcalls.install_reserved_stubs(host.tsc_frequency_hz().unwrap_or(0));

        Self {
            id,
            run_state: AtomicU32::new(VmRunState::Invalid as u32),
            paging_strategy: config.paging_strategy,
            barrier: Barrier::new(config.vcpu_count as usize),
            cores,
            shared: Mutex::new(Shared {
                mmap: Mmap::new(),
                iomap: IoMap::new(),
                msrmap: MsrMap::new(),
                hcalls,
                events: EventBus::new(),
            }),
            host,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn paging_strategy(&self) -> PagingStrategy {
        self.paging_strategy
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    pub fn core(&self, index: usize) -> Option<&CoreRuntime> {
        self.cores.get(index)
    }

    pub fn run_state(&self) -> VmRunState {
        VmRunState::from_u32(self.run_state.load(Ordering::Acquire))
    }

    pub fn mark_running(&self) {
        self.run_state.store(VmRunState::Running as u32, Ordering::Release);
    }

    /// Stop the VM: every core drops out at its next exit or HLT block
    /// (§2: "v3_stop_vm sets VM state to STOPPED; VCPUs drop out at their
    /// next exit or at the HLT block").
    pub fn stop(&self) {
        self.run_state.store(VmRunState::Stopped as u32, Ordering::Release);
        for core in &self.cores {
            core.request_stop();
        }
    }

    /// Escalate to the fatal ERROR state (§7: "the VM's run-state must
    /// move to ERROR, all VCPUs stop, events drain, and the host is
    /// notified").
    pub fn fail(&self, reason: &str) {
        log::error!("VM {} entering ERROR state: {reason}", self.id);
        self.run_state.store(VmRunState::Error as u32, Ordering::Release);
        for core in &self.cores {
            core.request_stop();
        }
    }

    /// Raise the barrier, run `f` against the shared tables once every
    /// core has parked (or immediately, if this VM has only the calling
    /// core), then lower it. This is the only sanctioned way to mutate
    /// `Mmap`/`IoMap`/`MsrMap`/`HcallTable`/`EventBus` (§5).
    pub fn with_barrier<R>(&self, f: impl FnOnce(&mut Mmap, &mut IoMap, &mut MsrMap, &mut HcallTable, &mut EventBus) -> R) -> R {
        self.barrier.raise();
        // Only cores actually in guest mode need to check in; a core that
        // hasn't started or has already stopped cannot race the mutation
        // below.
        let expected_parked = self
            .cores
            .iter()
            .filter(|c| c.state() == CoreState::Running)
            .count();
        while self.barrier.parked_count() < expected_parked {
            self.host.yield_now();
        }
        let mut shared = self.shared.lock().unwrap();
        let result = f(
            &mut shared.mmap,
            &mut shared.iomap,
            &mut shared.msrmap,
            &mut shared.hcalls,
            &mut shared.events,
        );
        drop(shared);
        self.barrier.lower();
        result
    }

    /// A core's own safe-point check, called at the top of its run loop.
    pub fn wait_at_barrier(&self) {
        self.barrier.wait_at_barrier();
    }

    pub fn host(&self) -> &dyn HostEnvironment {
        self.host.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfigNode;
    use crate::host::NativeHostEnvironment;
    use crate::mmap::Region;
    use std::sync::Arc;

    fn test_vm(vcpu_count: &str) -> VM {
        let host = Arc::new(NativeHostEnvironment::new());
        let node = StaticConfigNode::new()
            .with_val("vcpu_count", vcpu_count)
            .with_val("memory_size_bytes", "4096");
        VM::create(1, &node, host).unwrap()
    }

    #[test]
    fn starts_invalid_and_moves_to_running() {
        let vm = test_vm("1");
        assert_eq!(vm.run_state(), VmRunState::Invalid);
        vm.mark_running();
        assert_eq!(vm.run_state(), VmRunState::Running);
    }

    #[test]
    fn stop_flips_every_core_to_stopped() {
        let vm = test_vm("2");
        vm.mark_running();
        vm.stop();
        assert_eq!(vm.run_state(), VmRunState::Stopped);
        assert!(vm.core(0).unwrap().should_stop());
        assert!(vm.core(1).unwrap().should_stop());
    }

    #[test]
    fn with_barrier_gives_exclusive_access_to_the_shared_tables() {
        let vm = test_vm("1");
        vm.with_barrier(|mmap, _io, _msr, _hcalls, _events| {
            mmap.add(Region::ram(0, 0x1000, 0)).unwrap();
        });
        vm.with_barrier(|mmap, _io, _msr, _hcalls, _events| {
            assert!(mmap.lookup(0x10).is_some());
        });
    }

    #[test]
    fn reserved_hypercalls_are_preinstalled() {
        let vm = test_vm("1");
        vm.with_barrier(|_mmap, _io, _msr, hcalls, _events| {
            assert!(hcalls.is_registered(crate::hcalls::reserved::TEST));
        });
    }
}

