//! VM exit dispatch (§4.1): turns a raw exit reason into either an
//! immediate resume (I/O and MMIO handled inline through the device maps),
//! a paging-engine fault to service, or a coarse action the core run loop
//! needs to act on itself (halt, shutdown, request an interrupt window,
//! fail the VM).

pub mod decode;

use crate::hcalls::{HcallArgs, HcallTable};
#[cfg(target_os = "linux")]
use crate::iomap::{IoMap, IoWidth};
#[cfg(target_os = "linux")]
use crate::kvm_backend::{IoData, IoHandler, MmioHandler, VcpuExit};
#[cfg(target_os = "linux")]
use crate::mmap::Mmap;
use crate::paging::{AccessKind, FaultContext, FaultResolution, PagingEngine, PagingError};

/// What the core run loop should do once a raw `VcpuExit` (or a paging
/// fault serviced below) has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitAction {
    /// Resume the guest; nothing further to do.
    Continue,
    /// Inject a page fault with this CR2/error code before resuming.
    InjectFault { address: u64, error_code: u32 },
    /// Guest executed HLT; the core should sleep until an interrupt is
    /// pending rather than spin re-entering.
    Halt,
    /// Ask the host for another run once the interrupt window opens.
    RequestInterruptWindow,
    /// Guest requested or triggered shutdown (explicit request or triple
    /// fault).
    Shutdown,
    /// A host-visible system event (S3 sleep, reset); the core forwards
    /// the raw code to whatever owns VM lifecycle policy.
    SystemEvent(u32),
    /// A hypercall was dispatched (or found absent); write this value into
    /// the guest's result register and resume past the VMCALL/VMMCALL
    /// instruction. Never a fault — §4.6 resolves an absent id to -1 in the
    /// result register, not an injected exception.
    HypercallResult(i64),
    /// Something the VMM cannot recover from; stop this core.
    Fail(String),
}

/// Classify the exit reasons `run_with_io` does not already resolve
/// inline (I/O and MMIO are handled by [`DeviceBus`] before this is ever
/// reached — see [`crate::kvm_backend::vcpu::VcpuFd::run_with_io`]).
#[cfg(target_os = "linux")]
pub fn classify_core_exit(exit: &VcpuExit) -> ExitAction {
    match exit {
        VcpuExit::Io => ExitAction::Continue,
        VcpuExit::Hlt => ExitAction::Halt,
        VcpuExit::Shutdown => ExitAction::Shutdown,
        VcpuExit::IrqWindowOpen => ExitAction::Continue,
        VcpuExit::InternalError => {
            ExitAction::Fail("KVM reported an internal error".to_string())
        }
        VcpuExit::FailEntry(reason) => {
            ExitAction::Fail(format!("guest entry failed, hardware reason {reason:#x}"))
        }
        VcpuExit::SystemEvent(code) => ExitAction::SystemEvent(*code),
        VcpuExit::Unknown(name) => ExitAction::Fail(format!("unhandled exit reason: {name}")),
    }
}

/// Bridges `kvm_backend`'s `IoHandler`/`MmioHandler` traits to the core's
/// own port and guest-physical hook tables, so the low-level run loop
/// never has to know how ports or MMIO holes are serviced.
#[cfg(target_os = "linux")]
pub struct DeviceBus<'a> {
    pub io: &'a mut IoMap,
    pub mmap: &'a mut Mmap,
}

#[cfg(target_os = "linux")]
impl<'a> IoHandler for DeviceBus<'a> {
    fn io_read(&mut self, port: u16, data: &mut IoData) {
        let Some(width) = IoWidth::from_len(data.len()) else {
            return;
        };
        let value = self.io.read(port, width);
        for i in 0..data.len() {
            data.set(i, (value >> (8 * i)) as u8);
        }
    }

    fn io_write(&mut self, port: u16, data: &IoData) {
        let Some(width) = IoWidth::from_len(data.len()) else {
            return;
        };
        let mut value = 0u32;
        for (i, byte) in data.as_slice().iter().enumerate() {
            value |= (*byte as u32) << (8 * i);
        }
        self.io.write(port, width, value);
    }
}

#[cfg(target_os = "linux")]
impl<'a> MmioHandler for DeviceBus<'a> {
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]) {
        match self.mmap.lookup_mut(addr) {
            Some(region) => {
                if let Some(hook) = region.read_hook.as_mut() {
                    hook(addr, data);
                    return;
                }
                data.fill(0xFF);
            }
            None => data.fill(0xFF),
        }
    }

    fn mmio_write(&mut self, addr: u64, data: &[u8]) {
        if let Some(region) = self.mmap.lookup_mut(addr) {
            if let Some(hook) = region.write_hook.as_mut() {
                hook(addr, data);
            }
        }
    }
}

/// Service a page fault (shadow paging) or EPT violation (nested paging)
/// by handing it to the active paging engine and translating its verdict
/// into an `ExitAction`.
pub fn service_fault(
    engine: &mut dyn PagingEngine,
    ctx: &mut FaultContext,
    fault_addr: u64,
    access: AccessKind,
    guest_error_code: u32,
) -> Result<ExitAction, PagingError> {
    let resolution = engine.handle_fault(ctx, fault_addr, access, guest_error_code)?;
    Ok(match resolution {
        FaultResolution::Resolved => ExitAction::Continue,
        FaultResolution::InjectPageFault {
            address,
            error_code,
        } => ExitAction::InjectFault {
            address,
            error_code,
        },
        FaultResolution::Fail => {
            ExitAction::Fail(format!("unrecoverable fault at {fault_addr:#x}"))
        }
    })
}

/// Dispatch a guest hypercall (VMCALL/VMMCALL) against the VM's table. The
/// hypercall id and argument registers are read by the caller from the
/// vCPU's general registers, per the calling convention §4.6 leaves up to
/// the embedding VMM to define. Always resolves to
/// [`ExitAction::HypercallResult`]: the handler's return value on success,
/// -1 when no handler claims `id` (§4.6: "return -1 in the guest result
/// register if absent") — never a fault, in either case the caller resumes
/// past the VMCALL/VMMCALL instruction.
pub fn dispatch_hypercall(table: &mut HcallTable, id: u16, regs: &[u64; 6]) -> ExitAction {
    let args = HcallArgs { regs };
    let result = table.dispatch(id, &args).unwrap_or(-1);
    ExitAction::HypercallResult(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn classify_maps_hlt_and_shutdown() {
        assert_eq!(classify_core_exit(&VcpuExit::Hlt), ExitAction::Halt);
        assert_eq!(classify_core_exit(&VcpuExit::Shutdown), ExitAction::Shutdown);
        assert_eq!(
            classify_core_exit(&VcpuExit::FailEntry(0xdead)),
            ExitAction::Fail("guest entry failed, hardware reason 0xdead".to_string())
        );
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn device_bus_round_trips_an_io_port_through_iomap() {
        let mut io = IoMap::new();
        let mut mmap = Mmap::new();
        io.hook(
            0x3f8,
            Some(Box::new(|_, _| 0x41)),
            Some(Box::new(|_, _, _| {})),
        )
        .unwrap();
        let mut bus = DeviceBus {
            io: &mut io,
            mmap: &mut mmap,
        };
        let mut data = IoData::new(1);
        bus.io_read(0x3f8, &mut data);
        assert_eq!(data.as_slice(), &[0x41]);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn device_bus_falls_back_to_all_ones_for_unhooked_mmio() {
        let mut io = IoMap::new();
        let mut mmap = Mmap::new();
        let mut bus = DeviceBus {
            io: &mut io,
            mmap: &mut mmap,
        };
        let mut data = [0u8; 4];
        bus.mmio_read(0xd000_0000, &mut data);
        assert_eq!(data, [0xFF; 4]);
    }

    #[test]
    fn hypercall_dispatch_resolves_a_registered_id() {
        let mut table = HcallTable::new();
        table.register(0x100, Box::new(|args| args.regs[0] as i64 + 1), false).unwrap();
        assert_eq!(
            dispatch_hypercall(&mut table, 0x100, &[41, 0, 0, 0, 0, 0]),
            ExitAction::HypercallResult(42)
        );
    }

    #[test]
    fn hypercall_dispatch_returns_negative_one_for_unregistered_ids() {
        let mut table = HcallTable::new();
        assert_eq!(
            dispatch_hypercall(&mut table, 0x999, &[0; 6]),
            ExitAction::HypercallResult(-1)
        );
    }
}


