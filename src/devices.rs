//! Device hook protocol (§6): the typed contract concrete device models
//! are consumed through. Concrete models (IDE, PCI bridges, NICs, serial,
//! keyboard, APIC registers, RTC) are deliberately out of scope — this
//! module only defines the interface `IoMap`/`MsrMap`/`Mmap` hooks and the
//! interrupt router chain present to whatever a host plugs in.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device hook reported error code {0}")]
    HookFailed(i32),
}

/// Direction of a device access, mirrored from the paging module's
/// `AccessKind` but kept separate: a device hook never sees `Execute`
/// (devices are data-only from the guest's perspective).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAccess {
    Read,
    Write,
}

/// Whether a completed device access transferred every byte the guest
/// requested. §6: "the dispatcher decides whether to resume or inject
/// based on length < requested (partial)" — a partial transfer on a read
/// is resolved by the dispatcher resuming with whatever bytes came back
/// (the rest read as the port/MMIO-hole default); a partial transfer is
/// never itself a guest-visible fault, only a signal the device didn't
/// have enough data ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Full,
    Partial { transferred: usize },
}

pub fn classify_transfer(requested: usize, transferred: usize) -> TransferOutcome {
    if transferred >= requested {
        TransferOutcome::Full
    } else {
        TransferOutcome::Partial { transferred }
    }
}

/// A device's I/O-port, MMIO, and MSR callbacks. `vcpu` identifies which
/// core's access triggered the call (device state can be shared across
/// cores or not, at the device's discretion); `opaque` is the device's own
/// context token, threaded through unchanged (standing in for the C
/// callback table's `void *opaque`). Returns the number of bytes actually
/// transferred, or a negative host-defined error code.
pub trait DeviceHook: Send {
    fn io_access(
        &mut self,
        vcpu: u32,
        port: u16,
        buffer: &mut [u8],
        access: DeviceAccess,
        opaque: u64,
    ) -> Result<usize, i32>;

    fn mmio_access(
        &mut self,
        vcpu: u32,
        gpa: u64,
        buffer: &mut [u8],
        access: DeviceAccess,
        opaque: u64,
    ) -> Result<usize, i32>;

    fn msr_access(
        &mut self,
        vcpu: u32,
        msr: u32,
        value: &mut u64,
        access: DeviceAccess,
        opaque: u64,
    ) -> Result<usize, i32>;
}

/// A separate hook for IRQ acknowledgment (§6: "IRQ ack is a separate
/// hook"), called once the guest's interrupt controller has accepted
/// delivery of a vector this device raised.
pub trait IrqAckHook: Send {
    fn ack_irq(&mut self, irq_line: u32);
}

/// What a device claims at registration time: an I/O-port range, an MMIO
/// GPA range, or an MSR, plus optionally the IRQ line it owns. Purely
/// descriptive — the VM uses this to wire the device's `DeviceHook` into
/// `IoMap`/`MsrMap`/`Mmap`, not to perform any access itself.
#[derive(Debug, Clone)]
pub enum DeviceClaim {
    IoPortRange { base: u16, len: u16 },
    MmioRange { base: u64, len: u64 },
    Msr(u32),
}

#[derive(Debug, Clone)]
pub struct DeviceRegistration {
    pub name: String,
    pub claims: Vec<DeviceClaim>,
    pub irq_line: Option<u32>,
}
