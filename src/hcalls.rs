//! Hypercall table (§4.6): guest-initiated calls into the VMM, invoked via
//! VMCALL/VMMCALL with a 16-bit id in a specified general-purpose register.
//! Keyed the same way the rest of the core keys sparse lookup tables — a
//! `BTreeMap` standing in for the reference implementation's red-black tree.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HcallError {
    #[error("hypercall id {0:#x} is already registered")]
    AlreadyRegistered(u16),
    #[error("no handler registered for hypercall id {0:#x}")]
    NotFound(u16),
    #[error("hypercall id {0:#x} is reserved")]
    Reserved(u16),
}

/// Ids reserved for core services (§4.6: "a small set of ids is reserved
/// for core services: test, OS debug message, request guest-physical base
/// of VMM memory, request telemetry dump, balloon control, CPU-frequency
/// query"). A device model or guest-facing extension must not register a
/// handler under one of these without the bootstrap override.
pub mod reserved {
    /// No-op round-trip used to verify the hypercall path itself works.
    pub const TEST: u16 = 0x0000;
    /// Guest-to-host debug print (single string argument).
    pub const DEBUG_MESSAGE: u16 = 0x0001;
    /// Returns the guest-physical base address of VMM-owned memory, if any
    /// is mapped into the guest's address space.
    pub const VMM_BASE_QUERY: u16 = 0x0002;
    /// Asks the VMM to dump accumulated telemetry to its log.
    pub const TELEMETRY_DUMP: u16 = 0x0003;
    /// Balloon-driver inflate/deflate request.
    pub const BALLOON_CONTROL: u16 = 0x0004;
    /// Returns the host's reported CPU frequency in Hz, or 0 if unknown.
    pub const CPU_FREQUENCY_QUERY: u16 = 0x0005;
    /// Highest id reserved for core use; extensions must register above
    /// this.
    pub const MAX_RESERVED: u16 = 0x000F;
}

/// Arguments passed to a hypercall handler: the guest's general-purpose
/// register file at the point of the call, read-only (result is returned,
/// not written back through this view — the exit dispatcher writes the
/// return value into the guest's result register and advances RIP past
/// the VMCALL/VMMCALL instruction itself).
pub struct HcallArgs<'a> {
    pub regs: &'a [u64; 6],
}

pub type HcallHandler = Box<dyn FnMut(&HcallArgs) -> i64 + Send>;

/// The VM-wide hypercall dispatch table.
#[derive(Default)]
pub struct HcallTable {
    handlers: BTreeMap<u16, HcallHandler>,
}

impl HcallTable {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Register a handler for `id`. Ids at or below
    /// [`reserved::MAX_RESERVED`] are refused unless `allow_reserved` is
    /// set, which only the core's own bootstrap code should pass.
    pub fn register(
        &mut self,
        id: u16,
        handler: HcallHandler,
        allow_reserved: bool,
    ) -> Result<(), HcallError> {
        if id <= reserved::MAX_RESERVED && !allow_reserved {
            return Err(HcallError::Reserved(id));
        }
        if self.handlers.contains_key(&id) {
            return Err(HcallError::AlreadyRegistered(id));
        }
        self.handlers.insert(id, handler);
        Ok(())
    }

    pub fn unregister(&mut self, id: u16) {
        self.handlers.remove(&id);
    }

    pub fn is_registered(&self, id: u16) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Install stub handlers for every reserved id that isn't already
    /// registered, so a fresh `VM` always has something to answer with
    /// rather than bouncing every core service off `NotFound` (§4.6's
    /// reserved set is meant to always resolve, even before a device model
    /// configures anything). `cpu_frequency_hz` feeds the stub for
    /// [`reserved::CPU_FREQUENCY_QUERY`].
    pub fn install_reserved_stubs(&mut self, cpu_frequency_hz: u64) {
        let _ = self.register(reserved::TEST, Box::new(|_| 0), true);
        let _ = self.register(
            reserved::DEBUG_MESSAGE,
            Box::new(|args| {
                log::info!("guest debug message: {:#x}", args.regs[0]);
                0
            }),
            true,
        );
        let _ = self.register(reserved::VMM_BASE_QUERY, Box::new(|_| -1), true);
        let _ = self.register(
            reserved::TELEMETRY_DUMP,
            Box::new(|_| {
                log::info!("telemetry dump requested by guest");
                0
            }),
            true,
        );
        let _ = self.register(reserved::BALLOON_CONTROL, Box::new(|_| -1), true);
        let _ = self.register(
            reserved::CPU_FREQUENCY_QUERY,
            Box::new(move |_| cpu_frequency_hz as i64),
            true,
        );
    }

    /// Dispatch a call. Returns the handler's return value (negative means
    /// failure, mapped to `VmError` by the caller per §7), or `NotFound` if
    /// no handler claims `id` (the dispatcher should set the guest's result
    /// register to -1 on this, per §4.6: "return -1 in the guest result
    /// register if absent").
    pub fn dispatch(&mut self, id: u16, args: &HcallArgs) -> Result<i64, HcallError> {
        let handler = self.handlers.get_mut(&id).ok_or(HcallError::NotFound(id))?;
        Ok(handler(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_id_is_not_found() {
        let mut table = HcallTable::new();
        let args = HcallArgs { regs: &[0; 6] };
        assert!(matches!(
            table.dispatch(0x100, &args),
            Err(HcallError::NotFound(0x100))
        ));
    }

    #[test]
    fn reserved_id_is_refused_without_the_override() {
        let mut table = HcallTable::new();
        let err = table
            .register(reserved::TEST, Box::new(|_| 0), false)
            .unwrap_err();
        assert!(matches!(err, HcallError::Reserved(_)));
    }

    #[test]
    fn reserved_id_is_accepted_with_the_override() {
        let mut table = HcallTable::new();
        table.register(reserved::TEST, Box::new(|_| 0), true).unwrap();
        assert!(table.is_registered(reserved::TEST));
    }

    #[test]
    fn registered_handler_sees_the_guest_registers() {
        let mut table = HcallTable::new();
        table
            .register(0x100, Box::new(|args: &HcallArgs| args.regs[0] as i64), false)
            .unwrap();
        let args = HcallArgs {
            regs: &[7, 0, 0, 0, 0, 0],
        };
        assert_eq!(table.dispatch(0x100, &args).unwrap(), 7);
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut table = HcallTable::new();
        table.register(0x200, Box::new(|_| 0), false).unwrap();
        assert!(matches!(
            table.register(0x200, Box::new(|_| 0), false),
            Err(HcallError::AlreadyRegistered(0x200))
        ));
    }

    #[test]
    fn reserved_stubs_answer_the_frequency_query() {
        let mut table = HcallTable::new();
        table.install_reserved_stubs(3_000_000_000);
        let args = HcallArgs { regs: &[0; 6] };
        assert_eq!(
            table.dispatch(reserved::CPU_FREQUENCY_QUERY, &args).unwrap(),
            3_000_000_000
        );
    }
}


