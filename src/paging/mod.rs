//! Two-level memory virtualization: shadow paging and nested/EPT paging
//! behind one contract (§4.3).

pub mod arena;
pub mod nested;
pub mod shadow;

use thiserror::Error;

use crate::mmap::Mmap;

pub use nested::NestedPaging;
pub use shadow::ShadowPaging;

#[derive(Error, Debug)]
pub enum PagingError {
    #[error("guest page table walk failed reading gpa {0:#x}")]
    GuestWalkRead(u64),
    #[error("no shadow/EPT state is active (guest CR3 not yet loaded)")]
    Inactive,
    #[error("host allocator exhausted while resolving fault at {0:#x}")]
    AllocationFailed(u64),
    #[error(transparent)]
    Mmap(#[from] crate::mmap::MmapError),
}

/// Access to guest-physical bytes, as distinct from `Mmap`'s metadata-only
/// region bookkeeping. Backed in production by the host's mapped guest RAM
/// (`vm-memory`); backed in tests by a plain `Vec<u8>`.
pub trait GuestBytes {
    fn read(&self, hpa: u64, buf: &mut [u8]);
    fn write(&mut self, hpa: u64, buf: &[u8]);

    fn read_u64(&self, hpa: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read(hpa, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u64(&mut self, hpa: u64, value: u64) {
        self.write(hpa, &value.to_le_bytes());
    }

    fn read_u32(&self, hpa: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read(hpa, &mut buf);
        u32::from_le_bytes(buf)
    }
}

/// A plain byte buffer playing the role of host-backed guest RAM; used by
/// the shadow/nested paging unit tests and by small standalone demos.
pub struct FlatGuestMemory {
    bytes: Vec<u8>,
}

impl FlatGuestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size],
        }
    }
}

impl GuestBytes for FlatGuestMemory {
    fn read(&self, hpa: u64, buf: &mut [u8]) {
        let start = hpa as usize;
        let end = start + buf.len();
        buf.copy_from_slice(&self.bytes[start..end]);
    }

    fn write(&mut self, hpa: u64, buf: &[u8]) {
        let start = hpa as usize;
        let end = start + buf.len();
        self.bytes[start..end].copy_from_slice(buf);
    }
}

/// The processor mode derived from CR0/CR4/EFER after a control-register
/// write (§4.1: "derive the new CPU mode").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Protected,
    ProtectedPae,
    Long,
    LongCompat,
}

/// Bits of interest in CR0/CR4/EFER for mode derivation.
pub struct ModeInputs {
    pub cr0_pe: bool,
    pub cr0_pg: bool,
    pub cr4_pae: bool,
    pub efer_lme: bool,
    pub efer_lma: bool,
    /// Current code-segment L bit (64-bit vs compatibility submode), only
    /// meaningful when `efer_lma` is set.
    pub cs_long_bit: bool,
}

pub fn derive_cpu_mode(inputs: &ModeInputs) -> CpuMode {
    if !inputs.cr0_pe {
        return CpuMode::Real;
    }
    if inputs.efer_lma {
        return if inputs.cs_long_bit {
            CpuMode::Long
        } else {
            CpuMode::LongCompat
        };
    }
    if !inputs.cr0_pg {
        return CpuMode::Protected;
    }
    if inputs.cr4_pae {
        CpuMode::ProtectedPae
    } else {
        CpuMode::Protected
    }
}

/// Classification of a page-fault error code (§4.3 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    NotPresent,
    WriteProtection,
    UserSupervisor,
    ReservedBit,
    InstructionFetch,
}

/// x86 page-fault error-code bit layout.
mod pf_bits {
    pub const PRESENT: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const USER: u32 = 1 << 2;
    pub const RESERVED: u32 = 1 << 3;
    pub const INSTRUCTION_FETCH: u32 = 1 << 4;
}

/// Classify a fault from its error code. Priority matches the order the
/// processor itself checks conditions: a reserved-bit violation and an
/// instruction fetch are reported first since they are unambiguous, then
/// write-protection / user-supervisor, falling back to not-present.
pub fn classify_fault(error_code: u32) -> FaultClass {
    if error_code & pf_bits::RESERVED != 0 {
        FaultClass::ReservedBit
    } else if error_code & pf_bits::INSTRUCTION_FETCH != 0 {
        FaultClass::InstructionFetch
    } else if error_code & pf_bits::PRESENT == 0 {
        FaultClass::NotPresent
    } else if error_code & pf_bits::WRITE != 0 {
        FaultClass::WriteProtection
    } else if error_code & pf_bits::USER != 0 {
        FaultClass::UserSupervisor
    } else {
        FaultClass::NotPresent
    }
}

/// What the dispatcher should do after a fault was handed to the paging
/// engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The mapping was installed/updated; resume the guest at the same RIP.
    Resolved,
    /// The guest itself would fault (its own page tables say so, or the
    /// region forbids the access); inject #PF with this address/error code.
    InjectPageFault { address: u64, error_code: u32 },
    /// An unhandled-fault region callback said to fail the VM.
    Fail,
}

/// Requested page size for an installed mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size1G,
}

impl PageSize {
    pub fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => 0x1000,
            PageSize::Size2M => 0x20_0000,
            PageSize::Size1G => 0x4000_0000,
        }
    }
}

/// Access requested at the faulting address, used to pick the fault class
/// and (for shadow paging) to decide which permission bit to demand from the
/// guest walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Bundles the bits `handle_fault` needs from the VM around it: the region
/// map (mutated in place when an `Unallocated` region is backed on demand),
/// a byte-level view of guest RAM, and a host allocator callback. `alloc`
/// takes a page-aligned GPA and the page size to back and returns the
/// host-physical base to use, or `None` on allocation failure (§4.8:
/// "Host allocation failure during on-demand page-in: surface as a FAIL
/// exit").
pub struct FaultContext<'a> {
    pub mmap: &'a mut Mmap,
    pub mem: &'a mut dyn GuestBytes,
    pub alloc: &'a mut dyn FnMut(u64, u64) -> Option<u64>,
}

/// The common surface both paging strategies implement. `core_id` identifies
/// which VCPU's paging state this call concerns (shadow paging is
/// per-VCPU; nested paging is shared VM-wide but the parameter is kept for
/// symmetry and for per-core invalidation bookkeeping).
pub trait PagingEngine {
    /// Resolve a fault. `fault_addr` is CR2 (shadow) or the violating GPA
    /// (nested).
    fn handle_fault(
        &mut self,
        ctx: &mut FaultContext,
        fault_addr: u64,
        access: AccessKind,
        guest_error_code: u32,
    ) -> Result<FaultResolution, PagingError>;

    /// Invalidate `[start, end)`; returns the actual affected range, which
    /// may be wider because leaves can span multiple pages.
    fn invalidate_range(&mut self, start: u64, end: u64) -> (u64, u64);

    /// A single-address INVLPG.
    fn invlpg(&mut self, addr: u64) {
        self.invalidate_range(addr & !0xFFF, (addr & !0xFFF) + 0x1000);
    }

    /// CR3 was reloaded with a new value (shadow paging invalidates its
    /// active table; nested paging is indifferent but still notified so
    /// per-core bookkeeping, e.g. ASID/VPID tagging in a real backend, can
    /// react).
    fn on_cr3_reload(&mut self, new_guest_cr3: u64);

    /// The engine is about to start being used (guest turned on paging, or
    /// the VM is entering nested mode for the first time).
    fn activate(&mut self);
}

/// Which of the two strategies a VM is configured to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingStrategy {
    Shadow,
    Nested,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_derivation_covers_all_five_modes() {
        let real = ModeInputs {
            cr0_pe: false,
            cr0_pg: false,
            cr4_pae: false,
            efer_lme: false,
            efer_lma: false,
            cs_long_bit: false,
        };
        assert_eq!(derive_cpu_mode(&real), CpuMode::Real);

        let protected = ModeInputs {
            cr0_pe: true,
            cr0_pg: false,
            ..real
        };
        assert_eq!(derive_cpu_mode(&protected), CpuMode::Protected);

        let paged32 = ModeInputs {
            cr0_pe: true,
            cr0_pg: true,
            cr4_pae: false,
            ..real
        };
        assert_eq!(derive_cpu_mode(&paged32), CpuMode::Protected);

        let pae = ModeInputs {
            cr0_pe: true,
            cr0_pg: true,
            cr4_pae: true,
            ..real
        };
        assert_eq!(derive_cpu_mode(&pae), CpuMode::ProtectedPae);

        let long = ModeInputs {
            cr0_pe: true,
            cr0_pg: true,
            cr4_pae: true,
            efer_lme: true,
            efer_lma: true,
            cs_long_bit: true,
        };
        assert_eq!(derive_cpu_mode(&long), CpuMode::Long);

        let long_compat = ModeInputs {
            cs_long_bit: false,
            ..long
        };
        assert_eq!(derive_cpu_mode(&long_compat), CpuMode::LongCompat);
    }

    #[test]
    fn fault_classification_priority() {
        use pf_bits::*;
        assert_eq!(classify_fault(0), FaultClass::NotPresent);
        assert_eq!(classify_fault(PRESENT | WRITE), FaultClass::WriteProtection);
        assert_eq!(classify_fault(PRESENT | USER), FaultClass::UserSupervisor);
        assert_eq!(classify_fault(RESERVED), FaultClass::ReservedBit);
        assert_eq!(
            classify_fault(INSTRUCTION_FETCH),
            FaultClass::InstructionFetch
        );
    }
}


