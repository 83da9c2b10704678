//! Crate-wide error taxonomy.
//!
//! Every subsystem exposes its own leaf error type (`MmapError`, `PagingError`,
//! `IntrError`, ...) and converts into [`VmError`] at the boundary where the
//! exit dispatcher decides what to do about it. The taxonomy mirrors §7 of the
//! design: guest-caused conditions recover by injection, everything else
//! escalates the VM to the `ERROR` run-state.

use thiserror::Error;

#[cfg(target_os = "linux")]
use crate::kvm_backend::KvmError;

/// The six-way error taxonomy the exit dispatcher reasons about.
///
/// `GuestFault` and `GuestRequest` are not failures of the VMM: they are the
/// normal, expected ways a guest interacts with virtualized hardware, and are
/// recovered from locally (inject an exception, run a handler). Everything
/// else is fatal to the VM as a whole.
#[derive(Error, Debug)]
pub enum VmError {
    /// The guest executed something that requires injecting an architectural
    /// exception (e.g. a real page fault, a #GP on a privileged instruction).
    /// Recovery is: inject, resume. Never surfaced to the host as a failure.
    #[error("guest fault: vector {vector} (error_code={error_code:?})")]
    GuestFault { vector: u8, error_code: Option<u32> },

    /// An explicit hypercall or an expected MMIO/IO access the VMM routes to
    /// a registered handler. Recovery is: run the handler.
    #[error("guest request: {0}")]
    GuestRequest(String),

    /// A hardware exit the core does not recognize at all.
    #[error("unknown exit reason: {0}")]
    UnknownExit(String),

    /// Instruction bytes at guest RIP could not be read or decoded.
    /// If the guest is at fault for the read (e.g. RIP is unmapped), inject
    /// #UD; otherwise this is a VMM error.
    #[error("instruction decode failure at rip={rip:#x}: {reason}")]
    DecodeFailure { rip: u64, reason: String },

    /// The host allocator returned nothing (e.g. during on-demand page-in).
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Bad or inconsistent VM configuration discovered at creation time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Fatal: the VM's run-state must move to ERROR, all VCPUs stop, events
    /// drain, and the host is notified.
    #[error("fatal VM error: {0}")]
    VMError(String),

    /// A lower-level KVM backend operation failed.
    #[cfg(target_os = "linux")]
    #[error(transparent)]
    Kvm(#[from] KvmError),

    /// Guest memory map lookup/insert/remove failure.
    #[error(transparent)]
    Mmap(#[from] crate::mmap::MmapError),

    /// Paging engine failure (shadow or nested).
    #[error(transparent)]
    Paging(#[from] crate::paging::PagingError),
}

impl VmError {
    /// True if this error represents a normal guest-visible event (injection
    /// or handler dispatch) rather than a VMM failure that should stop the VM.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, VmError::GuestFault { .. } | VmError::GuestRequest(_))
    }

    /// Map an ordinary handler's negative return value to a `VMError`, per
    /// §7's propagation policy ("handler returns 0 for success, negative for
    /// failure... dispatcher maps negative returns to VMError").
    pub fn from_handler_return(code: i64, context: &str) -> Option<Self> {
        if code < 0 {
            Some(VmError::VMError(format!(
                "{context} handler returned {code}"
            )))
        } else {
            None
        }
    }
}

pub type VmResult<T> = Result<T, VmError>;


