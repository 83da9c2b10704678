//! Host services the core depends on but does not implement itself (§6:
//! "the host environment"): page allocation, per-core thread lifecycle,
//! monotonic time, host TSC frequency discovery, and the four-severity
//! logging hooks the rest of the crate calls through [`log`].
//!
//! `NativeHostEnvironment` is the production implementation, backed by
//! `libc::mmap`/`munmap` and `std::thread`. Tests and the demo binary can
//! substitute a different `HostEnvironment` (e.g. one backed by a plain
//! `Vec<u8>`) without touching the paging, exit-dispatch, or orchestration
//! code, which only ever see the trait.

#[cfg(target_os = "linux")]
pub mod guest_memory;

use std::time::Instant;

use thiserror::Error;

#[cfg(target_os = "linux")]
pub use guest_memory::GuestMemory;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("host page allocation of {0} bytes failed")]
    Allocation(usize),
    #[error("host memory operation out of bounds: {0}")]
    OutOfBounds(String),
}

/// Maps the host's four print severities onto `log::Level` (§6: "forward to
/// whatever logging facility the embedding application uses").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<Severity> for log::Level {
    fn from(s: Severity) -> Self {
        match s {
            Severity::Debug => log::Level::Debug,
            Severity::Info => log::Level::Info,
            Severity::Warn => log::Level::Warn,
            Severity::Error => log::Level::Error,
        }
    }
}

/// Everything the core needs from its embedding host, kept as a trait so
/// the demo binary, tests, and a real hypervisor host process can each
/// supply their own (§6's "host callback table").
pub trait HostEnvironment: Send + Sync {
    /// Allocate `count` host pages (4 KiB each), returning the host-virtual
    /// base address and total size in bytes.
    fn allocate_pages(&self, count: usize) -> Result<(u64, u64), HostError>;

    /// Free a region previously returned by `allocate_pages`.
    fn free_pages(&self, host_virtual_base: u64, size: u64);

    /// Spawn a host thread to drive one VCPU's run loop (§5: "each core
    /// runs on its own host thread").
    fn spawn_core_thread(
        &self,
        name: String,
        body: Box<dyn FnOnce() + Send>,
    ) -> std::thread::JoinHandle<()>;

    /// Yield the calling thread, used by the `Friendly`/`Adaptive`
    /// scheduling strategies between guest entries (§4.8).
    fn yield_now(&self);

    /// Nanoseconds since an arbitrary but fixed epoch; used only for
    /// relative timing (timer deadlines, barrier timeouts).
    fn monotonic_time_ns(&self) -> u64;

    /// The host TSC's frequency in Hz, if known. `None` means the core must
    /// not scale TSC reads (§4.7 open question: "TSC scaling is absent
    /// unless the host positively reports its frequency").
    fn tsc_frequency_hz(&self) -> Option<u64>;

    /// Forward a log line at the given severity.
    fn print(&self, severity: Severity, message: &str);
}

/// The production `HostEnvironment`: real anonymous host memory via
/// `libc::mmap`, real OS threads, `std::time::Instant` for monotonic time,
/// and `log` macros for printing.
pub struct NativeHostEnvironment {
    start: Instant,
}

impl Default for NativeHostEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeHostEnvironment {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl HostEnvironment for NativeHostEnvironment {
    fn allocate_pages(&self, count: usize) -> Result<(u64, u64), HostError> {
        let size = count.checked_mul(4096).ok_or(HostError::Allocation(count))?;
        if size == 0 {
            return Err(HostError::Allocation(0));
        }
        // SAFETY: requesting an anonymous, private mapping; no file
        // descriptor involved, and the returned pointer is owned exclusively
        // by the caller until it is passed back to `free_pages`.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(HostError::Allocation(size));
        }
        Ok((ptr as u64, size as u64))
    }

    fn free_pages(&self, host_virtual_base: u64, size: u64) {
        if host_virtual_base == 0 || size == 0 {
            return;
        }
        // SAFETY: caller guarantees this range came from a matching
        // `allocate_pages` call and is not in use elsewhere.
        unsafe {
            libc::munmap(host_virtual_base as *mut libc::c_void, size as usize);
        }
    }

    fn spawn_core_thread(
        &self,
        name: String,
        body: Box<dyn FnOnce() + Send>,
    ) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name(name)
            .spawn(body)
            .expect("failed to spawn core thread")
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn monotonic_time_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn tsc_frequency_hz(&self) -> Option<u64> {
        // Real deployments source this from `kvm_ioctls::VcpuFd::get_tsc_khz`
        // once a vCPU exists (see `kvm_backend::vm::VmFd::create_vcpu`); the
        // host environment itself has no TSC frequency to offer before that.
        None
    }

    fn print(&self, severity: Severity, message: &str) {
        log::log!(log::Level::from(severity), "{message}");
    }
}

/// Bridges the `log` facade back to a host's own four-severity print hook,
/// for embedders that want every log line routed through their own sink
/// rather than whatever `log::set_boxed_logger` the process installed.
/// Construct with the host and install with `log::set_boxed_logger`; most
/// callers are better served by an ordinary `log` backend (`env_logger`,
/// the demo binary's choice) and never need this.
pub struct HostLogger<H: HostEnvironment> {
    host: std::sync::Arc<H>,
}

impl<H: HostEnvironment> HostLogger<H> {
    pub fn new(host: std::sync::Arc<H>) -> Self {
        Self { host }
    }
}

impl<H: HostEnvironment + 'static> log::Log for HostLogger<H> {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let severity = match record.level() {
            log::Level::Error => Severity::Error,
            log::Level::Warn => Severity::Warn,
            log::Level::Info => Severity::Info,
            log::Level::Debug | log::Level::Trace => Severity::Debug,
        };
        self.host
            .print(severity, &format!("{}: {}", record.target(), record.args()));
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_round_trips() {
        let host = NativeHostEnvironment::new();
        let (hva, size) = host.allocate_pages(4).unwrap();
        assert_eq!(size, 4 * 4096);
        assert_ne!(hva, 0);
        host.free_pages(hva, size);
    }

    #[test]
    fn zero_pages_is_an_error() {
        let host = NativeHostEnvironment::new();
        assert!(host.allocate_pages(0).is_err());
    }

    #[test]
    fn monotonic_time_is_nondecreasing() {
        let host = NativeHostEnvironment::new();
        let a = host.monotonic_time_ns();
        let b = host.monotonic_time_ns();
        assert!(b >= a);
    }

    struct RecordingHost {
        lines: std::sync::Mutex<Vec<(Severity, String)>>,
    }

    impl HostEnvironment for RecordingHost {
        fn allocate_pages(&self, _count: usize) -> Result<(u64, u64), HostError> {
            unimplemented!()
        }
        fn free_pages(&self, _host_virtual_base: u64, _size: u64) {}
        fn spawn_core_thread(
            &self,
            _name: String,
            _body: Box<dyn FnOnce() + Send>,
        ) -> std::thread::JoinHandle<()> {
            unimplemented!()
        }
        fn yield_now(&self) {}
        fn monotonic_time_ns(&self) -> u64 {
            0
        }
        fn tsc_frequency_hz(&self) -> Option<u64> {
            None
        }
        fn print(&self, severity: Severity, message: &str) {
            self.lines.lock().unwrap().push((severity, message.to_string()));
        }
    }

    #[test]
    fn host_logger_forwards_records_to_the_host_print_hook() {
        let host = std::sync::Arc::new(RecordingHost {
            lines: std::sync::Mutex::new(Vec::new()),
        });
        let logger = HostLogger::new(host.clone());
        let record = log::Record::builder()
            .level(log::Level::Warn)
            .target("vmmcore::test")
            .args(format_args!("disk almost full"))
            .build();
        logger.log(&record);
        let lines = host.lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, Severity::Warn);
        assert!(lines[0].1.contains("disk almost full"));
    }
}


