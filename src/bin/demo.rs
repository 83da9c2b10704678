//! Minimal demonstration binary: builds a VM from command-line arguments,
//! walks it from `INVALID` to `RUNNING`, registers the reserved hypercall
//! stubs, and parks at the barrier once before stopping.
//!
//! This intentionally does not reimplement a full guest boot path (kernel
//! loading, ACPI/MPTable construction, virtio devices): that belongs to an
//! embedding host, not to this crate's core.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use vmmcore::config::StaticConfigNode;
use vmmcore::host::NativeHostEnvironment;
use vmmcore::vm::VM;

#[derive(Parser, Debug)]
#[command(name = "vmmcore-demo")]
#[command(about = "Exercises the VMM core orchestration path without a real guest")]
struct Args {
    /// Number of virtual cores to orchestrate.
    #[arg(short = 'c', long, default_value = "1")]
    vcpus: u32,

    /// Guest memory size in megabytes.
    #[arg(short, long, default_value = "64")]
    memory: u64,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        log::error!("demo failed: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let host = Arc::new(NativeHostEnvironment::new());
    let node = StaticConfigNode::new()
        .with_val("vcpu_count", &args.vcpus.to_string())
        .with_val("memory_size_bytes", &(args.memory * 1024 * 1024).to_string());

    let vm = VM::create(1, &node, host)?;
    log::info!(
        "VM {} created with {} core(s), paging strategy {:?}",
        vm.id(),
        vm.core_count(),
        vm.paging_strategy()
    );

    vm.mark_running();
    vm.with_barrier(|_mmap, _io, _msr, hcalls, _events| {
        log::info!(
            "reserved hypercall {:#x} registered: {}",
            vmmcore::hcalls::reserved::TEST,
            hcalls.is_registered(vmmcore::hcalls::reserved::TEST)
        );
    });
    vm.stop();
    log::info!("VM {} stopped", vm.id());

    Ok(())
}


