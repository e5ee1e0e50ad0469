//! Brings up the process model on real hardware and loads `/bin/init`.
//!
//! The model's page directories use the legacy two-level entry format, which
//! long mode cannot load into CR3. Init is therefore built and queued but never
//! dispatched here, and no trap handler feeds the scheduler: the CPU stays on
//! the idle task and so does the model.

use alloc::boxed::Box;

use arch_x86_64::{CpuInterrupts, HhdmMemory};
use hal::Errno;
use kernel_core::{
    load_initramfs, BootInfo, CoreLocal, DefaultSignals, FrameAllocator, Kernel, KernelConfig,
    MemoryVfs, Pid,
};

use crate::kprintln;

pub type BootKernel = Kernel<HhdmMemory, CpuInterrupts>;

const INIT_PATH: &str = "/bin/init";
const INIT_ENV: [&str; 2] = ["PATH=/bin", "HOME=/"];

static KERNEL: CoreLocal<BootKernel> = CoreLocal::new();

/// Builds the kernel context from the boot memory map and queues init.
pub fn start(
    boot_info: &BootInfo,
    initramfs: Option<&[u8]>,
    kernel_virtual_base: u64,
) -> Result<Pid, Errno> {
    let frames = FrameAllocator::from_memory_map(boot_info.memory_map);
    frames.mark_range(boot_info.kernel_start, boot_info.kernel_end);
    frames.set_diagnostic_hook(print_diagnostics);
    log::info!(
        "init: {} KiB usable, {} frames tracked",
        boot_info.usable_bytes() / 1024,
        frames.total_frames()
    );

    let vfs = match initramfs {
        Some(bytes) => load_initramfs(bytes)?,
        None => {
            log::warn!("init: no initramfs provided");
            MemoryVfs::new()
        }
    };
    let config = KernelConfig {
        code_start: kernel_virtual_base,
        code_end: kernel_virtual_base + (boot_info.kernel_end - boot_info.kernel_start),
        ..KernelConfig::default()
    };
    let memory = HhdmMemory::new(boot_info.memory_top());
    let mut kernel = Kernel::new(
        frames,
        memory,
        CpuInterrupts,
        config,
        Box::new(vfs),
        Box::new(DefaultSignals::default()),
    )?;
    let pid = kernel.spawn_process(INIT_PATH, &[INIT_PATH], &INIT_ENV)?;
    log::info!(
        "init: {} is pid {}, {} of {} KiB in use",
        INIT_PATH,
        pid,
        kernel.frames().memory_use_kib(),
        kernel.frames().memory_total_kib()
    );

    KERNEL.init(kernel);
    Ok(pid)
}

/// Logs where the scheduler stands once bring-up is done.
pub fn report() {
    let summary = KERNEL.with(|kernel| {
        (
            kernel.current_pid(),
            kernel.scheduler().ready_count(),
            kernel.process_count(),
        )
    });
    match summary {
        Some((current, ready, total)) => log::info!(
            "init: pid {} current, {} ready, {} records",
            current,
            ready,
            total
        ),
        None => log::warn!("init: process model not initialized"),
    }
}

fn print_diagnostics(lines: &[&str]) {
    for line in lines {
        kprintln!("{}", line);
    }
}
