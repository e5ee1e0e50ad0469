#![no_std]
#![feature(alloc_error_handler)]

extern crate alloc;

#[cfg(feature = "x86_64")]
use arch_x86_64 as arch;

pub mod allocator;
pub mod boot;
pub mod console;
#[cfg(feature = "x86_64")]
pub mod init;
pub mod logger;

#[cfg(feature = "x86_64")]
use kernel_core::BootInfo;

/// Kernel entrypoint invoked by the bootloader.
#[cfg(feature = "x86_64")]
pub fn entry(boot_info: BootInfo, kernel_virtual_base: u64) -> ! {
    allocator::init_heap();
    logger::init(log::LevelFilter::Info);
    kprintln!("kernel entry");
    arch::set_memory_offsets(boot_info.hhdm_offset, kernel_virtual_base, boot_info.kernel_start);
    arch::init();

    log::info!(
        "boot: regions={}, kernel=[{:#x}-{:#x}], heap free={} bytes",
        boot_info.memory_map.len(),
        boot_info.kernel_start,
        boot_info.kernel_end,
        allocator::free_bytes()
    );

    let initramfs = boot_info.initramfs.map(|(start, end)| {
        let size = end.saturating_sub(start) as usize;
        unsafe { core::slice::from_raw_parts(start as *const u8, size) }
    });

    match init::start(&boot_info, initramfs, kernel_virtual_base) {
        Ok(pid) => log::info!("init: queued pid {}", pid),
        Err(err) => log::error!("init: failed to start ({:?})", err),
    }
    init::report();

    arch::enable_interrupts();
    arch::halt_loop();
}
