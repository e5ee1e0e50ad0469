use hal::{Errno, VirtAddr};

use crate::config::{KernelConfig, ADDRESS_SPACE_END};

/// Returns true if `addr` lies in the user part of the address space.
pub fn is_user_address(config: &KernelConfig, addr: VirtAddr) -> bool {
    addr >= config.user_image_min && addr < config.shm_start
}

/// Validates that `[addr, addr + len)` stays inside user memory.
pub fn validate_user_range(config: &KernelConfig, addr: VirtAddr, len: u64) -> Result<(), Errno> {
    if len == 0 {
        return Err(Errno::InvalidArg);
    }
    let last = addr.checked_add(len - 1).ok_or(Errno::InvalidArg)?;
    if last >= ADDRESS_SPACE_END {
        return Err(Errno::InvalidArg);
    }
    if is_user_address(config, addr) && is_user_address(config, last) {
        Ok(())
    } else {
        Err(Errno::NoPerm)
    }
}

/// Short description of the region containing a faulting address.
pub fn describe_region(config: &KernelConfig, addr: VirtAddr) -> &'static str {
    if addr < hal::PAGE_SIZE {
        "null page"
    } else if addr < config.kernel_image_end {
        "kernel image"
    } else if addr >= config.heap_start && addr < config.heap_end {
        "kernel heap"
    } else if addr >= config.user_stack_bottom() && addr < config.user_stack_top {
        "user stack"
    } else if is_user_address(config, addr) {
        "user image"
    } else if addr >= config.shm_start && addr < ADDRESS_SPACE_END {
        "shared memory"
    } else {
        "unmapped"
    }
}
