//! Memory layout and limits for the process core.

use alloc::string::String;

use hal::VirtAddr;

/// Bytes covered by one page table in the two-level layout (4 MiB).
pub const TABLE_SPAN: u64 = 0x40_0000;

/// Largest virtual address representable by the two-level layout.
pub const ADDRESS_SPACE_END: u64 = 0x1_0000_0000;

/// Layout and limit configuration consumed by [`crate::Kernel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Start of the kernel text; saved instruction pointers must fall inside the code range.
    pub code_start: VirtAddr,
    /// End of the kernel text.
    pub code_end: VirtAddr,
    /// End of the identity-mapped kernel image.
    pub kernel_image_end: VirtAddr,
    /// First byte of the kernel heap.
    pub heap_start: VirtAddr,
    /// Exclusive upper bound of the kernel heap.
    pub heap_end: VirtAddr,
    /// Lowest virtual address a loadable segment may use.
    pub user_image_min: VirtAddr,
    /// Start of the shared-memory region; user tables at or above it are not cloned.
    pub shm_start: VirtAddr,
    /// Top of the user stack region.
    pub user_stack_top: VirtAddr,
    /// Size of the user stack region.
    pub user_stack_size: u64,
    /// Size of each kernel stack.
    pub kernel_stack_size: usize,
    /// Deepest interpreter chain accepted by exec.
    pub max_interp_depth: u32,
    /// Path of the dynamic linker used for images with a dynamic segment.
    pub dynamic_linker: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            code_start: 0x0010_0000,
            code_end: 0x0080_0000,
            kernel_image_end: 0x0080_0000,
            heap_start: 0x0080_0000,
            heap_end: 0x2000_0000,
            user_image_min: 0x2000_0000,
            shm_start: 0xB000_0000,
            user_stack_top: 0xB000_0000,
            user_stack_size: 0x8_0000,
            kernel_stack_size: 0x2000,
            max_interp_depth: 4,
            dynamic_linker: String::from("/lib/ld.so"),
        }
    }
}

impl KernelConfig {
    /// Layout that fits in a few MiB of physical memory.
    pub fn small() -> Self {
        Self {
            code_start: 0x0001_0000,
            code_end: 0x0010_0000,
            kernel_image_end: 0x0010_0000,
            heap_start: 0x0040_0000,
            heap_end: 0x0080_0000,
            user_image_min: 0x0080_0000,
            shm_start: 0x0200_0000,
            user_stack_top: 0x0200_0000,
            user_stack_size: 0x4000,
            ..Self::default()
        }
    }

    /// Returns true if a saved instruction pointer lies in kernel text.
    pub fn is_kernel_code(&self, ip: usize) -> bool {
        let ip = ip as u64;
        ip >= self.code_start && ip < self.code_end
    }

    /// Lowest address of the user stack region.
    pub fn user_stack_bottom(&self) -> VirtAddr {
        self.user_stack_top - self.user_stack_size
    }
}
