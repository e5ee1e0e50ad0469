use hal::PhysAddr;

/// Boot information passed from platform-specific code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo<'a> {
    pub memory_map: &'a [MemoryRegion],
    pub kernel_start: PhysAddr,
    pub kernel_end: PhysAddr,
    pub initramfs: Option<(PhysAddr, PhysAddr)>,
    /// Offset of the bootloader's direct map of physical memory.
    pub hhdm_offset: u64,
}

impl BootInfo<'_> {
    /// Highest physical address reported by any region.
    pub fn memory_top(&self) -> PhysAddr {
        self.memory_map.iter().map(|region| region.end).max().unwrap_or(0)
    }

    /// Bytes of memory the bootloader marked usable.
    pub fn usable_bytes(&self) -> u64 {
        self.memory_map
            .iter()
            .filter(|region| region.kind == MemoryKind::Usable)
            .map(|region| region.end.saturating_sub(region.start))
            .sum()
    }
}

/// Describes a contiguous physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: PhysAddr,
    pub end: PhysAddr,
    pub kind: MemoryKind,
}

/// Enumerates the physical memory region types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Usable,
    Reserved,
    Mmio,
}
