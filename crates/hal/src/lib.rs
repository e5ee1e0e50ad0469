#![cfg_attr(not(test), no_std)]

/// Physical address type.
pub type PhysAddr = u64;

/// Virtual address type.
pub type VirtAddr = u64;

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: u64 = 0x1000;

/// Common error codes used by kernel interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    InvalidArg,
    NoMem,
    NoPerm,
    NotFound,
    Access,
    NoExec,
    Loop,
    NoChild,
}

impl Errno {
    /// Returns the negative errno value handed back to userspace.
    pub const fn code(self) -> i32 {
        match self {
            Errno::NoPerm => -1,
            Errno::NotFound => -2,
            Errno::NoExec => -8,
            Errno::NoChild => -10,
            Errno::NoMem => -12,
            Errno::Access => -13,
            Errno::InvalidArg => -22,
            Errno::Loop => -40,
        }
    }
}

/// Legacy two-level page entry flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(u32);

impl PageFlags {
    pub const NONE: Self = Self(0);
    pub const PRESENT: Self = Self(1 << 0);
    pub const WRITABLE: Self = Self(1 << 1);
    pub const USER: Self = Self(1 << 2);
    pub const ACCESSED: Self = Self(1 << 5);
    pub const DIRTY: Self = Self(1 << 6);

    /// Mask of every flag bit an entry may carry.
    pub const MASK: u32 = 0x67;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::MASK)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Flags for a present page with the given privilege and write access.
    pub const fn for_mapping(kernel: bool, writable: bool) -> Self {
        let mut bits = Self::PRESENT.0;
        if writable {
            bits |= Self::WRITABLE.0;
        }
        if !kernel {
            bits |= Self::USER.0;
        }
        Self(bits)
    }
}

/// Page-fault details captured by the architecture trap handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    /// Faulting virtual address.
    pub addr: VirtAddr,
    /// Instruction pointer at the time of the fault.
    pub ip: usize,
    /// Raw hardware error code.
    pub error_code: u32,
}

impl FaultInfo {
    pub const fn not_present(&self) -> bool {
        self.error_code & 0x1 == 0
    }

    pub const fn write(&self) -> bool {
        self.error_code & 0x2 != 0
    }

    pub const fn user(&self) -> bool {
        self.error_code & 0x4 != 0
    }

    pub const fn reserved(&self) -> bool {
        self.error_code & 0x8 != 0
    }

    pub const fn instruction_fetch(&self) -> bool {
        self.error_code & 0x10 != 0
    }
}

/// Access to physical memory frames.
pub trait PhysMemory {
    /// Total bytes of physical memory backing this machine.
    fn size(&self) -> u64;

    /// Reads bytes starting at a physical address.
    fn read(&self, pa: PhysAddr, buf: &mut [u8]);

    /// Writes bytes starting at a physical address.
    fn write(&mut self, pa: PhysAddr, data: &[u8]);

    /// Translates a kernel object pointer (e.g. a page table) to its physical address.
    fn virt_to_phys(&self, ptr: *const u8) -> PhysAddr;

    /// Copies one whole frame.
    fn copy_frame(&mut self, src: PhysAddr, dst: PhysAddr) {
        let mut page = [0u8; PAGE_SIZE as usize];
        self.read(src, &mut page);
        self.write(dst, &page);
    }

    /// Fills one whole frame with zeroes.
    fn zero_frame(&mut self, pa: PhysAddr) {
        self.write(pa, &[0u8; PAGE_SIZE as usize]);
    }
}

/// Interrupt masking for the current core.
pub trait Interrupts: Clone {
    /// Masks interrupts and returns whether they were enabled before.
    fn disable(&self) -> bool;

    /// Restores the state returned by a previous `disable`.
    fn restore(&self, was_enabled: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_flags_union_and_contains() {
        let flags = PageFlags::PRESENT.union(PageFlags::WRITABLE);
        assert!(flags.contains(PageFlags::PRESENT));
        assert!(flags.contains(PageFlags::WRITABLE));
        assert!(!flags.contains(PageFlags::USER));
    }

    #[test]
    fn mapping_flags_follow_privilege() {
        let user = PageFlags::for_mapping(false, true);
        assert_eq!(user.bits(), 0x7);
        let kernel = PageFlags::for_mapping(true, false);
        assert_eq!(kernel.bits(), 0x1);
    }

    #[test]
    fn from_bits_drops_unknown_bits() {
        assert_eq!(PageFlags::from_bits(0xFFFF_F067).bits(), 0x67);
    }

    #[test]
    fn errno_codes_are_negative() {
        assert_eq!(Errno::InvalidArg.code(), -22);
        assert_eq!(Errno::Loop.code(), -40);
        assert_eq!(Errno::NoExec.code(), -8);
    }

    #[test]
    fn fault_info_decodes_error_code() {
        let fault = FaultInfo {
            addr: 0x1000,
            ip: 0x2000,
            error_code: 0x6,
        };
        assert!(fault.not_present());
        assert!(fault.write());
        assert!(fault.user());
        assert!(!fault.reserved());
        assert!(!fault.instruction_fetch());
    }
}
