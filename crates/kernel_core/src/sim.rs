//! Hosted physical memory for running the core outside a machine.

use alloc::vec;
use alloc::vec::Vec;

use hal::{PhysAddr, PhysMemory};

/// Physical RAM backed by a heap buffer.
///
/// Kernel objects live in the host heap, so `virt_to_phys` reports their
/// pointer value; those addresses are never read through this memory.
#[derive(Debug, Clone)]
pub struct SimulatedRam {
    bytes: Vec<u8>,
}

impl SimulatedRam {
    pub fn new(size: u64) -> Self {
        Self {
            bytes: vec![0; size as usize],
        }
    }

    fn range(&self, pa: PhysAddr, len: usize) -> core::ops::Range<usize> {
        let start = pa as usize;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .unwrap_or_else(|| {
                panic!("physical access {:#x}+{:#x} outside simulated RAM", pa, len)
            });
        start..end
    }
}

impl PhysMemory for SimulatedRam {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read(&self, pa: PhysAddr, buf: &mut [u8]) {
        let range = self.range(pa, buf.len());
        buf.copy_from_slice(&self.bytes[range]);
    }

    fn write(&mut self, pa: PhysAddr, data: &[u8]) {
        let range = self.range(pa, data.len());
        self.bytes[range].copy_from_slice(data);
    }

    fn virt_to_phys(&self, ptr: *const u8) -> PhysAddr {
        ptr as usize as PhysAddr
    }

    fn copy_frame(&mut self, src: PhysAddr, dst: PhysAddr) {
        let len = hal::PAGE_SIZE as usize;
        let from = self.range(src, len);
        let to = self.range(dst, len);
        self.bytes.copy_within(from, to.start);
    }
}
