use alloc::collections::BTreeMap;

use hal::{Errno, PhysAddr, PhysMemory, VirtAddr, PAGE_SIZE};

use crate::config::{KernelConfig, TABLE_SPAN};
use crate::paging::{PageDirectory, PteRef};
use crate::pmm::{align_down, align_up, FrameAllocator};

/// Identifies an address space in the space table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(u32);

impl SpaceId {
    /// The kernel directory; never freed.
    pub const KERNEL: Self = Self(0);

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// A reference-counted page directory.
#[derive(Debug)]
pub struct AddressSpace {
    refs: usize,
    dir: PageDirectory,
}

impl AddressSpace {
    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn directory(&self) -> &PageDirectory {
        &self.dir
    }
}

/// Kernel heap break state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHeap {
    pub start: VirtAddr,
    pub brk: VirtAddr,
    pub end: VirtAddr,
}

/// Virtual memory manager: frame allocator, physical memory and every live address space.
#[derive(Debug)]
pub struct Vmm<M: PhysMemory> {
    frames: FrameAllocator,
    memory: M,
    spaces: BTreeMap<SpaceId, AddressSpace>,
    next_space: u32,
    heap: KernelHeap,
    shm_start: VirtAddr,
}

impl<M: PhysMemory> Vmm<M> {
    /// Builds the kernel directory: identity maps the kernel image read-only
    /// and preallocates every kernel heap table so later clones alias them.
    pub fn new(frames: FrameAllocator, memory: M, config: &KernelConfig) -> Result<Self, Errno> {
        let mut dir = PageDirectory::new_kernel(&memory);
        let mut page = PAGE_SIZE;
        while page < config.kernel_image_end {
            dir.map_fixed(page, page, true, false, &frames, &memory)?;
            page += PAGE_SIZE;
        }

        let mut table = align_down(config.heap_start, TABLE_SPAN);
        while table < config.heap_end {
            dir.lookup(table, true, &memory).ok_or(Errno::InvalidArg)?;
            table += TABLE_SPAN;
        }
        let start = align_up(config.heap_start, PAGE_SIZE);
        log::debug!(
            "vmm: kernel directory at {:#x}, heap {:#x}..{:#x}",
            dir.physical_address(),
            start,
            config.heap_end
        );

        let mut spaces = BTreeMap::new();
        spaces.insert(SpaceId::KERNEL, AddressSpace { refs: 1, dir });
        Ok(Self {
            frames,
            memory,
            spaces,
            next_space: 1,
            heap: KernelHeap {
                start,
                brk: start,
                end: config.heap_end,
            },
            shm_start: config.shm_start,
        })
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn heap(&self) -> KernelHeap {
        self.heap
    }

    pub fn space(&self, id: SpaceId) -> Option<&AddressSpace> {
        self.spaces.get(&id)
    }

    pub fn refs(&self, id: SpaceId) -> usize {
        self.spaces.get(&id).map_or(0, AddressSpace::refs)
    }

    /// Physical address of the directory to load when switching to `id`.
    pub fn physical_address(&self, id: SpaceId) -> Result<PhysAddr, Errno> {
        Ok(self.directory(id)?.physical_address())
    }

    /// Creates a new space with a reference count of one from `src`.
    pub fn clone_space(&mut self, src: SpaceId) -> Result<SpaceId, Errno> {
        let source = self.spaces.get(&src).ok_or(Errno::InvalidArg)?;
        let dir = PageDirectory::clone_from(
            &source.dir,
            &self.frames,
            &mut self.memory,
            self.shm_start,
        );
        let id = SpaceId(self.next_space);
        self.next_space += 1;
        self.spaces.insert(id, AddressSpace { refs: 1, dir });
        log::trace!("vmm: cloned space {} into {}", src.0, id.0);
        Ok(id)
    }

    /// Takes another reference on `id`.
    pub fn retain(&mut self, id: SpaceId) -> Result<(), Errno> {
        let space = self.spaces.get_mut(&id).ok_or(Errno::InvalidArg)?;
        space.refs += 1;
        Ok(())
    }

    /// Drops one reference; at zero the user tables, their frames and the
    /// directory are freed. The kernel space is never freed.
    pub fn release(&mut self, id: SpaceId) -> Result<(), Errno> {
        let space = self.spaces.get_mut(&id).ok_or(Errno::InvalidArg)?;
        assert!(space.refs > 0, "address space reference count underflow");
        space.refs -= 1;
        if space.refs > 0 || id == SpaceId::KERNEL {
            return Ok(());
        }
        if let Some(mut space) = self.spaces.remove(&id) {
            space.dir.release_user_tables(&self.frames, self.shm_start);
            log::trace!("vmm: freed space {}", id.0);
        }
        Ok(())
    }

    /// Frees the user tables of `id` without touching its reference count.
    pub fn release_in_place(&mut self, id: SpaceId) -> Result<(), Errno> {
        if id == SpaceId::KERNEL {
            return Err(Errno::NoPerm);
        }
        let space = self.spaces.get_mut(&id).ok_or(Errno::InvalidArg)?;
        space.dir.release_user_tables(&self.frames, self.shm_start);
        Ok(())
    }

    /// Entry lookup within `id`; `make` allocates a missing table.
    pub fn lookup(&mut self, id: SpaceId, addr: VirtAddr, make: bool) -> Option<PteRef<'_>> {
        let space = self.spaces.get_mut(&id)?;
        space.dir.lookup(addr, make, &self.memory)
    }

    pub fn map_page(
        &mut self,
        id: SpaceId,
        addr: VirtAddr,
        kernel: bool,
        writable: bool,
    ) -> Result<(), Errno> {
        let space = self.spaces.get_mut(&id).ok_or(Errno::InvalidArg)?;
        space.dir.map_page(addr, kernel, writable, &self.frames, &mut self.memory)
    }

    /// Maps every page overlapping `[start, end)`.
    pub fn map_range(
        &mut self,
        id: SpaceId,
        start: VirtAddr,
        end: VirtAddr,
        kernel: bool,
        writable: bool,
    ) -> Result<(), Errno> {
        let mut page = align_down(start, PAGE_SIZE);
        while page < end {
            self.map_page(id, page, kernel, writable)?;
            page += PAGE_SIZE;
        }
        Ok(())
    }

    pub fn map_fixed(
        &mut self,
        id: SpaceId,
        addr: VirtAddr,
        phys: PhysAddr,
        kernel: bool,
        writable: bool,
    ) -> Result<(), Errno> {
        let space = self.spaces.get_mut(&id).ok_or(Errno::InvalidArg)?;
        space.dir.map_fixed(addr, phys, kernel, writable, &self.frames, &self.memory)
    }

    pub fn unmap_page(&mut self, id: SpaceId, addr: VirtAddr) -> Result<(), Errno> {
        let space = self.spaces.get_mut(&id).ok_or(Errno::InvalidArg)?;
        space.dir.unmap_page(addr, &self.frames, &self.memory);
        Ok(())
    }

    pub fn translate(&self, id: SpaceId, addr: VirtAddr) -> Option<PhysAddr> {
        self.spaces.get(&id)?.dir.translate(addr)
    }

    pub fn write_bytes(&mut self, id: SpaceId, addr: VirtAddr, data: &[u8]) -> Result<(), Errno> {
        let space = self.spaces.get(&id).ok_or(Errno::InvalidArg)?;
        space.dir.write_bytes(&mut self.memory, addr, data)
    }

    pub fn read_bytes(&self, id: SpaceId, addr: VirtAddr, buf: &mut [u8]) -> Result<(), Errno> {
        self.directory(id)?.read_bytes(&self.memory, addr, buf)
    }

    pub fn zero_bytes(&mut self, id: SpaceId, addr: VirtAddr, len: u64) -> Result<(), Errno> {
        let space = self.spaces.get(&id).ok_or(Errno::InvalidArg)?;
        space.dir.zero_bytes(&mut self.memory, addr, len)
    }

    /// Grows the kernel heap by `increment` bytes and returns the old break.
    ///
    /// The increment must be a whole number of pages and the new break must
    /// stay below the heap end. New pages are backed and zeroed.
    pub fn sbrk(&mut self, increment: u64) -> Result<VirtAddr, Errno> {
        if increment % PAGE_SIZE != 0 {
            return Err(Errno::InvalidArg);
        }
        let old = self.heap.brk;
        let new = old.checked_add(increment).ok_or(Errno::NoMem)?;
        if new > self.heap.end {
            log::warn!("vmm: kernel heap exhausted at {:#x}", old);
            return Err(Errno::NoMem);
        }
        self.map_range(SpaceId::KERNEL, old, new, true, true)?;
        self.zero_bytes(SpaceId::KERNEL, old, increment)?;
        self.heap.brk = new;
        Ok(old)
    }

    fn directory(&self, id: SpaceId) -> Result<&PageDirectory, Errno> {
        self.spaces.get(&id).map(|space| &space.dir).ok_or(Errno::InvalidArg)
    }
}
