//! Two-level page directory / page table structures.
//!
//! Kernel-range tables are shared by every directory and are only ever freed
//! with the kernel directory itself. User-range tables belong to exactly one
//! directory and are deep-copied when the directory is cloned.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};

use hal::{Errno, PageFlags, PhysAddr, PhysMemory, VirtAddr};
use spin::{Mutex, MutexGuard};

use crate::config::{ADDRESS_SPACE_END, TABLE_SPAN};
use crate::pmm::{FrameAllocator, FRAME_SIZE};

/// Number of entries in a page table and in a page directory.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Flags stored in a directory slot for a present table.
const TABLE_SLOT_FLAGS: u32 = 0x7;

/// A page table entry: frame index in bits 12..31, flags in the low bits.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte(u32);

impl Pte {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Index of the bound frame; 0 means unbound.
    pub const fn frame(self) -> u32 {
        self.0 >> 12
    }

    pub const fn has_frame(self) -> bool {
        self.frame() != 0
    }

    pub const fn phys_addr(self) -> PhysAddr {
        self.frame() as u64 * FRAME_SIZE
    }

    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits(self.0)
    }

    pub const fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    pub fn set_frame(&mut self, frame: u32) {
        self.0 = (frame << 12) | (self.0 & 0xFFF);
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & !PageFlags::MASK) | flags.bits();
    }

    /// Marks the entry present with the given privilege and write access,
    /// keeping the accessed and dirty bits.
    pub fn set_permissions(&mut self, kernel: bool, writable: bool) {
        let kept = self
            .flags()
            .difference(PageFlags::PRESENT.union(PageFlags::WRITABLE).union(PageFlags::USER));
        self.set_flags(kept.union(PageFlags::for_mapping(kernel, writable)));
    }
}

/// A page-aligned table of page entries.
#[repr(C, align(4096))]
#[derive(Debug)]
pub struct PageTable {
    pub pages: [Pte; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Allocates a zeroed table on the kernel heap.
    pub fn new_boxed() -> Box<Self> {
        Box::new(Self {
            pages: [Pte::EMPTY; ENTRIES_PER_TABLE],
        })
    }

    fn new_shared() -> SharedTable {
        Arc::new(Mutex::new(Self {
            pages: [Pte::EMPTY; ENTRIES_PER_TABLE],
        }))
    }

    fn address(&self) -> *const u8 {
        self as *const Self as *const u8
    }
}

/// A kernel-range table shared by every directory.
pub type SharedTable = Arc<Mutex<PageTable>>;

/// A directory slot's table.
#[derive(Debug)]
pub enum TableRef {
    /// Borrowed from the kernel directory; never freed by a process.
    Kernel(SharedTable),
    /// Exclusively owned by this directory.
    User(Box<PageTable>),
}

/// A mutable handle to a single page entry.
pub enum PteRef<'a> {
    Owned(&'a mut Pte),
    Shared(MutexGuard<'a, PageTable>, usize),
}

impl Deref for PteRef<'_> {
    type Target = Pte;

    fn deref(&self) -> &Pte {
        match self {
            PteRef::Owned(pte) => pte,
            PteRef::Shared(table, index) => &table.pages[*index],
        }
    }
}

impl DerefMut for PteRef<'_> {
    fn deref_mut(&mut self) -> &mut Pte {
        match self {
            PteRef::Owned(pte) => pte,
            PteRef::Shared(table, index) => &mut table.pages[*index],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectoryKind {
    Kernel,
    User,
}

#[repr(C, align(4096))]
#[derive(Debug)]
struct HardwareDirectory {
    entries: [u32; ENTRIES_PER_TABLE],
}

/// Page directory: table slots plus the hardware-visible physical slot array.
#[derive(Debug)]
pub struct PageDirectory {
    kind: DirectoryKind,
    tables: Vec<Option<TableRef>>,
    hardware: Box<HardwareDirectory>,
    physical_address: PhysAddr,
}

/// Splits a virtual address into (table index, page index).
pub const fn split_address(addr: VirtAddr) -> (usize, usize) {
    let page = (addr / FRAME_SIZE) as usize;
    (page / ENTRIES_PER_TABLE, page % ENTRIES_PER_TABLE)
}

impl PageDirectory {
    /// Creates the kernel directory; every table it creates is shared.
    pub fn new_kernel<M: PhysMemory>(memory: &M) -> Self {
        Self::empty(DirectoryKind::Kernel, memory)
    }

    /// Creates an empty process directory.
    pub fn new_user<M: PhysMemory>(memory: &M) -> Self {
        Self::empty(DirectoryKind::User, memory)
    }

    fn empty<M: PhysMemory>(kind: DirectoryKind, memory: &M) -> Self {
        let mut tables = Vec::with_capacity(ENTRIES_PER_TABLE);
        tables.resize_with(ENTRIES_PER_TABLE, || None);
        let hardware = Box::new(HardwareDirectory {
            entries: [0; ENTRIES_PER_TABLE],
        });
        let physical_address =
            memory.virt_to_phys(&*hardware as *const HardwareDirectory as *const u8);
        Self {
            kind,
            tables,
            hardware,
            physical_address,
        }
    }

    /// Physical address loaded into the MMU when this directory is activated.
    pub fn physical_address(&self) -> PhysAddr {
        self.physical_address
    }

    /// Hardware slot value (table physical address plus flags) at `index`.
    pub fn physical_slot(&self, index: usize) -> u32 {
        self.hardware.entries[index]
    }

    /// Returns the table at `index`, if any.
    pub fn table(&self, index: usize) -> Option<&TableRef> {
        self.tables.get(index).and_then(Option::as_ref)
    }

    /// Returns true if slot `index` aliases a kernel table.
    pub fn is_kernel_slot(&self, index: usize) -> bool {
        matches!(self.table(index), Some(TableRef::Kernel(_)))
    }

    /// Two-level lookup of the entry mapping `addr`.
    ///
    /// With `make`, a missing table is allocated zeroed; otherwise a missing
    /// table yields `None`.
    pub fn lookup<M: PhysMemory>(
        &mut self,
        addr: VirtAddr,
        make: bool,
        memory: &M,
    ) -> Option<PteRef<'_>> {
        if addr >= ADDRESS_SPACE_END {
            return None;
        }
        let (table_index, page_index) = split_address(addr);
        if self.tables[table_index].is_none() {
            if !make {
                return None;
            }
            let (table, phys) = match self.kind {
                DirectoryKind::Kernel => {
                    let shared = PageTable::new_shared();
                    let phys = memory.virt_to_phys(shared.lock().address());
                    (TableRef::Kernel(shared), phys)
                }
                DirectoryKind::User => {
                    let owned = PageTable::new_boxed();
                    let phys = memory.virt_to_phys(owned.address());
                    (TableRef::User(owned), phys)
                }
            };
            self.install(table_index, table, phys);
        }
        match self.tables[table_index].as_mut() {
            Some(TableRef::Kernel(shared)) => Some(PteRef::Shared(shared.lock(), page_index)),
            Some(TableRef::User(owned)) => Some(PteRef::Owned(&mut owned.pages[page_index])),
            None => None,
        }
    }

    /// Reads the entry mapping `addr` without allocating.
    pub fn entry(&self, addr: VirtAddr) -> Option<Pte> {
        if addr >= ADDRESS_SPACE_END {
            return None;
        }
        let (table_index, page_index) = split_address(addr);
        match self.tables[table_index].as_ref()? {
            TableRef::Kernel(shared) => Some(shared.lock().pages[page_index]),
            TableRef::User(owned) => Some(owned.pages[page_index]),
        }
    }

    /// Translates a virtual address through a present mapping.
    pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
        let pte = self.entry(addr)?;
        if !pte.is_present() || !pte.has_frame() {
            return None;
        }
        Some(pte.phys_addr() + addr % FRAME_SIZE)
    }

    /// Backs the page containing `addr` with a frame; freshly taken frames are zeroed.
    pub fn map_page<M: PhysMemory>(
        &mut self,
        addr: VirtAddr,
        kernel: bool,
        writable: bool,
        frames: &FrameAllocator,
        memory: &mut M,
    ) -> Result<(), Errno> {
        let fresh = {
            let mut pte = self.lookup(addr, true, memory).ok_or(Errno::InvalidArg)?;
            let fresh = !pte.has_frame();
            frames.allocate_for_entry(&mut pte, kernel, writable);
            fresh.then(|| pte.phys_addr())
        };
        if let Some(phys) = fresh {
            memory.zero_frame(phys);
        }
        Ok(())
    }

    /// Maps the page containing `addr` to a fixed physical address.
    pub fn map_fixed<M: PhysMemory>(
        &mut self,
        addr: VirtAddr,
        phys: PhysAddr,
        kernel: bool,
        writable: bool,
        frames: &FrameAllocator,
        memory: &M,
    ) -> Result<(), Errno> {
        let mut pte = self.lookup(addr, true, memory).ok_or(Errno::InvalidArg)?;
        frames.map_fixed_physical(&mut pte, kernel, writable, phys);
        Ok(())
    }

    /// Releases the frame behind the page containing `addr`, if any.
    pub fn unmap_page<M: PhysMemory>(
        &mut self,
        addr: VirtAddr,
        frames: &FrameAllocator,
        memory: &M,
    ) {
        if let Some(mut pte) = self.lookup(addr, false, memory) {
            if pte.has_frame() {
                frames.release(&mut pte);
            }
        }
    }

    /// Builds a new process directory from `src`.
    ///
    /// Kernel slots are aliased. User tables below `shm_start` are deep
    /// copied: every bound page gets a fresh frame carrying the same
    /// permission bits and a byte-for-byte copy of the source frame.
    pub fn clone_from<M: PhysMemory>(
        src: &PageDirectory,
        frames: &FrameAllocator,
        memory: &mut M,
        shm_start: VirtAddr,
    ) -> PageDirectory {
        let mut dir = PageDirectory::new_user(memory);
        for index in 0..ENTRIES_PER_TABLE {
            match src.tables[index].as_ref() {
                None => continue,
                Some(TableRef::Kernel(shared)) => {
                    dir.tables[index] = Some(TableRef::Kernel(Arc::clone(shared)));
                    dir.hardware.entries[index] = src.hardware.entries[index];
                }
                Some(TableRef::User(owned)) => {
                    if (index as u64) * TABLE_SPAN >= shm_start {
                        continue;
                    }
                    let table = clone_table(owned, frames, memory);
                    let phys = memory.virt_to_phys(table.address());
                    dir.install(index, TableRef::User(table), phys);
                }
            }
        }
        dir
    }

    /// Frees every user table: bound frames below `shm_start` go back to the
    /// allocator, then the table structures are dropped. Kernel slots stay.
    pub fn release_user_tables(&mut self, frames: &FrameAllocator, shm_start: VirtAddr) {
        for index in 0..ENTRIES_PER_TABLE {
            if !matches!(self.tables[index], Some(TableRef::User(_))) {
                continue;
            }
            if let Some(TableRef::User(mut table)) = self.tables[index].take() {
                if (index as u64) * TABLE_SPAN < shm_start {
                    for pte in table.pages.iter_mut().filter(|pte| pte.has_frame()) {
                        frames.release(pte);
                    }
                }
            }
            self.hardware.entries[index] = 0;
        }
    }

    /// Number of bound pages held in user tables.
    pub fn user_page_count(&self) -> usize {
        self.tables
            .iter()
            .filter_map(|slot| match slot {
                Some(TableRef::User(table)) => {
                    Some(table.pages.iter().filter(|pte| pte.has_frame()).count())
                }
                _ => None,
            })
            .sum()
    }

    /// Copies `data` into virtual memory starting at `addr`.
    pub fn write_bytes<M: PhysMemory>(
        &self,
        memory: &mut M,
        addr: VirtAddr,
        data: &[u8],
    ) -> Result<(), Errno> {
        let mut done = 0usize;
        while done < data.len() {
            let va = addr + done as u64;
            let phys = self.translate(va).ok_or(Errno::InvalidArg)?;
            let chunk = page_chunk(va, data.len() - done);
            memory.write(phys, &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copies virtual memory starting at `addr` into `buf`.
    pub fn read_bytes<M: PhysMemory>(
        &self,
        memory: &M,
        addr: VirtAddr,
        buf: &mut [u8],
    ) -> Result<(), Errno> {
        let mut done = 0usize;
        while done < buf.len() {
            let va = addr + done as u64;
            let phys = self.translate(va).ok_or(Errno::InvalidArg)?;
            let chunk = page_chunk(va, buf.len() - done);
            memory.read(phys, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Zero-fills `len` bytes of virtual memory starting at `addr`.
    pub fn zero_bytes<M: PhysMemory>(
        &self,
        memory: &mut M,
        addr: VirtAddr,
        len: u64,
    ) -> Result<(), Errno> {
        let zeroes = [0u8; FRAME_SIZE as usize];
        let mut done = 0u64;
        while done < len {
            let va = addr + done;
            let phys = self.translate(va).ok_or(Errno::InvalidArg)?;
            let chunk = page_chunk(va, (len - done) as usize);
            memory.write(phys, &zeroes[..chunk]);
            done += chunk as u64;
        }
        Ok(())
    }

    fn install(&mut self, index: usize, table: TableRef, phys: PhysAddr) {
        self.tables[index] = Some(table);
        self.hardware.entries[index] = (phys as u32 & !0xFFF) | TABLE_SLOT_FLAGS;
    }
}

fn clone_table<M: PhysMemory>(
    src: &PageTable,
    frames: &FrameAllocator,
    memory: &mut M,
) -> Box<PageTable> {
    let mut table = PageTable::new_boxed();
    for (index, source) in src.pages.iter().enumerate() {
        if !source.has_frame() {
            continue;
        }
        let pte = &mut table.pages[index];
        frames.allocate_for_entry(pte, false, false);
        pte.set_flags(source.flags());
        memory.copy_frame(source.phys_addr(), pte.phys_addr());
    }
    table
}

fn page_chunk(va: VirtAddr, remaining: usize) -> usize {
    let room = (FRAME_SIZE - va % FRAME_SIZE) as usize;
    room.min(remaining)
}
