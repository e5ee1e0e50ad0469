use alloc::vec;
use alloc::vec::Vec;

use hal::{PageFlags, PhysAddr};
use spin::Mutex;

use crate::boot::{MemoryKind, MemoryRegion};
use crate::config::ADDRESS_SPACE_END;
use crate::paging::Pte;

/// Size of a physical frame in bytes.
pub const FRAME_SIZE: u64 = hal::PAGE_SIZE;

const BITS_PER_WORD: usize = 32;

/// Hook invoked once, with a list of message lines, right before the system halts
/// on frame exhaustion.
pub type DiagnosticHook = fn(&[&str]);

#[derive(Debug)]
struct Bitmap {
    words: Vec<u32>,
    frames: usize,
}

impl Bitmap {
    fn new(frames: usize) -> Self {
        Self {
            words: vec![0; frames.div_ceil(BITS_PER_WORD)],
            frames,
        }
    }

    fn set(&mut self, frame: usize) {
        if frame < self.frames {
            self.words[frame / BITS_PER_WORD] |= 1 << (frame % BITS_PER_WORD);
        }
    }

    fn clear(&mut self, frame: usize) {
        if frame < self.frames {
            self.words[frame / BITS_PER_WORD] &= !(1 << (frame % BITS_PER_WORD));
        }
    }

    fn test(&self, frame: usize) -> bool {
        if frame >= self.frames {
            return true;
        }
        self.words[frame / BITS_PER_WORD] & (1 << (frame % BITS_PER_WORD)) != 0
    }

    fn first_free(&self) -> Option<usize> {
        for (index, word) in self.words.iter().enumerate() {
            if *word == u32::MAX {
                continue;
            }
            for bit in 0..BITS_PER_WORD {
                let frame = index * BITS_PER_WORD + bit;
                if frame >= self.frames {
                    return None;
                }
                if word & (1 << bit) == 0 {
                    return Some(frame);
                }
            }
        }
        None
    }

    fn first_run(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let mut start = 0;
        let mut len = 0;
        for frame in 0..self.frames {
            if self.test(frame) {
                start = frame + 1;
                len = 0;
                continue;
            }
            len += 1;
            if len == count {
                return Some(start);
            }
        }
        None
    }

    fn used(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}

/// Bitmap tracker of physical page frames.
///
/// Frame 0 is always marked used: a page entry whose frame field is 0 is
/// treated as unbound.
#[derive(Debug)]
pub struct FrameAllocator {
    bitmap: Mutex<Bitmap>,
    diagnostic: Mutex<Option<DiagnosticHook>>,
}

impl FrameAllocator {
    /// Creates an allocator tracking `memory_bytes` of physical memory, all free.
    pub fn new(memory_bytes: u64) -> Self {
        let mut bitmap = Bitmap::new((memory_bytes / FRAME_SIZE) as usize);
        bitmap.set(0);
        Self {
            bitmap: Mutex::new(bitmap),
            diagnostic: Mutex::new(None),
        }
    }

    /// Creates an allocator from a boot memory map; only usable regions start free.
    ///
    /// Memory above 4 GiB is ignored since a page entry cannot name it.
    pub fn from_memory_map(regions: &[MemoryRegion]) -> Self {
        let top = regions
            .iter()
            .map(|region| region.end)
            .max()
            .unwrap_or(0)
            .min(ADDRESS_SPACE_END);
        let mut bitmap = Bitmap::new((top / FRAME_SIZE) as usize);
        for frame in 0..bitmap.frames {
            bitmap.set(frame);
        }
        for region in regions.iter().filter(|region| region.kind == MemoryKind::Usable) {
            let mut addr = align_up(region.start, FRAME_SIZE);
            let end = align_down(region.end.min(top), FRAME_SIZE);
            while addr + FRAME_SIZE <= end {
                bitmap.clear((addr / FRAME_SIZE) as usize);
                addr += FRAME_SIZE;
            }
        }
        bitmap.set(0);
        Self {
            bitmap: Mutex::new(bitmap),
            diagnostic: Mutex::new(None),
        }
    }

    /// Installs the hook run before halting on frame exhaustion.
    pub fn set_diagnostic_hook(&self, hook: DiagnosticHook) {
        *self.diagnostic.lock() = Some(hook);
    }

    /// Marks the frame containing `addr` as used.
    pub fn mark(&self, addr: PhysAddr) {
        self.bitmap.lock().set(frame_of(addr));
    }

    /// Marks every frame overlapping `[start, end)` as used.
    pub fn mark_range(&self, start: PhysAddr, end: PhysAddr) {
        let mut bitmap = self.bitmap.lock();
        let mut addr = align_down(start, FRAME_SIZE);
        while addr < end {
            bitmap.set(frame_of(addr));
            addr += FRAME_SIZE;
        }
    }

    /// Marks the frame containing `addr` as free.
    pub fn clear(&self, addr: PhysAddr) {
        self.bitmap.lock().clear(frame_of(addr));
    }

    /// Returns true if the frame containing `addr` is used.
    pub fn test(&self, addr: PhysAddr) -> bool {
        self.bitmap.lock().test(frame_of(addr))
    }

    /// Returns the index of the lowest free frame.
    ///
    /// Halts the system when no frame is left.
    pub fn find_first_free(&self) -> u32 {
        let found = self.bitmap.lock().first_free();
        match found {
            Some(frame) => frame as u32,
            None => self.out_of_frames(),
        }
    }

    /// Returns the first frame of the lowest run of `count` free frames.
    pub fn find_first_n_contiguous(&self, count: usize) -> Option<u32> {
        self.bitmap.lock().first_run(count).map(|frame| frame as u32)
    }

    /// Reserves a run of `count` contiguous frames and returns its physical base.
    pub fn allocate_contiguous(&self, count: usize) -> Option<PhysAddr> {
        let mut bitmap = self.bitmap.lock();
        let start = bitmap.first_run(count)?;
        for frame in start..start + count {
            bitmap.set(frame);
        }
        Some(start as u64 * FRAME_SIZE)
    }

    /// Backs `pte` with a frame, or only refreshes its permissions if it already has one.
    pub fn allocate_for_entry(&self, pte: &mut Pte, kernel: bool, writable: bool) {
        if !pte.has_frame() {
            let mut bitmap = self.bitmap.lock();
            let frame = match bitmap.first_free() {
                Some(frame) => frame,
                None => {
                    drop(bitmap);
                    self.out_of_frames();
                }
            };
            bitmap.set(frame);
            pte.set_frame(frame as u32);
        }
        pte.set_permissions(kernel, writable);
    }

    /// Points `pte` at a caller-chosen physical address without consulting the free search.
    pub fn map_fixed_physical(&self, pte: &mut Pte, kernel: bool, writable: bool, phys: PhysAddr) {
        pte.set_frame(frame_of(phys) as u32);
        pte.set_permissions(kernel, writable);
        self.mark(phys);
    }

    /// Returns the frame bound to `pte` to the free pool and unbinds it.
    pub fn release(&self, pte: &mut Pte) {
        assert!(pte.has_frame(), "released an unbound page entry");
        self.bitmap.lock().clear(pte.frame() as usize);
        pte.set_frame(0);
        pte.set_flags(pte.flags().difference(PageFlags::PRESENT));
    }

    /// Number of frames currently marked used.
    pub fn used_frames(&self) -> usize {
        self.bitmap.lock().used()
    }

    /// Number of frames tracked.
    pub fn total_frames(&self) -> usize {
        self.bitmap.lock().frames
    }

    /// Used memory in KiB.
    pub fn memory_use_kib(&self) -> u64 {
        self.used_frames() as u64 * (FRAME_SIZE / 1024)
    }

    /// Tracked memory in KiB.
    pub fn memory_total_kib(&self) -> u64 {
        self.total_frames() as u64 * (FRAME_SIZE / 1024)
    }

    /// Copy of the raw bitmap words.
    pub fn snapshot(&self) -> Vec<u32> {
        self.bitmap.lock().words.clone()
    }

    fn out_of_frames(&self) -> ! {
        log::error!("out of usable physical frames; halting");
        if let Some(hook) = self.diagnostic.lock().take() {
            hook(&["Out of memory."]);
        }
        panic!("out of physical frames");
    }
}

fn frame_of(addr: PhysAddr) -> usize {
    (addr / FRAME_SIZE) as usize
}

pub(crate) const fn align_up(value: u64, align: u64) -> u64 {
    if value % align == 0 {
        value
    } else {
        value + (align - (value % align))
    }
}

pub(crate) const fn align_down(value: u64, align: u64) -> u64 {
    value - (value % align)
}
