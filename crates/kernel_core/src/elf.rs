use alloc::string::String;
use alloc::vec::Vec;

use hal::{Errno, Interrupts, PhysMemory, VirtAddr, PAGE_SIZE};

use crate::config::ADDRESS_SPACE_END;
use crate::kernel::Kernel;
use crate::pmm::align_up;
use crate::process::{Image, Pid, UserEntry};
use crate::task::USER_WORD;
use crate::vfs::{read_all, FileHandle};
use crate::vmm::{SpaceId, Vmm};

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_LITTLE: u8 = 1;
const ELF_TYPE_EXEC: u16 = 2;
const ELF_HEADER_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

pub const AT_NULL: u64 = 0;
pub const AT_UID: u64 = 11;
pub const AT_EUID: u64 = 12;

/// Descriptors every process starts with (stdin, stdout, stderr).
const STANDARD_FILES: usize = 3;

/// Represents a loadable ELF segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSegment {
    pub vaddr: u64,
    pub mem_size: u64,
    pub file_size: u64,
    pub offset: u64,
    pub flags: u32,
}

impl LoadSegment {
    pub fn end(&self) -> Option<u64> {
        self.vaddr.checked_add(self.mem_size)
    }
}

/// Parsed ELF image metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedElf {
    pub entry: u64,
    pub segments: Vec<LoadSegment>,
    /// The image carries a dynamic segment and needs the runtime linker.
    pub dynamic: bool,
}

impl LoadedElf {
    /// Tightest `[start, end)` covering every loadable segment.
    pub fn bounds(&self) -> Option<(u64, u64)> {
        let start = self.segments.iter().map(|segment| segment.vaddr).min()?;
        let end = self.segments.iter().filter_map(LoadSegment::end).max()?;
        Some((start, end))
    }
}

/// Trait for mapping and populating ELF segments.
pub trait ElfLoader {
    fn map(&mut self, vaddr: u64, mem_size: u64) -> Result<(), Errno>;
    fn copy(&mut self, vaddr: u64, data: &[u8]) -> Result<(), Errno>;
    fn zero(&mut self, vaddr: u64, size: u64) -> Result<(), Errno>;
}

fn read_u16(image: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([image[at], image[at + 1]])
}

fn read_u32(image: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&image[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(image: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&image[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Parses an ELF64 little-endian executable.
pub fn parse_elf(image: &[u8]) -> Result<LoadedElf, Errno> {
    if image.len() < ELF_HEADER_SIZE {
        return Err(Errno::InvalidArg);
    }
    if image[..4] != ELF_MAGIC {
        return Err(Errno::InvalidArg);
    }
    if image[4] != ELF_CLASS_64 || image[5] != ELF_DATA_LITTLE {
        return Err(Errno::InvalidArg);
    }
    if read_u16(image, 16) != ELF_TYPE_EXEC {
        return Err(Errno::InvalidArg);
    }
    let entry = read_u64(image, 24);
    let phoff = read_u64(image, 32) as usize;
    let phentsize = read_u16(image, 54) as usize;
    let phnum = read_u16(image, 56) as usize;

    let table_end = phoff
        .checked_add(phentsize.saturating_mul(phnum))
        .ok_or(Errno::InvalidArg)?;
    if table_end > image.len() || phentsize < PHDR_SIZE {
        return Err(Errno::InvalidArg);
    }

    let mut segments = Vec::new();
    let mut dynamic = false;
    for index in 0..phnum {
        let base = phoff + index * phentsize;
        match read_u32(image, base) {
            PT_DYNAMIC => dynamic = true,
            PT_LOAD => {
                let segment = LoadSegment {
                    flags: read_u32(image, base + 4),
                    offset: read_u64(image, base + 8),
                    vaddr: read_u64(image, base + 16),
                    file_size: read_u64(image, base + 32),
                    mem_size: read_u64(image, base + 40),
                };
                let data_end = segment
                    .offset
                    .checked_add(segment.file_size)
                    .ok_or(Errno::InvalidArg)?;
                if data_end > image.len() as u64 || segment.mem_size < segment.file_size {
                    return Err(Errno::InvalidArg);
                }
                segments.push(segment);
            }
            _ => {}
        }
    }

    Ok(LoadedElf {
        entry,
        segments,
        dynamic,
    })
}

/// Checks that every loadable segment fits the user part of the layout.
pub fn validate_segments(elf: &LoadedElf, user_image_min: VirtAddr) -> Result<(), Errno> {
    if elf.segments.is_empty() {
        return Err(Errno::InvalidArg);
    }
    for segment in &elf.segments {
        let end = segment.end().ok_or(Errno::InvalidArg)?;
        if segment.vaddr < user_image_min || end > ADDRESS_SPACE_END {
            log::warn!(
                "elf: rejecting segment {:#x}..{:#x} outside user range",
                segment.vaddr,
                end
            );
            return Err(Errno::InvalidArg);
        }
    }
    Ok(())
}

/// Applies loadable segments to the given loader implementation.
pub fn load_elf<L: ElfLoader>(image: &[u8], elf: &LoadedElf, loader: &mut L) -> Result<(), Errno> {
    for segment in &elf.segments {
        loader.map(segment.vaddr, segment.mem_size)?;
        let file_end = segment
            .offset
            .checked_add(segment.file_size)
            .ok_or(Errno::InvalidArg)? as usize;
        let file_start = segment.offset as usize;
        let data = image.get(file_start..file_end).ok_or(Errno::InvalidArg)?;
        loader.copy(segment.vaddr, data)?;
        if segment.mem_size > segment.file_size {
            let zero_start = segment.vaddr + segment.file_size;
            let zero_size = segment.mem_size - segment.file_size;
            loader.zero(zero_start, zero_size)?;
        }
    }
    Ok(())
}

/// Loads segments into one address space with user-writable pages.
pub struct SpaceLoader<'a, M: PhysMemory> {
    pub vm: &'a mut Vmm<M>,
    pub space: SpaceId,
}

impl<M: PhysMemory> ElfLoader for SpaceLoader<'_, M> {
    fn map(&mut self, vaddr: u64, mem_size: u64) -> Result<(), Errno> {
        self.vm.map_range(self.space, vaddr, vaddr + mem_size, false, true)
    }

    fn copy(&mut self, vaddr: u64, data: &[u8]) -> Result<(), Errno> {
        self.vm.write_bytes(self.space, vaddr, data)
    }

    fn zero(&mut self, vaddr: u64, size: u64) -> Result<(), Errno> {
        self.vm.zero_bytes(self.space, vaddr, size)
    }
}

/// Bump allocator over a freshly mapped user heap.
struct HeapWriter<'a, M: PhysMemory> {
    vm: &'a mut Vmm<M>,
    space: SpaceId,
    next: VirtAddr,
}

impl<M: PhysMemory> HeapWriter<'_, M> {
    fn put(&mut self, bytes: &[u8]) -> Result<VirtAddr, Errno> {
        let at = self.next;
        let end = at.checked_add(bytes.len() as u64).ok_or(Errno::NoMem)?;
        self.vm.map_range(self.space, at, end, false, true)?;
        self.vm.write_bytes(self.space, at, bytes)?;
        self.next = end;
        Ok(at)
    }

    fn put_words(&mut self, words: &[u64]) -> Result<VirtAddr, Errno> {
        let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
        self.put(&bytes)
    }

    fn put_str(&mut self, value: &str) -> Result<VirtAddr, Errno> {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.put(&bytes)
    }
}

/// Size in bytes of a NUL-terminated pointer array for `count` entries.
fn array_bytes(count: usize) -> u64 {
    (count as u64 + 1) * USER_WORD
}

impl<M: PhysMemory, I: Interrupts> Kernel<M, I> {
    /// Loads an already opened ELF executable into `pid`.
    ///
    /// `setuid` carries the owner of a set-user-ID image through the runtime
    /// linker hop. The effective user only changes once the old image is gone.
    pub(crate) fn exec_elf(
        &mut self,
        pid: Pid,
        path: &str,
        file: FileHandle,
        argv: &[&str],
        envp: &[&str],
        depth: u32,
        setuid: Option<u32>,
    ) -> Result<UserEntry, Errno> {
        let loaded = match self.vfs.metadata(file) {
            Ok(meta) => read_all(&mut *self.vfs, file).map(|data| (meta, data)),
            Err(err) => Err(err),
        };
        self.vfs.close(file);
        let (meta, data) = loaded?;
        let elf = parse_elf(&data)?;
        let setuid = if meta.is_setuid() { Some(meta.uid) } else { setuid };

        if elf.dynamic {
            return self.exec_dynamic(pid, path, argv, envp, depth, setuid);
        }
        validate_segments(&elf, self.config.user_image_min)?;
        let (start, end) = elf.bounds().ok_or(Errno::InvalidArg)?;

        let space = self.fresh_image_space(pid)?;
        if let Some(uid) = setuid {
            let process = self.procs.get_mut(&pid).ok_or(Errno::NotFound)?;
            process.user = uid;
        }
        load_elf(
            &data,
            &elf,
            &mut SpaceLoader {
                vm: &mut self.vm,
                space,
            },
        )?;

        let stack_top = self.config.user_stack_top;
        self.vm
            .map_range(space, self.config.user_stack_bottom(), stack_top, false, true)?;

        let process = self.procs.get(&pid).ok_or(Errno::NotFound)?;
        let (uid, euid) = (process.real_user as u64, process.user as u64);
        let mut heap = HeapWriter {
            vm: &mut self.vm,
            space,
            next: align_up(end, USER_WORD),
        };
        let argv_at = heap.next;
        let envp_at = argv_at + array_bytes(argv.len());
        let auxv_at = envp_at + array_bytes(envp.len());
        heap.next = auxv_at + 6 * USER_WORD;
        let mut argv_ptrs = Vec::with_capacity(argv.len() + 1);
        for arg in argv {
            argv_ptrs.push(heap.put_str(arg)?);
        }
        argv_ptrs.push(0);
        let mut envp_ptrs = Vec::with_capacity(envp.len() + 1);
        for var in envp {
            envp_ptrs.push(heap.put_str(var)?);
        }
        envp_ptrs.push(0);
        let heap_end = heap.next;

        heap.next = argv_at;
        heap.put_words(&argv_ptrs)?;
        heap.put_words(&envp_ptrs)?;
        heap.put_words(&[AT_UID, uid, AT_EUID, euid, AT_NULL, 0])?;

        let sp = stack_top - 2 * USER_WORD;
        self.vm.write_bytes(space, sp + USER_WORD, &argv_at.to_le_bytes())?;
        self.vm.write_bytes(space, sp, &(argv.len() as u64).to_le_bytes())?;

        let process = self.procs.get_mut(&pid).ok_or(Errno::NotFound)?;
        process.image = Image {
            entry: elf.entry,
            start,
            size: end - start,
            heap: heap_end,
            heap_actual: align_up(heap_end, PAGE_SIZE),
            user_stack: stack_top,
        };
        process.files.lock().pad_to(STANDARD_FILES);
        log::debug!(
            "elf: pid {} loaded {} at {:#x}..{:#x}, entry {:#x}",
            pid,
            path,
            start,
            end,
            elf.entry
        );
        Ok(UserEntry {
            entry: elf.entry,
            argc: argv.len(),
            argv: argv_at,
            envp: envp_at,
            stack: sp,
        })
    }

    /// Hands a dynamically linked image to the runtime linker:
    /// `ld.so -e <path> argv...`.
    fn exec_dynamic(
        &mut self,
        pid: Pid,
        path: &str,
        argv: &[&str],
        envp: &[&str],
        depth: u32,
        setuid: Option<u32>,
    ) -> Result<UserEntry, Errno> {
        if depth >= self.config.max_interp_depth {
            return Err(Errno::Loop);
        }
        let linker = self.config.dynamic_linker.clone();
        let file = self.vfs.open(&linker).map_err(|_| Errno::InvalidArg)?;
        let program = String::from(path);
        let mut args: Vec<&str> = Vec::with_capacity(argv.len() + 3);
        args.extend_from_slice(&["ld.so", "-e", program.as_str()]);
        args.extend_from_slice(argv);
        log::debug!("elf: {} is dynamic, running {}", path, linker);
        self.exec_elf(pid, &linker, file, &args, envp, depth + 1, setuid)
    }

    /// Drops the user part of `pid`'s address space before a new image is loaded.
    ///
    /// A space shared with other threads (or the kernel space) is left to its
    /// other users and replaced by a fresh clone of the kernel directory.
    fn fresh_image_space(&mut self, pid: Pid) -> Result<SpaceId, Errno> {
        let process = self.procs.get(&pid).ok_or(Errno::NotFound)?;
        let old = process.space;
        if old != SpaceId::KERNEL && self.vm.refs(old) == 1 {
            self.vm.release_in_place(old)?;
            return Ok(old);
        }
        let space = self.vm.clone_space(SpaceId::KERNEL)?;
        self.vm.release(old)?;
        if let Some(process) = self.procs.get_mut(&pid) {
            process.space = space;
        }
        Ok(space)
    }
}
