use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use hal::{Errno, VirtAddr};
use spin::Mutex;

use crate::vfs::{FileHandle, Vfs};
use crate::vmm::SpaceId;

/// Process identifier.
pub type Pid = u32;

/// Process execution states in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    NotStarted,
    Running,
    Ready,
    Finished,
}

/// Saved kernel execution context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub ip: usize,
    pub sp: usize,
    pub bp: usize,
}

/// Register snapshot taken when the process last entered the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub ip: usize,
    pub sp: usize,
    pub bp: usize,
    /// System-call return register.
    pub ret: usize,
    pub flags: usize,
}

/// Register and stack layout handed to the user entry point after exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserEntry {
    pub entry: VirtAddr,
    pub argc: usize,
    pub argv: VirtAddr,
    pub envp: VirtAddr,
    pub stack: VirtAddr,
}

/// What a record does the first time it is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    /// Return to user mode through the saved trap frame (fork/clone children).
    ReturnToUser,
    /// Call a kernel function with one argument on the kernel address space.
    KernelWorker { entry: usize, arg: usize },
    /// Jump to a freshly loaded user image.
    EnterUser(UserEntry),
}

/// Bounds of the loaded user image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Image {
    pub entry: VirtAddr,
    pub start: VirtAddr,
    pub size: u64,
    /// Heap start as reported to user code.
    pub heap: VirtAddr,
    /// First byte past the mapped heap.
    pub heap_actual: VirtAddr,
    pub user_stack: VirtAddr,
}

/// A process's kernel stack.
#[derive(Debug, Clone)]
pub struct KernelStack {
    bytes: Box<[u8]>,
}

impl KernelStack {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn empty() -> Self {
        Self { bytes: Box::new([]) }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Address one past the highest byte.
    pub fn top(&self) -> usize {
        self.bytes.as_ptr() as usize + self.bytes.len()
    }

    /// Copies as many bytes as both stacks hold.
    pub fn copy_from(&mut self, other: &KernelStack) {
        let len = self.bytes.len().min(other.bytes.len());
        let offset = self.bytes.len() - len;
        let source = other.bytes.len() - len;
        self.bytes[offset..].copy_from_slice(&other.bytes[source..]);
    }
}

/// Open-file slots of a process.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileTable {
    pub entries: Vec<Option<FileHandle>>,
}

impl FileTable {
    /// Duplicates every open handle through the filesystem.
    pub fn duplicate(&self, vfs: &mut dyn Vfs) -> Result<Self, Errno> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            entries.push(match entry {
                Some(handle) => Some(vfs.dup(*handle)?),
                None => None,
            });
        }
        Ok(Self { entries })
    }

    /// Closes every open handle.
    pub fn close_all(&mut self, vfs: &mut dyn Vfs) {
        for handle in self.entries.drain(..).flatten() {
            vfs.close(handle);
        }
    }

    pub fn open_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    /// Grows the table with empty slots up to `len` entries.
    pub fn pad_to(&mut self, len: usize) {
        if self.entries.len() < len {
            self.entries.resize(len, None);
        }
    }
}

/// File table shared between threads created by clone.
pub type SharedFiles = Arc<Mutex<FileTable>>;

/// State restored by return-from-signal.
#[derive(Debug, Clone)]
pub struct SignalFrame {
    pub context: Context,
    pub trap: TrapFrame,
    pub kernel_stack: Box<[u8]>,
}

/// Queued and blocked signals.
#[derive(Debug, Clone, Default)]
pub struct SignalState {
    pub pending: VecDeque<u32>,
    pub blocked: u64,
    pub frame: Option<SignalFrame>,
}

/// Process control block.
#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub name: String,
    pub cmdline: Vec<String>,
    pub user: u32,
    pub real_user: u32,
    pub group: u32,
    pub state: ProcState,
    pub context: Context,
    pub trap: TrapFrame,
    pub start: Start,
    pub image: Image,
    pub kstack: KernelStack,
    pub files: SharedFiles,
    pub signals: SignalState,
    /// Processes sleeping until this one changes state.
    pub wait_queue: VecDeque<Pid>,
    pub status: i32,
    pub space: SpaceId,
    /// Set when the record is switched back in; consumed by `finish_resume`.
    pub just_resumed: bool,
}

impl Process {
    /// Creates a record that has not run yet.
    pub fn new(pid: Pid, name: &str, space: SpaceId, kernel_stack_size: usize) -> Self {
        Self {
            pid,
            parent: None,
            children: Vec::new(),
            name: String::from(name),
            cmdline: Vec::new(),
            user: 0,
            real_user: 0,
            group: 0,
            state: ProcState::NotStarted,
            context: Context::default(),
            trap: TrapFrame::default(),
            start: Start::ReturnToUser,
            image: Image::default(),
            kstack: KernelStack::new(kernel_stack_size),
            files: Arc::new(Mutex::new(FileTable::default())),
            signals: SignalState::default(),
            wait_queue: VecDeque::new(),
            status: 0,
            space,
            just_resumed: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.state != ProcState::NotStarted
    }

    pub fn is_finished(&self) -> bool {
        self.state == ProcState::Finished
    }

    /// Snapshot of the kernel stack, context and trap frame.
    pub fn capture_signal_frame(&self) -> SignalFrame {
        SignalFrame {
            context: self.context,
            trap: self.trap,
            kernel_stack: self.kstack.bytes().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryVfs;

    #[test]
    fn process_starts_not_started_with_empty_files() {
        let process = Process::new(3, "init", SpaceId::KERNEL, 0x2000);
        assert_eq!(process.pid, 3);
        assert_eq!(process.state, ProcState::NotStarted);
        assert!(!process.is_started());
        assert_eq!(process.files.lock().open_count(), 0);
        assert_eq!(process.kstack.bytes().len(), 0x2000);
        assert!(process.signals.frame.is_none());
    }

    #[test]
    fn kernel_stack_copy_keeps_top_aligned() {
        let mut source = KernelStack::new(8);
        source.bytes_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut copy = KernelStack::new(4);
        copy.copy_from(&source);
        assert_eq!(copy.bytes(), &[5, 6, 7, 8]);
        assert_eq!(KernelStack::empty().bytes().len(), 0);
    }

    #[test]
    fn file_table_duplicates_through_vfs() {
        let mut vfs = MemoryVfs::new();
        vfs.insert("/dev/tty", Vec::new(), 0o666, 0);
        let handle = vfs.open("/dev/tty").expect("open");
        let table = FileTable {
            entries: vec![Some(handle), None],
        };
        let mut copy = table.duplicate(&mut vfs).expect("dup");
        assert_eq!(copy.open_count(), 1);
        assert_ne!(copy.entries[0], table.entries[0]);
        assert_eq!(vfs.open_handles(), 2);
        copy.close_all(&mut vfs);
        assert_eq!(vfs.open_handles(), 1);
    }

    #[test]
    fn pad_to_only_grows() {
        let mut table = FileTable::default();
        table.pad_to(3);
        assert_eq!(table.entries.len(), 3);
        table.pad_to(1);
        assert_eq!(table.entries.len(), 3);
    }

    #[test]
    fn signal_frame_copies_stack_bytes() {
        let mut process = Process::new(1, "sh", SpaceId::KERNEL, 16);
        process.kstack.bytes_mut()[15] = 0xAA;
        process.context.ip = 0x1234;
        let frame = process.capture_signal_frame();
        assert_eq!(frame.kernel_stack[15], 0xAA);
        assert_eq!(frame.context.ip, 0x1234);
    }
}
