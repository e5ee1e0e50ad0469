#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod binfmt;
pub mod boot;
pub mod config;
pub mod elf;
pub mod fault;
pub mod initramfs;
pub mod kernel;
pub mod paging;
pub mod pmm;
pub mod process;
pub mod protection;
pub mod scheduler;
pub mod signal;
pub mod sim;
pub mod task;
pub mod vfs;
pub mod vmm;

pub use binfmt::{parse_shebang, Shebang};
pub use boot::{BootInfo, MemoryKind, MemoryRegion};
pub use config::KernelConfig;
pub use elf::{load_elf, parse_elf, ElfLoader, LoadSegment, LoadedElf};
pub use fault::{FaultOutcome, SIGNAL_RETURN};
pub use hal::Errno;
pub use hal::PageFlags;
pub use initramfs::{build_initramfs, load_initramfs, parse_initramfs, InitramfsEntry};
pub use kernel::{CoreLocal, IrqGuard, Kernel, IDLE_PID, INIT_PID};
pub use paging::{PageDirectory, PageTable, Pte};
pub use pmm::{DiagnosticHook, FrameAllocator, FRAME_SIZE};
pub use process::{Context, Pid, ProcState, Process, Start, TrapFrame, UserEntry};
pub use protection::{is_user_address, validate_user_range};
pub use scheduler::{Dispatch, Resume, Scheduler};
pub use signal::{DefaultSignals, Disposition, SignalDelivery};
pub use sim::SimulatedRam;
pub use task::{WaitOutcome, THREAD_RETURN};
pub use vfs::{MemoryVfs, Metadata, Vfs};
pub use vmm::{AddressSpace, SpaceId, Vmm};
