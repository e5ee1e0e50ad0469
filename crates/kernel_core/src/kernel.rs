use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use hal::{Errno, Interrupts, PhysMemory};
use spin::{Mutex, MutexGuard, Once};

use crate::config::KernelConfig;
use crate::pmm::FrameAllocator;
use crate::process::{Pid, ProcState, Process};
use crate::scheduler::Scheduler;
use crate::signal::SignalDelivery;
use crate::vfs::Vfs;
use crate::vmm::{SpaceId, Vmm};

/// Pid of the idle task created at boot.
pub const IDLE_PID: Pid = 0;

/// Pid that adopts orphaned children.
pub const INIT_PID: Pid = 1;

/// Masks interrupts for its lifetime.
pub struct IrqGuard<I: Interrupts> {
    irq: I,
    was_enabled: bool,
}

impl<I: Interrupts> IrqGuard<I> {
    pub fn new(irq: I) -> Self {
        let was_enabled = irq.disable();
        Self { irq, was_enabled }
    }
}

impl<I: Interrupts> Drop for IrqGuard<I> {
    fn drop(&mut self) {
        self.irq.restore(self.was_enabled);
    }
}

/// The process core's global state.
pub struct Kernel<M: PhysMemory, I: Interrupts> {
    pub(crate) vm: Vmm<M>,
    pub(crate) irq: I,
    pub(crate) config: KernelConfig,
    pub(crate) procs: BTreeMap<Pid, Process>,
    pub(crate) scheduler: Scheduler,
    pub(crate) vfs: Box<dyn Vfs + Send>,
    pub(crate) signals: Box<dyn SignalDelivery + Send>,
}

impl<M: PhysMemory, I: Interrupts> Kernel<M, I> {
    /// Builds the kernel address space and makes the idle task current.
    pub fn new(
        frames: FrameAllocator,
        memory: M,
        irq: I,
        config: KernelConfig,
        vfs: Box<dyn Vfs + Send>,
        signals: Box<dyn SignalDelivery + Send>,
    ) -> Result<Self, Errno> {
        let mut vm = Vmm::new(frames, memory, &config)?;
        vm.retain(SpaceId::KERNEL)?;
        let mut idle = Process::new(IDLE_PID, "[idle]", SpaceId::KERNEL, config.kernel_stack_size);
        idle.state = ProcState::Running;

        let mut procs = BTreeMap::new();
        procs.insert(IDLE_PID, idle);
        log::info!(
            "kernel: {} KiB of {} KiB physical memory in use",
            vm.frames().memory_use_kib(),
            vm.frames().memory_total_kib()
        );
        Ok(Self {
            vm,
            irq,
            config,
            procs,
            scheduler: Scheduler::new(IDLE_PID),
            vfs,
            signals,
        })
    }

    pub(crate) fn irq_guard(&self) -> IrqGuard<I> {
        IrqGuard::new(self.irq.clone())
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn vm(&self) -> &Vmm<M> {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vmm<M> {
        &mut self.vm
    }

    pub fn frames(&self) -> &FrameAllocator {
        self.vm.frames()
    }

    pub fn vfs_mut(&mut self) -> &mut (dyn Vfs + Send) {
        &mut *self.vfs
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn current_pid(&self) -> Pid {
        self.scheduler.current()
    }

    pub fn getpid(&self) -> Pid {
        self.current_pid()
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid)
    }

    pub fn process_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(&pid)
    }

    pub fn current(&self) -> Result<&Process, Errno> {
        self.procs.get(&self.scheduler.current()).ok_or(Errno::NotFound)
    }

    pub(crate) fn current_mut(&mut self) -> Result<&mut Process, Errno> {
        self.procs.get_mut(&self.scheduler.current()).ok_or(Errno::NotFound)
    }

    pub fn process_count(&self) -> usize {
        self.procs.len()
    }

    /// Grows the kernel heap by a whole number of pages.
    pub fn sbrk(&mut self, increment: u64) -> Result<u64, Errno> {
        let _irq = self.irq_guard();
        self.vm.sbrk(increment)
    }
}

/// Per-core holder for a lazily installed value.
pub struct CoreLocal<T> {
    cell: Once<Mutex<T>>,
}

impl<T> CoreLocal<T> {
    pub const fn new() -> Self {
        Self { cell: Once::new() }
    }

    /// Installs the value; later calls keep the first one.
    pub fn init(&self, value: T) {
        self.cell.call_once(|| Mutex::new(value));
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.is_completed()
    }

    pub fn lock(&self) -> Option<MutexGuard<'_, T>> {
        self.cell.get().map(Mutex::lock)
    }

    /// Runs `f` with exclusive access to the value, if installed.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.lock().map(|mut value| f(&mut value))
    }
}

impl<T> Default for CoreLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    use crate::signal::DefaultSignals;
    use crate::sim::SimulatedRam;
    use crate::vfs::MemoryVfs;
    use alloc::rc::Rc;

    #[derive(Clone, Default)]
    struct CountingIrq {
        enabled: Rc<Cell<bool>>,
        disables: Rc<Cell<usize>>,
    }

    impl Interrupts for CountingIrq {
        fn disable(&self) -> bool {
            self.disables.set(self.disables.get() + 1);
            self.enabled.replace(false)
        }

        fn restore(&self, was_enabled: bool) {
            self.enabled.set(was_enabled);
        }
    }

    #[test]
    fn irq_guard_restores_previous_state() {
        let irq = CountingIrq::default();
        irq.enabled.set(true);
        {
            let _outer = IrqGuard::new(irq.clone());
            assert!(!irq.enabled.get());
            {
                let _inner = IrqGuard::new(irq.clone());
            }
            assert!(!irq.enabled.get());
        }
        assert!(irq.enabled.get());
        assert_eq!(irq.disables.get(), 2);
    }

    #[test]
    fn new_kernel_runs_idle_on_kernel_space() {
        let ram = SimulatedRam::new(0x40_0000);
        let frames = FrameAllocator::new(ram.size());
        let kernel = Kernel::new(
            frames,
            ram,
            CountingIrq::default(),
            KernelConfig::small(),
            Box::new(MemoryVfs::new()),
            Box::new(DefaultSignals::default()),
        )
        .expect("kernel");
        assert_eq!(kernel.getpid(), IDLE_PID);
        let idle = kernel.current().expect("idle");
        assert_eq!(idle.state, ProcState::Running);
        assert_eq!(idle.space, SpaceId::KERNEL);
        assert_eq!(kernel.vm().refs(SpaceId::KERNEL), 2);
    }

    #[test]
    fn core_local_installs_once() {
        static SLOT: CoreLocal<u32> = CoreLocal::new();
        assert!(SLOT.with(|value| *value).is_none());
        SLOT.init(7);
        SLOT.init(9);
        assert!(SLOT.is_initialized());
        let bumped = SLOT.with(|value| {
            *value += 1;
            *value
        });
        assert_eq!(bumped, Some(8));
        assert_eq!(SLOT.lock().map(|value| *value), Some(8));
    }
}
