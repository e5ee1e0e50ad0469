use alloc::collections::{BTreeMap, VecDeque};

use hal::{Errno, Interrupts, PhysAddr, PhysMemory};

use crate::config::KernelConfig;
use crate::kernel::Kernel;
use crate::process::{Context, KernelStack, Pid, ProcState, Process, Start};
use crate::signal::{is_deliverable, Disposition};

/// Round-robin ready queue for a single core.
#[derive(Debug)]
pub struct Scheduler {
    ready: VecDeque<Pid>,
    current: Pid,
    idle: Pid,
    reap: VecDeque<Pid>,
    next_pid: Pid,
}

impl Scheduler {
    /// Creates a scheduler running the idle task.
    pub fn new(idle: Pid) -> Self {
        Self {
            ready: VecDeque::new(),
            current: idle,
            idle,
            reap: VecDeque::new(),
            next_pid: idle + 1,
        }
    }

    pub fn current(&self) -> Pid {
        self.current
    }

    pub fn idle(&self) -> Pid {
        self.idle
    }

    pub fn alloc_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    /// Enqueues a process in the ready queue.
    pub fn push_ready(&mut self, pid: Pid) {
        if pid != self.idle && !self.ready.contains(&pid) {
            self.ready.push_back(pid);
        }
    }

    pub fn is_ready(&self, pid: Pid) -> bool {
        self.ready.contains(&pid)
    }

    /// Returns the number of ready processes.
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn queue_reap(&mut self, pid: Pid) {
        self.reap.push_back(pid);
    }

    /// Pops the next runnable record, or the idle task when none is left.
    ///
    /// Finished records are dropped from the queue. A started record whose
    /// saved instruction pointer is outside kernel text is corrupt: it is
    /// logged and skipped, never terminated.
    pub fn select_next(&mut self, procs: &BTreeMap<Pid, Process>, config: &KernelConfig) -> Pid {
        while let Some(pid) = self.ready.pop_front() {
            let Some(process) = procs.get(&pid) else {
                continue;
            };
            if process.is_finished() {
                continue;
            }
            if process.is_started() && !config.is_kernel_code(process.context.ip) {
                log::warn!(
                    "scheduler: skipping pid {} with corrupt saved ip {:#x}",
                    pid,
                    process.context.ip
                );
                continue;
            }
            return pid;
        }
        self.idle
    }

    fn take_reap(&mut self) -> VecDeque<Pid> {
        core::mem::take(&mut self.reap)
    }
}

/// How the dispatched record continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// First dispatch of a record: build its initial frame from the start descriptor.
    FirstEntry(Start),
    /// Jump back into a saved kernel context.
    Resumed(Context),
}

/// Everything the architecture switch primitive needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub pid: Pid,
    pub resume: Resume,
    /// Page directory to activate.
    pub directory: PhysAddr,
    pub kernel_stack_top: usize,
}

impl<M: PhysMemory, I: Interrupts> Kernel<M, I> {
    /// Saves the current context and switches away.
    ///
    /// With `reschedule` the current record goes to the back of the ready
    /// queue; otherwise it only runs again once something wakes it.
    pub fn yield_current(&mut self, reschedule: bool, saved: Context) -> Dispatch {
        let _irq = self.irq_guard();
        let pid = self.scheduler.current();
        if let Some(process) = self.procs.get_mut(&pid) {
            process.context = saved;
            if process.state == ProcState::Running {
                process.state = ProcState::Ready;
            }
            if reschedule && pid != self.scheduler.idle() && !process.is_finished() {
                self.scheduler.push_ready(pid);
            }
        }
        self.switch_next()
    }

    /// Promotes exactly one ready record to running and describes how to resume it.
    pub fn switch_next(&mut self) -> Dispatch {
        let _irq = self.irq_guard();
        let previous = self.scheduler.current();
        if let Some(process) = self.procs.get_mut(&previous) {
            if process.state == ProcState::Running {
                process.state = ProcState::Ready;
            }
        }

        let next = self.scheduler.select_next(&self.procs, &self.config);
        self.scheduler.current = next;
        let idle = self.scheduler.idle();
        let process = match self.procs.get_mut(&next) {
            Some(process) => process,
            None => panic!("scheduler selected missing pid {}", next),
        };
        if next == idle && process.is_finished() {
            panic!("idle task finished");
        }

        let resume = if process.is_started() {
            if process.signals.frame.is_none() && !process.signals.pending.is_empty() {
                process.signals.frame = Some(process.capture_signal_frame());
            }
            process.just_resumed = true;
            Resume::Resumed(process.context)
        } else {
            process.just_resumed = false;
            Resume::FirstEntry(process.start)
        };
        process.state = ProcState::Running;
        let space = process.space;
        let kernel_stack_top = process.kstack.top();

        let directory = match self.vm.physical_address(space) {
            Ok(directory) => directory,
            Err(_) => panic!("pid {} runs on a released address space", next),
        };
        log::trace!("scheduler: {} -> {}", previous, next);
        Dispatch {
            pid: next,
            resume,
            directory,
            kernel_stack_top,
        }
    }

    /// Work owed by a record that was just switched back in: reap finished
    /// records and deliver pending signals. Returns a new dispatch if a
    /// signal terminated the record.
    pub fn finish_resume(&mut self) -> Result<Option<Dispatch>, Errno> {
        let pid = self.scheduler.current();
        let resumed = match self.procs.get_mut(&pid) {
            Some(process) => core::mem::replace(&mut process.just_resumed, false),
            None => false,
        };
        if !resumed {
            return Ok(None);
        }
        self.reap();
        self.deliver_signals()
    }

    /// Releases what finished records still hold. Records nobody will wait
    /// for are removed entirely.
    pub fn reap(&mut self) {
        let _irq = self.irq_guard();
        let current = self.scheduler.current();
        for pid in self.scheduler.take_reap() {
            if pid == current {
                self.scheduler.queue_reap(pid);
                continue;
            }
            let parent = match self.procs.get_mut(&pid) {
                Some(process) if process.is_finished() => {
                    process.kstack = KernelStack::empty();
                    process.signals.frame = None;
                    process.parent
                }
                _ => continue,
            };
            let waited_on = parent
                .filter(|parent| *parent != self.scheduler.idle())
                .and_then(|parent| self.procs.get(&parent))
                .is_some_and(|parent| !parent.is_finished());
            if !waited_on {
                self.procs.remove(&pid);
                log::debug!("scheduler: reaped pid {}", pid);
            }
        }
    }

    /// Delivers queued, unblocked signals to the current record one at a time.
    ///
    /// A terminating signal that cannot end the record (the idle task) is an
    /// error, not a silent drop.
    pub fn deliver_signals(&mut self) -> Result<Option<Dispatch>, Errno> {
        let pid = self.scheduler.current();
        loop {
            let Some(process) = self.procs.get_mut(&pid) else {
                return Ok(None);
            };
            let blocked = process.signals.blocked;
            let next = process
                .signals
                .pending
                .iter()
                .position(|signal| is_deliverable(*signal, blocked))
                .and_then(|index| process.signals.pending.remove(index));
            let Some(signal) = next else {
                return Ok(None);
            };

            match self.signals.deliver(process, signal) {
                Disposition::Ignore => continue,
                Disposition::Handled => {
                    if process.signals.frame.is_none() {
                        process.signals.frame = Some(process.capture_signal_frame());
                    }
                    return Ok(None);
                }
                Disposition::Terminate => {
                    log::info!("scheduler: pid {} terminated by signal {}", pid, signal);
                    return self.exit(128 + signal as i32).map(Some);
                }
            }
        }
    }
}
