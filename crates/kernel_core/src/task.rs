//! Process creation and teardown: fork, clone, kernel workers, exit and wait.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hal::{Errno, Interrupts, PhysMemory, VirtAddr};

use crate::kernel::{Kernel, INIT_PID};
use crate::process::{Context, Pid, ProcState, Process, Start, TrapFrame};
use crate::protection::validate_user_range;
use crate::scheduler::Dispatch;
use crate::vmm::SpaceId;

/// Return address planted under a clone entry point; reaching it ends the thread.
pub const THREAD_RETURN: usize = 0xFFFF_B00F;

/// Size of a word pushed onto a user stack.
pub const USER_WORD: u64 = 8;

/// Result of a wait request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A finished child was collected.
    Reaped { pid: Pid, status: i32 },
    /// No child has finished yet; the caller sleeps and this dispatch runs instead.
    Sleep(Dispatch),
}

impl<M: PhysMemory, I: Interrupts> Kernel<M, I> {
    /// Duplicates the current process. The parent receives the child pid; the
    /// child resumes in user mode with a return value of zero.
    pub fn fork(&mut self, trap: &TrapFrame) -> Result<Pid, Errno> {
        let _irq = self.irq_guard();
        let parent_pid = self.scheduler.current();
        let parent = self.procs.get(&parent_pid).ok_or(Errno::NotFound)?;
        let parent_space = parent.space;
        let files = parent.files.lock().duplicate(&mut *self.vfs)?;

        let space = self.vm.clone_space(parent_space)?;
        let pid = self.scheduler.alloc_pid();
        let parent = self.procs.get(&parent_pid).ok_or(Errno::NotFound)?;
        let mut child = Process::new(pid, &parent.name, space, self.config.kernel_stack_size);
        child.cmdline = parent.cmdline.clone();
        child.user = parent.user;
        child.real_user = parent.real_user;
        child.group = parent.group;
        child.image = parent.image;
        child.signals.blocked = parent.signals.blocked;
        child.kstack.copy_from(&parent.kstack);
        *child.files.lock() = files;
        child.parent = Some(parent_pid);
        child.trap = TrapFrame { ret: 0, ..*trap };
        child.start = Start::ReturnToUser;

        self.adopt(parent_pid, child);
        log::debug!("task: pid {} forked pid {}", parent_pid, pid);
        Ok(pid)
    }

    /// Starts a thread sharing the current address space and file table.
    ///
    /// `arg` and then [`THREAD_RETURN`] are pushed onto `new_stack`, so the
    /// entry point sees `arg` as its first stack argument and returning from
    /// it faults at the sentinel.
    pub fn clone(
        &mut self,
        new_stack: VirtAddr,
        entry: usize,
        arg: usize,
        trap: &TrapFrame,
    ) -> Result<Pid, Errno> {
        let _irq = self.irq_guard();
        let parent_pid = self.scheduler.current();
        let parent = self.procs.get(&parent_pid).ok_or(Errno::NotFound)?;
        let space = parent.space;
        let sp = new_stack.checked_sub(2 * USER_WORD).ok_or(Errno::InvalidArg)?;
        validate_user_range(&self.config, sp, 2 * USER_WORD)?;

        self.vm.write_bytes(space, new_stack - USER_WORD, &(arg as u64).to_le_bytes())?;
        self.vm.write_bytes(space, sp, &(THREAD_RETURN as u64).to_le_bytes())?;
        self.vm.retain(space)?;

        let pid = self.scheduler.alloc_pid();
        let parent = self.procs.get(&parent_pid).ok_or(Errno::NotFound)?;
        let mut child = Process::new(pid, &parent.name, space, self.config.kernel_stack_size);
        child.cmdline = parent.cmdline.clone();
        child.user = parent.user;
        child.real_user = parent.real_user;
        child.group = parent.group;
        child.image = parent.image;
        child.files = Arc::clone(&parent.files);
        child.parent = Some(parent_pid);
        child.trap = TrapFrame {
            ip: entry,
            sp: sp as usize,
            bp: new_stack as usize,
            ret: 0,
            flags: trap.flags,
        };
        child.start = Start::ReturnToUser;

        self.adopt(parent_pid, child);
        log::debug!("task: pid {} cloned thread pid {}", parent_pid, pid);
        Ok(pid)
    }

    /// Creates a kernel worker running `entry(arg)` on the kernel address space.
    pub fn spawn_kernel_worker(
        &mut self,
        entry: usize,
        name: &str,
        arg: usize,
    ) -> Result<Pid, Errno> {
        let _irq = self.irq_guard();
        self.vm.retain(SpaceId::KERNEL)?;
        let pid = self.scheduler.alloc_pid();
        let mut worker = Process::new(pid, name, SpaceId::KERNEL, self.config.kernel_stack_size);
        worker.start = Start::KernelWorker { entry, arg };
        self.procs.insert(pid, worker);
        self.scheduler.push_ready(pid);
        log::debug!("task: kernel worker {} is pid {}", name, pid);
        Ok(pid)
    }

    /// Ends the current process with `retval` and returns the next dispatch.
    pub fn exit(&mut self, retval: i32) -> Result<Dispatch, Errno> {
        let _irq = self.irq_guard();
        let pid = self.scheduler.current();
        if pid == self.scheduler.idle() {
            log::error!("task: the idle task cannot exit");
            return Err(Errno::NoPerm);
        }
        let space = self.procs.get(&pid).ok_or(Errno::NotFound)?.space;
        self.vm.release(space)?;

        let process = self.procs.get_mut(&pid).ok_or(Errno::NotFound)?;
        process.state = ProcState::Finished;
        process.status = retval;
        let parent = process.parent;
        let children = core::mem::take(&mut process.children);
        // Finished records keep an empty table so only live sharers count.
        let files = core::mem::take(&mut process.files);
        if let Some(table) = Arc::into_inner(files) {
            table.into_inner().close_all(&mut *self.vfs);
        }

        self.reparent(children);
        if let Some(parent) = parent.and_then(|parent| self.procs.get_mut(&parent)) {
            let sleepers: Vec<Pid> = parent.wait_queue.drain(..).collect();
            for sleeper in sleepers {
                self.scheduler.push_ready(sleeper);
            }
        }
        self.scheduler.queue_reap(pid);
        log::debug!("task: pid {} exited with {}", pid, retval);
        Ok(self.switch_next())
    }

    /// Collects a finished child, or sleeps until one finishes.
    ///
    /// `child` selects a specific pid; `None` accepts any child.
    pub fn wait(&mut self, child: Option<Pid>, saved: Context) -> Result<WaitOutcome, Errno> {
        let _irq = self.irq_guard();
        let pid = self.scheduler.current();
        let process = self.procs.get(&pid).ok_or(Errno::NotFound)?;
        let candidates: Vec<Pid> = process
            .children
            .iter()
            .copied()
            .filter(|candidate| child.map_or(true, |wanted| wanted == *candidate))
            .collect();
        if candidates.is_empty() {
            return Err(Errno::NoChild);
        }

        let finished = candidates
            .iter()
            .copied()
            .find(|candidate| self.procs.get(candidate).is_some_and(Process::is_finished));
        if let Some(done) = finished {
            let status = self.procs.remove(&done).map_or(0, |record| record.status);
            if let Some(process) = self.procs.get_mut(&pid) {
                process.children.retain(|candidate| *candidate != done);
            }
            return Ok(WaitOutcome::Reaped { pid: done, status });
        }

        if let Some(process) = self.procs.get_mut(&pid) {
            process.wait_queue.push_back(pid);
        }
        Ok(WaitOutcome::Sleep(self.yield_current(false, saved)))
    }

    fn adopt(&mut self, parent: Pid, child: Process) {
        let pid = child.pid;
        if let Some(parent) = self.procs.get_mut(&parent) {
            parent.children.push(pid);
        }
        self.procs.insert(pid, child);
        self.scheduler.push_ready(pid);
    }

    /// Hands the children of an exiting process to init.
    fn reparent(&mut self, children: Vec<Pid>) {
        let init = self
            .procs
            .get(&INIT_PID)
            .filter(|init| !init.is_finished())
            .map(|init| init.pid);
        for child in &children {
            if let Some(record) = self.procs.get_mut(child) {
                record.parent = init;
                if init.is_none() && record.is_finished() {
                    self.scheduler.queue_reap(*child);
                }
            }
        }
        if let Some(init) = init.and_then(|init| self.procs.get_mut(&init)) {
            init.children.extend(children);
        }
    }
}
