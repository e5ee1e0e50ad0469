//! Page-fault entry: sentinel returns and the fault-to-signal bridge.

use hal::{Errno, FaultInfo, Interrupts, PhysMemory};

use crate::kernel::Kernel;
use crate::process::TrapFrame;
use crate::protection::describe_region;
use crate::scheduler::{Dispatch, Resume};
use crate::signal::SIGSEGV;
use crate::task::THREAD_RETURN;

/// Return address planted under a user signal handler; reaching it restores
/// the state saved before the handler ran.
pub const SIGNAL_RETURN: usize = 0xFFFF_DEAF;

/// What the trap handler does after a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Return to the interrupted code (a handler may have been arranged).
    Continue,
    /// Switch to the given dispatch.
    Switch(Dispatch),
}

impl<M: PhysMemory, I: Interrupts> Kernel<M, I> {
    /// Handles a page fault taken by the current process.
    ///
    /// Only user-mode faults of a real process are recoverable. A fault in
    /// kernel mode, or one taken while the idle task is current, returns
    /// `NoPerm` and the caller must treat it as fatal.
    pub fn page_fault(
        &mut self,
        fault: FaultInfo,
        trap: &TrapFrame,
    ) -> Result<FaultOutcome, Errno> {
        let pid = self.scheduler.current();
        if !fault.user() || pid == self.scheduler.idle() {
            log::error!(
                "fault: unrecoverable {} fault at {:#x} ip {:#x} in pid {}",
                if fault.user() { "user" } else { "kernel" },
                fault.addr,
                fault.ip,
                pid
            );
            return Err(Errno::NoPerm);
        }
        if fault.ip == SIGNAL_RETURN {
            return self.return_from_signal().map(FaultOutcome::Switch);
        }
        if fault.ip == THREAD_RETURN {
            return self.exit(0).map(FaultOutcome::Switch);
        }

        log::warn!(
            "fault: pid {} at {:#x} ({}) ip {:#x}: {} {} {}{}{}",
            pid,
            fault.addr,
            describe_region(&self.config, fault.addr),
            fault.ip,
            if fault.not_present() { "not-present" } else { "protection" },
            if fault.write() { "write" } else { "read" },
            if fault.user() { "user" } else { "kernel" },
            if fault.reserved() { " reserved" } else { "" },
            if fault.instruction_fetch() { " fetch" } else { "" },
        );
        let process = self.current_mut()?;
        process.trap = *trap;
        process.signals.pending.push_back(SIGSEGV);
        Ok(match self.deliver_signals()? {
            Some(dispatch) => FaultOutcome::Switch(dispatch),
            None => FaultOutcome::Continue,
        })
    }

    /// Restores the context, trap frame and kernel stack saved before a
    /// signal handler ran, and resumes the current process there.
    pub fn return_from_signal(&mut self) -> Result<Dispatch, Errno> {
        let _irq = self.irq_guard();
        let pid = self.scheduler.current();
        let process = self.procs.get_mut(&pid).ok_or(Errno::NotFound)?;
        let frame = process.signals.frame.take().ok_or(Errno::InvalidArg)?;
        process.context = frame.context;
        process.trap = frame.trap;
        let stack = process.kstack.bytes_mut();
        let len = stack.len().min(frame.kernel_stack.len());
        stack[..len].copy_from_slice(&frame.kernel_stack[..len]);
        let space = process.space;
        let kernel_stack_top = process.kstack.top();
        log::trace!("fault: pid {} returned from signal handler", pid);
        Ok(Dispatch {
            pid,
            resume: Resume::Resumed(frame.context),
            directory: self.vm.physical_address(space)?,
            kernel_stack_top,
        })
    }
}
