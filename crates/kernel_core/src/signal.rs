use crate::process::Process;

pub const SIGKILL: u32 = 9;
pub const SIGSEGV: u32 = 11;

/// Number of signal numbers representable in a blocked mask.
pub const SIGNAL_LIMIT: u32 = 64;

/// Outcome of handing a signal to the delivery collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A user handler has been arranged; delivery stops until it returns.
    Handled,
    /// The signal is dropped.
    Ignore,
    /// The process exits with `128 + signal`.
    Terminate,
}

/// Decides how a queued signal reaches a process.
pub trait SignalDelivery {
    fn deliver(&mut self, process: &Process, signal: u32) -> Disposition;
}

/// Default actions only: every signal terminates unless its bit is in `ignored`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSignals {
    pub ignored: u64,
}

impl SignalDelivery for DefaultSignals {
    fn deliver(&mut self, _process: &Process, signal: u32) -> Disposition {
        if signal != SIGKILL && signal < SIGNAL_LIMIT && self.ignored & (1 << signal) != 0 {
            Disposition::Ignore
        } else {
            Disposition::Terminate
        }
    }
}

/// Returns true if `signal` may be delivered under `blocked`.
pub const fn is_deliverable(signal: u32, blocked: u64) -> bool {
    signal == SIGKILL || signal >= SIGNAL_LIMIT || blocked & (1 << signal) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_cannot_be_blocked() {
        assert!(is_deliverable(SIGKILL, u64::MAX));
        assert!(!is_deliverable(SIGSEGV, 1 << SIGSEGV));
        assert!(is_deliverable(SIGSEGV, 1 << SIGKILL));
    }
}
