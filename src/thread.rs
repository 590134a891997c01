//! Per-thread state.
//!
//! A [`Thread`] is plain bookkeeping: the process controller owns the
//! table of them and drives all transitions. There is deliberately no
//! back-pointer to the process; a thread is always reached through its
//! owning [`Process`](crate::process::Process).

use serde::Serialize;

use crate::addr::Addr;
use crate::driver::Tid;
use crate::sym::SymbolOracle;

/// Runtime functions a thread parks in while waiting on the kernel.
/// A thread stopped inside one of these carries no useful user context and
/// is excluded from goroutine association.
pub const BLOCKED_FUNCTIONS: &[&str] = &[
    "runtime.futexsleep",
    "runtime.usleep",
    "runtime.clone",
    "runtime.kevent",
];

#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub tid: Tid,
    pub running: bool,
    /// Program counter at the last observed stop.
    pub pc: Addr,
    /// Address of the breakpoint this thread is stopped at, if any.
    /// A weak reference into the breakpoint table, keyed by address.
    pub current_breakpoint: Option<Addr>,
    /// Signal to re-deliver on the next resume, 0 for none.
    pub pending_signal: u8,
}

impl Thread {
    pub fn new(tid: Tid, running: bool) -> Self {
        Self {
            tid,
            running,
            pc: Addr::NULL,
            current_breakpoint: None,
            pending_signal: 0,
        }
    }

    /// Mark the thread as resumed. Running threads never reference a
    /// current breakpoint.
    pub(crate) fn set_running(&mut self) {
        self.running = true;
        self.current_breakpoint = None;
    }

    pub(crate) fn stop_at(&mut self, pc: Addr) {
        self.running = false;
        self.pc = pc;
    }

    pub fn stopped_at_breakpoint(&self) -> bool {
        !self.running && self.current_breakpoint.is_some()
    }
}

/// Whether a PC is parked inside one of the runtime's kernel-wait
/// functions.
pub fn blocked(oracle: &dyn SymbolOracle, pc: Addr) -> bool {
    oracle
        .function_of(pc)
        .is_some_and(|f| BLOCKED_FUNCTIONS.contains(&f.as_str()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sym::TableOracle;

    #[test]
    fn test_running_clears_current_breakpoint() {
        let mut th = Thread::new(7, false);
        th.current_breakpoint = Some(Addr::from(0x1000usize));
        assert!(th.stopped_at_breakpoint());
        th.set_running();
        assert!(th.running);
        assert!(th.current_breakpoint.is_none());
    }

    #[test]
    fn test_blocked_detection() {
        let mut o = TableOracle::new();
        o.add_function(
            "runtime.futexsleep",
            Addr::from(0x2000usize),
            Addr::from(0x2040usize),
            "runtime.go",
            1,
        );
        o.add_function(
            "main.main",
            Addr::from(0x1000usize),
            Addr::from(0x1040usize),
            "main.go",
            1,
        );
        assert!(blocked(&o, Addr::from(0x2010usize)));
        assert!(!blocked(&o, Addr::from(0x1010usize)));
        assert!(!blocked(&o, Addr::from(0x9000usize)));
    }
}
