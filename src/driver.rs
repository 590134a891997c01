//! # Platform driver
//!
//! [`Driver`] is the capability set every backend implements: the native
//! Linux driver ([`linux::LinuxDriver`]), the native Windows driver, and
//! the gdb-remote driver used for record/replay targets. Higher layers
//! program exclusively against this trait and never branch on the OS.
//!
//! Stop events flow out of [`Driver::wait`] as [`StopEvent`]s; the process
//! controller classifies them further (breakpoint hits, thread table
//! reconciliation) before they reach the user.

use serde::Serialize;

use crate::addr::Addr;
use crate::errors::Result;
use crate::regs::Registers;

/// A thread id in the target. On Linux this is the kernel tid, on Windows
/// the thread id from the debug event, on replay targets the id reported
/// by the server.
pub type Tid = i32;

pub const SIGTRAP: u8 = 5;
pub const SIGKILL: u8 = 9;
pub const SIGSTOP: u8 = 19;

/// What the target stopped for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopKind {
    /// A trap: breakpoint, single-step completion, or manual halt.
    Trap,
    /// The thread spawned a new thread.
    Clone { child: Tid },
    /// A non-leader thread exited.
    ExitThread { code: i32 },
    /// The process exited. Positive `status` is an exit code, negative is
    /// the number of the terminating signal.
    Exit { status: i32 },
    /// The thread stopped on a signal the core does not handle itself.
    Signal,
}

/// One observed debug event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopEvent {
    pub tid: Tid,
    pub kind: StopKind,
    /// Raw signal number, 0 when no signal is associated with the event.
    pub signal: u8,
}

/// OS debug primitives, one implementation per backend.
pub trait Driver {
    /// Process id of the target.
    fn pid(&self) -> i32;

    /// Enumerate the threads of the target as the OS currently sees them.
    fn list_threads(&mut self) -> Result<Vec<Tid>>;

    /// Block until the next debug event.
    fn wait(&mut self) -> Result<StopEvent>;

    /// Block until the next debug event of one specific thread. Used by
    /// the single-step paths, where the event of interest can only come
    /// from the stepped thread.
    fn wait_thread(&mut self, tid: Tid) -> Result<StopEvent>;

    /// Resume one thread, delivering `signal` (0 for none).
    fn cont(&mut self, tid: Tid, signal: u8) -> Result<()>;

    /// Execute a single instruction on one thread.
    fn single_step(&mut self, tid: Tid) -> Result<()>;

    /// Stop a running target. Must be a no-op when the target is already
    /// stopped at a debug event.
    fn halt(&mut self) -> Result<()>;

    /// Put a newly observed thread under the same debug regime as the
    /// rest of the target (trace options etc.).
    fn register_thread(&mut self, tid: Tid) -> Result<()>;

    fn read_memory(&mut self, tid: Tid, addr: Addr, n: usize) -> Result<Vec<u8>>;
    fn write_memory(&mut self, tid: Tid, addr: Addr, data: &[u8]) -> Result<usize>;

    fn get_regs(&mut self, tid: Tid) -> Result<Registers>;
    fn set_regs(&mut self, tid: Tid, regs: &Registers) -> Result<()>;

    /// Read a word from the user area of a thread (debug registers live
    /// there on Linux). Backends without a user area return an error.
    fn peek_user(&mut self, tid: Tid, offset: u64) -> Result<u64>;
    fn poke_user(&mut self, tid: Tid, offset: u64, word: u64) -> Result<()>;

    /// Whether this backend can install hardware breakpoints at all.
    fn supports_hardware_breakpoints(&self) -> bool {
        true
    }

    /// Program debug register slot `slot` (0..=3) with `addr` on `tid`.
    fn set_hw_breakpoint(&mut self, tid: Tid, slot: usize, addr: Addr) -> Result<()>;

    /// Disable debug register slot `slot` on `tid`.
    fn clear_hw_breakpoint(&mut self, tid: Tid, slot: usize) -> Result<()>;

    /// Detach from the target, optionally killing it. Breakpoint cleanup
    /// is the controller's job and has already happened.
    fn detach(&mut self, kill: bool) -> Result<()>;
}

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(windows)]
pub mod windows;

#[cfg(test)]
pub(crate) mod mock {
    //! A scripted driver for exercising the controllers without a tracee.

    use std::collections::{HashMap, VecDeque};

    use super::*;
    use crate::errors::DebuggerError;

    /// One scripted debug event. When `rip` is set, the event also moves
    /// the thread's PC there at delivery time, the way a real resume
    /// would.
    pub(crate) struct ScriptedStop {
        pub event: StopEvent,
        pub rip: Option<u64>,
    }

    pub(crate) struct MockDriver {
        pub pid: Tid,
        pub base: usize,
        pub mem: Vec<u8>,
        pub threads: Vec<Tid>,
        pub script: VecDeque<ScriptedStop>,
        pub regs: HashMap<Tid, Registers>,
        pub hw: [Option<(Tid, Addr)>; 4],
        pub hw_supported: bool,
    }

    impl MockDriver {
        pub fn new(pid: Tid, base: usize, mem_size: usize) -> Self {
            Self {
                pid,
                base,
                mem: vec![0x90; mem_size],
                threads: vec![pid],
                script: VecDeque::new(),
                regs: HashMap::from([(pid, Registers::default())]),
                hw: [None; 4],
                hw_supported: true,
            }
        }

        pub fn push_stop(&mut self, ev: StopEvent) {
            self.script.push_back(ScriptedStop {
                event: ev,
                rip: None,
            });
        }

        pub fn push_stop_at(&mut self, ev: StopEvent, rip: u64) {
            self.script.push_back(ScriptedStop {
                event: ev,
                rip: Some(rip),
            });
        }

        pub fn set_pc(&mut self, tid: Tid, pc: Addr) {
            self.regs.entry(tid).or_default().set_pc(pc);
        }

        fn offset(&self, addr: Addr, len: usize) -> Result<usize> {
            let off = addr.usize().wrapping_sub(self.base);
            if addr.usize() < self.base || off + len > self.mem.len() {
                return Err(DebuggerError::OutOfBounds { addr, len });
            }
            Ok(off)
        }
    }

    impl Driver for MockDriver {
        fn pid(&self) -> i32 {
            self.pid
        }

        fn list_threads(&mut self) -> Result<Vec<Tid>> {
            Ok(self.threads.clone())
        }

        fn wait(&mut self) -> Result<StopEvent> {
            let scripted = self
                .script
                .pop_front()
                .ok_or_else(|| DebuggerError::Parse("mock driver ran out of events".into()))?;
            if let Some(rip) = scripted.rip {
                self.regs.entry(scripted.event.tid).or_default().rip = rip;
            }
            Ok(scripted.event)
        }

        fn wait_thread(&mut self, tid: Tid) -> Result<StopEvent> {
            let ev = self.wait()?;
            assert_eq!(ev.tid, tid, "scripted event belongs to another thread");
            Ok(ev)
        }

        fn cont(&mut self, _tid: Tid, _signal: u8) -> Result<()> {
            Ok(())
        }

        fn single_step(&mut self, tid: Tid) -> Result<()> {
            // the step trap is observed before anything else
            self.script.push_front(ScriptedStop {
                event: StopEvent {
                    tid,
                    kind: StopKind::Trap,
                    signal: SIGTRAP,
                },
                rip: None,
            });
            Ok(())
        }

        fn halt(&mut self) -> Result<()> {
            Ok(())
        }

        fn register_thread(&mut self, tid: Tid) -> Result<()> {
            if !self.threads.contains(&tid) {
                self.threads.push(tid);
            }
            self.regs.entry(tid).or_default();
            Ok(())
        }

        fn read_memory(&mut self, _tid: Tid, addr: Addr, n: usize) -> Result<Vec<u8>> {
            if n == 0 {
                return Ok(Vec::new());
            }
            let off = self.offset(addr, n)?;
            Ok(self.mem[off..off + n].to_vec())
        }

        fn write_memory(&mut self, _tid: Tid, addr: Addr, data: &[u8]) -> Result<usize> {
            if data.is_empty() {
                return Ok(0);
            }
            let off = self.offset(addr, data.len())?;
            self.mem[off..off + data.len()].copy_from_slice(data);
            Ok(data.len())
        }

        fn get_regs(&mut self, tid: Tid) -> Result<Registers> {
            self.regs
                .get(&tid)
                .copied()
                .ok_or(DebuggerError::UnknownThread(tid))
        }

        fn set_regs(&mut self, tid: Tid, regs: &Registers) -> Result<()> {
            self.regs.insert(tid, *regs);
            Ok(())
        }

        fn peek_user(&mut self, _tid: Tid, _offset: u64) -> Result<u64> {
            Ok(0)
        }

        fn poke_user(&mut self, _tid: Tid, _offset: u64, _word: u64) -> Result<()> {
            Ok(())
        }

        fn supports_hardware_breakpoints(&self) -> bool {
            self.hw_supported
        }

        fn set_hw_breakpoint(&mut self, tid: Tid, slot: usize, addr: Addr) -> Result<()> {
            assert!(slot < 4, "invalid debug register slot");
            assert!(self.hw[slot].is_none(), "slot {slot} already enabled");
            self.hw[slot] = Some((tid, addr));
            Ok(())
        }

        fn clear_hw_breakpoint(&mut self, _tid: Tid, slot: usize) -> Result<()> {
            assert!(slot < 4, "invalid debug register slot");
            self.hw[slot] = None;
            Ok(())
        }

        fn detach(&mut self, _kill: bool) -> Result<()> {
            Ok(())
        }
    }
}
