//! # Process controller
//!
//! [`Process`] is the top-level handle on a debugged target: it owns the
//! driver, the thread table, the breakpoint table and (for recorded
//! targets) the replay session, and it is the only component that drives
//! state transitions.
//!
//! The run loop in [`Process::cont`] does the heavy lifting: step every
//! stopped thread over its current breakpoint, resume the world, wait for
//! the next debug event, fold clones and thread exits back into the
//! thread table, classify breakpoint hits (including the PC rewind after
//! an x86 software trap) and pick the thread the user is now looking at.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::addr::Addr;
use crate::arch::Arch;
use crate::breakpoint::{Breakpoint, BreakpointTable};
use crate::driver::{Driver, StopEvent, StopKind, Tid};
use crate::errors::{DebuggerError, Result};
use crate::memory::{MemoryIo, ProcessMemory, TargetMemory};
use crate::memorymap::ProcessMemoryMap;
use crate::regs::{Register, Registers};
use crate::replay::{Direction, ReplaySession};
use crate::sym::SymbolOracle;
use crate::thread::{blocked, Thread};

/// Goroutine status value for a dead goroutine, from the runtime's
/// status enumeration.
const G_DEAD: u64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessStatus {
    Stopped,
    Running,
    /// Terminal. Positive values are exit codes, negative values the
    /// number of the terminating signal.
    Exited(i32),
}

/// A goroutine as read out of the target's runtime structures.
#[derive(Debug, Clone, Serialize)]
pub struct Goroutine {
    pub id: i64,
    pub status: u64,
    /// PC the goroutine parked at.
    pub pc: Addr,
    /// PC of the `go` statement that created it.
    pub go_pc: Addr,
    /// The thread currently hosting this goroutine, if it is resident.
    pub thread: Option<Tid>,
}

/// A debugged process.
pub struct Process {
    pid: i32,
    arch: Arch,
    driver: Box<dyn Driver>,
    oracle: Arc<dyn SymbolOracle>,
    threads: HashMap<Tid, Thread>,
    breakpoints: BreakpointTable,
    status: ProcessStatus,
    current_thread: Tid,
    selected_goroutine: Option<i64>,
    replay: Option<ReplaySession>,
}

impl Process {
    /// Launch `path` under the native driver and return after the initial
    /// stop.
    #[cfg(target_os = "linux")]
    pub fn launch(
        path: impl AsRef<Path>,
        args: &[String],
        cwd: Option<&Path>,
        redirects: &crate::driver::linux::Redirects,
        oracle: Arc<dyn SymbolOracle>,
    ) -> Result<Self> {
        let lane = Arc::new(crate::lane::PtraceLane::new());
        let (driver, tids) =
            crate::driver::linux::LinuxDriver::launch(path, args, cwd, redirects, lane)?;
        Ok(Self::from_parts(Box::new(driver), tids, oracle, None))
    }

    /// Attach to a running process and stop it.
    #[cfg(target_os = "linux")]
    pub fn attach(pid: i32, oracle: Arc<dyn SymbolOracle>) -> Result<Self> {
        let lane = Arc::new(crate::lane::PtraceLane::new());
        let (driver, tids) = crate::driver::linux::LinuxDriver::attach(pid, lane)?;
        Ok(Self::from_parts(Box::new(driver), tids, oracle, None))
    }

    pub(crate) fn from_parts(
        driver: Box<dyn Driver>,
        tids: Vec<Tid>,
        oracle: Arc<dyn SymbolOracle>,
        replay: Option<ReplaySession>,
    ) -> Self {
        let pid = driver.pid();
        let mut p = Self {
            pid,
            arch: Arch::host(),
            driver,
            oracle,
            threads: HashMap::new(),
            breakpoints: BreakpointTable::new(Arch::host()),
            status: ProcessStatus::Stopped,
            current_thread: pid,
            selected_goroutine: None,
            replay,
        };
        for tid in tids {
            p.threads.insert(tid, Thread::new(tid, false));
        }
        if !p.threads.contains_key(&p.current_thread) {
            if let Some(&tid) = p.threads.keys().next() {
                p.current_thread = tid;
            }
        }
        p.refresh_thread_pcs();
        p
    }

    fn refresh_thread_pcs(&mut self) {
        let tids: Vec<Tid> = self.threads.keys().copied().collect();
        for tid in tids {
            if let Ok(regs) = self.driver.get_regs(tid) {
                if let Some(th) = self.threads.get_mut(&tid) {
                    th.pc = regs.pc();
                }
            }
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn exited(&self) -> bool {
        matches!(self.status, ProcessStatus::Exited(_))
    }

    pub fn recorded(&self) -> bool {
        self.replay.is_some()
    }

    fn ensure_not_exited(&self) -> Result<()> {
        match self.status {
            ProcessStatus::Exited(status) => Err(DebuggerError::ProcessExited {
                pid: self.pid,
                status,
            }),
            _ => Ok(()),
        }
    }

    fn mark_exited(&mut self, status: i32) -> DebuggerError {
        self.status = ProcessStatus::Exited(status);
        self.threads.clear();
        DebuggerError::ProcessExited {
            pid: self.pid,
            status,
        }
    }

    // ---------------------------------------------------------------- run

    /// Resume the target and block until the next interesting stop.
    pub fn cont(&mut self) -> Result<StopEvent> {
        self.ensure_not_exited()?;
        if let Some(rs) = &self.replay {
            rs.continue_pre()?;
        }
        let result = self.resume_and_wait();
        if let Some(rs) = &self.replay {
            rs.continue_post();
        }
        result
    }

    fn resume_and_wait(&mut self) -> Result<StopEvent> {
        // threads parked on a breakpoint must step past it first,
        // otherwise it re-triggers before the first real instruction
        let parked: Vec<Tid> = self
            .threads
            .values()
            .filter(|t| t.stopped_at_breakpoint())
            .map(|t| t.tid)
            .collect();
        for tid in parked {
            self.step_over_at_current_breakpoint(tid)?;
            if let Some(th) = self.threads.get_mut(&tid) {
                th.current_breakpoint = None;
            }
        }

        let mut gone = Vec::new();
        let resumable: Vec<(Tid, u8)> = self
            .threads
            .values()
            .map(|t| (t.tid, t.pending_signal))
            .collect();
        for (tid, signal) in resumable {
            match self.driver.cont(tid, signal) {
                Ok(()) => {
                    if let Some(th) = self.threads.get_mut(&tid) {
                        th.set_running();
                        th.pending_signal = 0;
                    }
                }
                Err(DebuggerError::ThreadGone(_)) => gone.push(tid),
                Err(e) => return Err(e),
            }
        }
        for tid in gone {
            trace!("thread {tid} disappeared before resume");
            self.threads.remove(&tid);
        }
        self.status = ProcessStatus::Running;

        loop {
            let ev = self.driver.wait()?;
            match ev.kind {
                StopKind::Clone { child } => {
                    debug!("thread {} cloned {child}", ev.tid);
                    self.driver.register_thread(child)?;
                    self.threads.insert(child, Thread::new(child, true));
                    self.driver.cont(child, 0)?;
                    self.driver.cont(ev.tid, 0)?;
                }
                StopKind::ExitThread { code } => {
                    debug!("thread {} exited with {code}", ev.tid);
                    self.threads.remove(&ev.tid);
                    if self.current_thread == ev.tid {
                        self.current_thread = self.pid;
                    }
                }
                StopKind::Exit { status } => {
                    return Err(self.mark_exited(status));
                }
                StopKind::Trap | StopKind::Signal => {
                    return self.handle_stop(ev);
                }
            }
        }
    }

    fn handle_stop(&mut self, ev: StopEvent) -> Result<StopEvent> {
        self.status = ProcessStatus::Stopped;
        let tid = ev.tid;
        if !self.threads.contains_key(&tid) {
            // a thread we had not seen yet; reconcile
            self.threads.insert(tid, Thread::new(tid, true));
        }

        let mut regs = self.driver.get_regs(tid)?;
        let mut pc = regs.pc();

        // Find the breakpoint this stop belongs to. After a software trap
        // on x86 the PC points one byte past the trap, so both the PC and
        // PC minus the trap length are candidates; in the latter case the
        // PC is rewound onto the breakpoint.
        let bp_size = self.arch.breakpoint_size();
        let bp_addr = if self.breakpoints.get(pc).is_some() {
            Some(pc)
        } else if self.arch.trap_advances_pc()
            && pc.usize() >= bp_size
            && self
                .breakpoints
                .get(pc - bp_size)
                .is_some_and(|bp| !bp.is_hardware())
        {
            pc -= bp_size;
            regs.set_pc(pc);
            self.driver.set_regs(tid, &regs)?;
            Some(pc)
        } else {
            None
        };

        let gid = if bp_addr.is_some() {
            self.goroutine_of(tid)
        } else {
            None
        };

        if let Some(th) = self.threads.get_mut(&tid) {
            th.stop_at(pc);
            th.current_breakpoint = bp_addr;
            if ev.kind == StopKind::Signal {
                th.pending_signal = ev.signal;
            }
        }

        if let Some(addr) = bp_addr {
            if let Some(bp) = self.breakpoints.get_mut(addr) {
                bp.hit(gid);
                trace!("{bp} hit, total {}", bp.total_hit_count);
            }
        }

        self.pick_current_thread(tid);

        // a stop that observed a breakpoint consumes every temp breakpoint
        if bp_addr.is_some() {
            self.clear_temp_breakpoints()?;
        }

        Ok(ev)
    }

    /// Pick the thread later operations refer to, preferring a temp
    /// breakpoint hit over the trapping thread over any other breakpoint
    /// hit.
    fn pick_current_thread(&mut self, trapping: Tid) {
        let on_temp = self
            .threads
            .values()
            .find(|t| {
                t.current_breakpoint
                    .is_some_and(|a| self.breakpoints.get(a).is_some_and(|bp| bp.temp))
            })
            .map(|t| t.tid);
        if let Some(tid) = on_temp {
            self.current_thread = tid;
            return;
        }
        if self
            .threads
            .get(&trapping)
            .is_some_and(Thread::stopped_at_breakpoint)
        {
            self.current_thread = trapping;
            return;
        }
        if let Some(th) = self
            .threads
            .values()
            .find(|t| t.stopped_at_breakpoint())
        {
            self.current_thread = th.tid;
            return;
        }
        self.current_thread = trapping;
    }

    fn clear_temp_breakpoints(&mut self) -> Result<()> {
        if self.exited() {
            // nothing to restore in a process that is gone
            self.breakpoints.drop_temps();
        } else {
            let tid = self.current_thread;
            self.breakpoints.clear_temps(&mut *self.driver, tid)?;
        }
        let live = self.breakpoints.addresses();
        for th in self.threads.values_mut() {
            if th
                .current_breakpoint
                .is_some_and(|a| !live.contains(&a))
            {
                th.current_breakpoint = None;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------ stepping

    /// Execute one instruction on the current thread, stepping over a
    /// software breakpoint installed at the PC.
    pub fn step_instruction(&mut self) -> Result<()> {
        self.ensure_not_exited()?;
        let tid = self.current_thread;
        let pc = self.thread(tid)?.pc;
        if self
            .breakpoints
            .get(pc)
            .is_some_and(|bp| !bp.is_hardware())
        {
            trace!("stepping over the breakpoint at {pc}");
            self.step_over_software(tid, pc)?;
        } else {
            self.driver.single_step(tid)?;
            let ev = self.driver.wait_thread(tid)?;
            if let StopKind::Exit { status } = ev.kind {
                return Err(self.mark_exited(status));
            }
        }
        if let Some(th) = self.threads.get_mut(&tid) {
            th.current_breakpoint = None;
        }
        let regs = self.driver.get_regs(tid)?;
        if let Some(th) = self.threads.get_mut(&tid) {
            th.stop_at(regs.pc());
        }
        Ok(())
    }

    fn step_over_at_current_breakpoint(&mut self, tid: Tid) -> Result<()> {
        let Some(addr) = self.thread(tid)?.current_breakpoint else {
            return Ok(());
        };
        match self.breakpoints.get(addr) {
            Some(bp) if !bp.is_hardware() => self.step_over_software(tid, addr),
            Some(_) => {
                // hardware breakpoints tolerate a single-step while installed
                self.driver.single_step(tid)?;
                let ev = self.driver.wait_thread(tid)?;
                if let StopKind::Exit { status } = ev.kind {
                    return Err(self.mark_exited(status));
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// The step-over dance: restore the original bytes, single-step,
    /// re-install the trap.
    fn step_over_software(&mut self, tid: Tid, addr: Addr) -> Result<()> {
        let original = match self.breakpoints.get(addr) {
            Some(Breakpoint {
                kind: crate::breakpoint::BreakpointKind::Software { original },
                ..
            }) => original.clone(),
            _ => return Ok(()),
        };
        self.driver.write_memory(tid, addr, &original)?;
        self.driver.single_step(tid)?;
        let ev = self.driver.wait_thread(tid)?;
        let trap = self.arch.breakpoint_instruction().to_vec();
        if let StopKind::Exit { status } = ev.kind {
            return Err(self.mark_exited(status));
        }
        self.driver.write_memory(tid, addr, &trap)?;
        Ok(())
    }

    /// Continue to the next source line in the current function, not
    /// descending into calls.
    pub fn next(&mut self) -> Result<StopEvent> {
        self.ensure_not_exited()?;
        if self.breakpoints.has_temps() {
            return Err(DebuggerError::NextWhileNexting);
        }
        let tid = self.current_thread;
        let pc = self.thread(tid)?.pc;
        let func = self
            .oracle
            .function_of(pc)
            .ok_or(DebuggerError::InvalidAddress(pc))?;
        let cond = self
            .goroutine_of(tid)
            .map(|gid| format!("goroutine == {gid}"));

        for line_pc in self.oracle.line_addresses(&func) {
            if line_pc == pc {
                continue;
            }
            self.plant_temp(line_pc, cond.clone());
        }
        if let Ok(ret) = self.return_address(tid) {
            self.plant_temp(ret, cond.clone());
        }

        let result = self.cont();
        // non-breakpoint stops and error paths must not leak temps
        self.clear_temp_breakpoints()?;
        result
    }

    /// Best-effort installation of a temp breakpoint: duplicates and
    /// unresolvable addresses are skipped.
    fn plant_temp(&mut self, addr: Addr, cond: Option<String>) {
        let tid = self.current_thread;
        match self
            .breakpoints
            .set(&mut *self.driver, &*self.oracle, tid, addr, true, cond)
        {
            Ok(_) => {}
            Err(DebuggerError::BreakpointExists(_))
            | Err(DebuggerError::InvalidAddress(_)) => {}
            Err(e) => warn!("could not plant a temp breakpoint at {addr}: {e}"),
        }
    }

    /// Step until the source line changes, descending into calls.
    pub fn step(&mut self) -> Result<()> {
        self.ensure_not_exited()?;
        let tid = self.current_thread;
        let start = self.oracle.pc_to_line(self.thread(tid)?.pc);
        loop {
            self.step_instruction()?;
            let pc = self.thread(self.current_thread)?.pc;
            let Some(start) = &start else {
                // no line info to compare against; one instruction is
                // the best we can do
                return Ok(());
            };
            match self.oracle.pc_to_line(pc) {
                Some(loc) if loc.file == start.file && loc.line == start.line => continue,
                _ => return Ok(()),
            }
        }
    }

    /// Continue to the first instruction after the prologue of `name`.
    pub fn step_into(&mut self, name: &str) -> Result<StopEvent> {
        self.ensure_not_exited()?;
        let pc = self
            .oracle
            .first_pc_after_prologue(name)
            .ok_or_else(|| DebuggerError::Parse(format!("unknown function: {name}")))?;
        let cond = self
            .goroutine_of(self.current_thread)
            .map(|gid| format!("goroutine == {gid}"));
        self.plant_temp(pc, cond);
        let result = self.cont();
        self.clear_temp_breakpoints()?;
        result
    }

    /// Continue until the current function returns.
    pub fn step_out(&mut self) -> Result<StopEvent> {
        self.ensure_not_exited()?;
        let tid = self.current_thread;
        let pc = self.thread(tid)?.pc;
        if let Some(f) = self.oracle.function_of(pc) {
            if f == "main.main" || f == "main" {
                return Err(DebuggerError::StepOutOfOutermostFrame);
            }
        }
        let ret = self.return_address(tid)?;
        let cond = self
            .goroutine_of(tid)
            .map(|gid| format!("goroutine == {gid}"));
        self.plant_temp(ret, cond);
        let result = self.cont();
        self.clear_temp_breakpoints()?;
        result
    }

    /// Return address of the current frame, read from the saved frame
    /// pointer chain.
    fn return_address(&mut self, tid: Tid) -> Result<Addr> {
        let regs = self.driver.get_regs(tid)?;
        let fp = regs.frame_pointer();
        if fp.is_null() {
            return Err(DebuggerError::StepOutOfOutermostFrame);
        }
        let word = self.read_u64_at(tid, fp + self.arch.ptr_size())?;
        Ok(Addr::from(word))
    }

    /// Stop a running target. A no-op when it is already stopped.
    pub fn halt(&mut self) -> Result<()> {
        self.ensure_not_exited()?;
        if self.status != ProcessStatus::Running {
            return Ok(());
        }
        self.driver.halt()
    }

    /// Detach from the target, optionally killing it. Breakpoints are
    /// removed first unless the target is being killed anyway.
    pub fn detach(mut self, kill: bool) -> Result<()> {
        if self.exited() {
            return Ok(());
        }
        if !kill {
            let tid = self.current_thread;
            self.breakpoints.clear_all(&mut *self.driver, tid)?;
        }
        self.driver.detach(kill)
    }

    // --------------------------------------------------------- breakpoints

    pub fn set_breakpoint(&mut self, addr: Addr) -> Result<&Breakpoint> {
        self.ensure_not_exited()?;
        let tid = self.current_thread;
        self.breakpoints
            .set(&mut *self.driver, &*self.oracle, tid, addr, false, None)
    }

    pub fn set_conditional_breakpoint(
        &mut self,
        addr: Addr,
        cond: String,
    ) -> Result<&Breakpoint> {
        self.ensure_not_exited()?;
        let tid = self.current_thread;
        self.breakpoints.set(
            &mut *self.driver,
            &*self.oracle,
            tid,
            addr,
            false,
            Some(cond),
        )
    }

    /// Set a breakpoint that is consumed by the next stop observing any
    /// breakpoint. The stepping operations are built from these.
    pub fn set_temp_breakpoint(
        &mut self,
        addr: Addr,
        cond: Option<String>,
    ) -> Result<&Breakpoint> {
        self.ensure_not_exited()?;
        let tid = self.current_thread;
        self.breakpoints
            .set(&mut *self.driver, &*self.oracle, tid, addr, true, cond)
    }

    /// Set a breakpoint on a function by name, after its prologue when
    /// the symbol layer knows where that is.
    pub fn set_function_breakpoint(&mut self, name: &str) -> Result<&Breakpoint> {
        let addr = self
            .oracle
            .first_pc_after_prologue(name)
            .or_else(|| self.oracle.function_entry(name))
            .ok_or_else(|| DebuggerError::Parse(format!("unknown function: {name}")))?;
        self.set_breakpoint(addr)
    }

    pub fn clear_breakpoint(&mut self, addr: Addr) -> Result<Breakpoint> {
        self.ensure_not_exited()?;
        let tid = self.current_thread;
        let bp = self.breakpoints.clear(&mut *self.driver, tid, addr)?;
        for th in self.threads.values_mut() {
            if th.current_breakpoint == Some(addr) {
                th.current_breakpoint = None;
            }
        }
        Ok(bp)
    }

    pub fn list_breakpoints(&self) -> Vec<&Breakpoint> {
        self.breakpoints.list().collect()
    }

    pub fn find_breakpoint_by_id(&self, id: u32) -> Option<&Breakpoint> {
        self.breakpoints.find_by_id(id)
    }

    /// The breakpoint a stop at `pc` belongs to, considering the PC
    /// advance of an x86 software trap.
    pub fn find_breakpoint(&self, pc: Addr) -> Option<&Breakpoint> {
        let size = self.arch.breakpoint_size();
        if self.arch.trap_advances_pc() && pc.usize() >= size {
            if let Some(bp) = self.breakpoints.get(pc - size) {
                if !bp.is_hardware() {
                    return Some(bp);
                }
            }
        }
        self.breakpoints.get(pc)
    }

    // ------------------------------------------------------------- threads

    pub fn threads(&self) -> Vec<&Thread> {
        let mut out: Vec<&Thread> = self.threads.values().collect();
        out.sort_by_key(|t| t.tid);
        out
    }

    fn thread(&self, tid: Tid) -> Result<&Thread> {
        self.threads
            .get(&tid)
            .ok_or(DebuggerError::UnknownThread(tid))
    }

    pub fn current_thread(&self) -> Tid {
        self.current_thread
    }

    pub fn switch_thread(&mut self, tid: Tid) -> Result<()> {
        self.ensure_not_exited()?;
        if !self.threads.contains_key(&tid) {
            return Err(DebuggerError::UnknownThread(tid));
        }
        self.current_thread = tid;
        self.selected_goroutine = self.goroutine_of(tid);
        Ok(())
    }

    /// PC of the current thread.
    pub fn pc(&self) -> Result<Addr> {
        Ok(self.thread(self.current_thread)?.pc)
    }

    /// Whether a thread is parked in a kernel wait.
    pub fn thread_blocked(&self, tid: Tid) -> bool {
        self.threads
            .get(&tid)
            .is_some_and(|t| blocked(&*self.oracle, t.pc))
    }

    // ----------------------------------------------------------- registers

    pub fn registers(&mut self) -> Result<Registers> {
        self.ensure_not_exited()?;
        self.driver.get_regs(self.current_thread)
    }

    pub fn set_registers(&mut self, regs: &Registers) -> Result<()> {
        self.ensure_not_exited()?;
        self.driver.set_regs(self.current_thread, regs)
    }

    pub fn register(&mut self, r: Register) -> Result<u64> {
        Ok(self.registers()?.get(r))
    }

    pub fn set_register(&mut self, r: Register, value: u64) -> Result<()> {
        let mut regs = self.registers()?;
        regs.set(r, value);
        if r == Register::rip {
            if let Some(th) = self.threads.get_mut(&self.current_thread) {
                th.pc = Addr::from(value);
            }
        }
        self.set_registers(&regs)
    }

    // -------------------------------------------------------------- memory

    /// Uncached access to target memory through the current thread.
    pub fn memory(&mut self) -> ProcessMemory<'_> {
        ProcessMemory::new(&mut *self.driver, self.current_thread)
    }

    /// Scoped access with a read cache over `[addr, addr+size)`. Meant
    /// for one stack walk or one expression evaluation, then dropped.
    pub fn cached_memory(&mut self, addr: Addr, size: usize) -> TargetMemory<ProcessMemory<'_>> {
        TargetMemory::new(ProcessMemory::new(
            &mut *self.driver,
            self.current_thread,
        ))
        .cached(addr, size)
    }

    pub fn read_memory(&mut self, addr: Addr, n: usize) -> Result<Vec<u8>> {
        self.ensure_not_exited()?;
        self.memory().read(addr, n)
    }

    pub fn write_memory(&mut self, addr: Addr, data: &[u8]) -> Result<usize> {
        self.ensure_not_exited()?;
        self.memory().write(addr, data)
    }

    fn read_u64_at(&mut self, tid: Tid, addr: Addr) -> Result<u64> {
        let bytes = self.driver.read_memory(tid, addr, 8)?;
        Ok(u64::from_le_bytes(bytes.as_slice().try_into().map_err(
            |_| DebuggerError::OutOfBounds { addr, len: 8 },
        )?))
    }

    /// Memory map of the target, from the OS.
    pub fn process_map(&self) -> Result<ProcessMemoryMap> {
        Ok(proc_maps::get_process_maps(self.pid as proc_maps::Pid)?.into())
    }

    // ---------------------------------------------------------- goroutines

    /// Goroutine currently hosted by a thread, read through the TLS slot
    /// the runtime keeps its `g` pointer in (%fs:-8 on linux/amd64).
    fn goroutine_of(&mut self, tid: Tid) -> Option<i64> {
        let layout = self.oracle.goroutine_layout()?;
        let regs = self.driver.get_regs(tid).ok()?;
        if blocked(&*self.oracle, regs.pc()) || regs.fs_base == 0 {
            return None;
        }
        let gptr = self
            .read_u64_at(tid, Addr::from(regs.fs_base - 8))
            .ok()?;
        if gptr == 0 {
            return None;
        }
        let id = self
            .read_u64_at(tid, Addr::from(gptr) + layout.id)
            .ok()?;
        Some(id as i64)
    }

    /// Enumerate the goroutines of the target by walking the runtime's
    /// `allgs` slice. Targets without goroutine bookkeeping yield an
    /// empty list.
    pub fn goroutines(&mut self) -> Result<Vec<Goroutine>> {
        self.ensure_not_exited()?;
        let Some(layout) = self.oracle.goroutine_layout() else {
            return Ok(Vec::new());
        };
        let (Some(len_addr), Some(all_addr)) = (
            self.oracle.global_address("runtime.allglen"),
            self.oracle.global_address("runtime.allgs"),
        ) else {
            return Ok(Vec::new());
        };
        let tid = self.current_thread;
        let ptr_size = self.arch.ptr_size();

        let mut resident: HashMap<i64, Tid> = HashMap::new();
        let tids: Vec<Tid> = self.threads.keys().copied().collect();
        for t in tids {
            if let Some(gid) = self.goroutine_of(t) {
                resident.insert(gid, t);
            }
        }

        let allglen = self.read_u64_at(tid, len_addr)?;
        let allgs = Addr::from(self.read_u64_at(tid, all_addr)?);
        let mut out = Vec::new();
        for i in 0..allglen {
            let gptr = Addr::from(self.read_u64_at(tid, allgs + (i as usize) * ptr_size)?);
            if gptr.is_null() {
                continue;
            }
            let status = self.read_u64_at(tid, gptr + layout.status)?;
            if status == G_DEAD {
                continue;
            }
            let id = self.read_u64_at(tid, gptr + layout.id)? as i64;
            out.push(Goroutine {
                id,
                status,
                pc: Addr::from(self.read_u64_at(tid, gptr + layout.sched_pc)?),
                go_pc: Addr::from(self.read_u64_at(tid, gptr + layout.go_pc)?),
                thread: resident.get(&id).copied(),
            });
        }
        Ok(out)
    }

    pub fn selected_goroutine(&self) -> Option<i64> {
        self.selected_goroutine
    }

    /// Make a goroutine the default for later operations, switching to
    /// its hosting thread when it is resident.
    pub fn switch_goroutine(&mut self, gid: i64) -> Result<()> {
        let gs = self.goroutines()?;
        let g = gs
            .iter()
            .find(|g| g.id == gid)
            .ok_or(DebuggerError::UnknownGoroutine(gid))?;
        if let Some(tid) = g.thread {
            self.current_thread = tid;
        }
        self.selected_goroutine = Some(gid);
        Ok(())
    }

    // -------------------------------------------------------------- replay

    fn replay_session(&mut self) -> Result<&mut ReplaySession> {
        self.replay.as_mut().ok_or(DebuggerError::NotRecorded)
    }

    /// Create a checkpoint at the current point in recorded history.
    pub fn checkpoint(&mut self, note: &str) -> Result<u64> {
        self.replay_session()?.checkpoint(note)
    }

    pub fn checkpoints(&mut self) -> Result<Vec<crate::replay::Checkpoint>> {
        self.replay_session()?.checkpoints()
    }

    pub fn clear_checkpoint(&mut self, id: u64) -> Result<()> {
        self.replay_session()?.clear_checkpoint(id)
    }

    /// Travel to a point in recorded history. Accepts the empty string or
    /// `start`, `end`, `cN`, a decimal bbcount, or `bbcount:0xPC`.
    ///
    /// Unlike a native exit, an exited replay target comes back to life
    /// here: time travel makes "exited" a position, not a terminal state.
    pub fn restart(&mut self, pos: &str) -> Result<()> {
        self.replay_session()?.restart(pos)?;
        self.status = ProcessStatus::Stopped;
        if self.threads.is_empty() {
            self.threads.insert(self.pid, Thread::new(self.pid, false));
            self.current_thread = self.pid;
        }
        self.refresh_thread_pcs();
        Ok(())
    }

    /// Human-readable position in recorded history.
    pub fn when(&mut self) -> Result<String> {
        self.replay_session()?.when()
    }

    pub fn change_direction(&mut self, dir: Direction) -> Result<()> {
        self.ensure_not_exited()?;
        self.replay_session()?.change_direction(dir)
    }

    pub fn direction(&mut self) -> Result<Direction> {
        Ok(self.replay_session()?.direction())
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::driver::SIGTRAP;
    use crate::sym::TableOracle;

    const TID: Tid = 100;
    const BASE: usize = 0x1000;

    fn oracle() -> TableOracle {
        let mut o = TableOracle::new();
        o.add_function(
            "main.main",
            Addr::from(0x1000usize),
            Addr::from(0x1100usize),
            "main.go",
            5,
        );
        o.add_line("main.main", 5, Addr::from(0x1000usize));
        o.add_line("main.main", 6, Addr::from(0x1020usize));
        o.add_line("main.main", 7, Addr::from(0x1040usize));
        o
    }

    fn software_only() -> MockDriver {
        let mut drv = MockDriver::new(TID, BASE, 0x1000);
        drv.hw_supported = false;
        drv
    }

    fn process(drv: MockDriver) -> Process {
        Process::from_parts(Box::new(drv), vec![TID], Arc::new(oracle()), None)
    }

    fn trap(tid: Tid) -> StopEvent {
        StopEvent {
            tid,
            kind: StopKind::Trap,
            signal: SIGTRAP,
        }
    }

    #[test]
    fn test_set_hit_clear_then_exit() {
        let mut drv = software_only();
        // the trap byte has executed, so the reported PC is one past the
        // breakpoint; after clearing, the program runs to completion
        drv.push_stop_at(trap(TID), 0x1001);
        drv.push_stop(StopEvent {
            tid: TID,
            kind: StopKind::Exit { status: 0 },
            signal: 0,
        });
        let mut p = process(drv);

        let bp = p.set_function_breakpoint("main.main").unwrap();
        assert_eq!(bp.id, 1);
        assert_eq!(bp.addr, Addr::from(0x1000usize));

        let ev = p.cont().unwrap();
        assert_eq!(ev.kind, StopKind::Trap);
        assert_eq!(p.pc().unwrap(), Addr::from(0x1000usize));
        let hit = p.find_breakpoint(p.pc().unwrap()).unwrap();
        assert_eq!(hit.total_hit_count, 1);

        p.clear_breakpoint(Addr::from(0x1000usize)).unwrap();
        assert!(p.list_breakpoints().is_empty());

        match p.cont() {
            Err(DebuggerError::ProcessExited { status: 0, .. }) => {}
            other => panic!("expected ProcessExited(0), got {other:?}"),
        }
        assert!(p.exited());
    }

    #[test]
    fn test_exit_is_sticky() {
        let mut drv = software_only();
        drv.push_stop(StopEvent {
            tid: TID,
            kind: StopKind::Exit { status: 3 },
            signal: 0,
        });
        let mut p = process(drv);

        assert!(p.cont().is_err());
        assert_eq!(p.status(), ProcessStatus::Exited(3));
        // the script is empty: a second cont must short-circuit before
        // ever reaching the driver
        match p.cont() {
            Err(DebuggerError::ProcessExited { status: 3, .. }) => {}
            other => panic!("expected sticky ProcessExited, got {other:?}"),
        }
    }

    #[test]
    fn test_temp_breakpoint_consumed_by_stop() {
        let mut drv = software_only();
        drv.push_stop_at(trap(TID), 0x1021);
        let mut p = process(drv);

        p.set_breakpoint(Addr::from(0x1000usize)).unwrap();
        p.set_temp_breakpoint(Addr::from(0x1020usize), None).unwrap();
        assert_eq!(p.list_breakpoints().len(), 2);

        p.cont().unwrap();
        let left = p.list_breakpoints();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].addr, Addr::from(0x1000usize));
        // the temp's original byte is back
        assert_eq!(p.read_memory(Addr::from(0x1020usize), 1).unwrap(), vec![0x90]);
        assert_eq!(p.pc().unwrap(), Addr::from(0x1020usize));
        // no dangling back-reference to the cleared temp
        assert!(p.threads()[0].current_breakpoint.is_none());
    }

    #[test]
    fn test_step_over_reinstalls_trap() {
        let mut drv = software_only();
        drv.push_stop_at(trap(TID), 0x1001);
        drv.push_stop_at(trap(TID), 0x1041);
        let mut p = process(drv);

        p.set_breakpoint(Addr::from(0x1000usize)).unwrap();
        p.set_breakpoint(Addr::from(0x1040usize)).unwrap();

        p.cont().unwrap();
        assert_eq!(p.pc().unwrap(), Addr::from(0x1000usize));
        assert_eq!(p.read_memory(Addr::from(0x1000usize), 1).unwrap(), vec![0xcc]);

        // the second cont steps over the first breakpoint (byte out,
        // step, byte back in) before resuming
        p.cont().unwrap();
        assert_eq!(p.pc().unwrap(), Addr::from(0x1040usize));
        assert_eq!(p.read_memory(Addr::from(0x1000usize), 1).unwrap(), vec![0xcc]);
        assert_eq!(
            p.find_breakpoint(Addr::from(0x1041usize)).unwrap().total_hit_count,
            1
        );
    }

    #[test]
    fn test_clone_is_transparent() {
        let mut drv = software_only();
        drv.push_stop(StopEvent {
            tid: TID,
            kind: StopKind::Clone { child: 101 },
            signal: SIGTRAP,
        });
        drv.push_stop(trap(101));
        let mut p = process(drv);

        p.cont().unwrap();
        let threads = p.threads();
        assert_eq!(threads.len(), 2);
        // the leader kept running; the new thread took the trap
        assert!(threads.iter().any(|t| t.tid == TID && t.running));
        assert!(threads.iter().any(|t| t.tid == 101 && !t.running));
        assert_eq!(p.current_thread(), 101);
    }

    #[test]
    fn test_thread_exit_reconciles_table() {
        let mut drv = software_only();
        drv.threads.push(101);
        drv.regs.insert(101, Registers::default());
        drv.push_stop(StopEvent {
            tid: 101,
            kind: StopKind::ExitThread { code: 0 },
            signal: 0,
        });
        drv.push_stop_at(trap(TID), 0x1050);
        let mut p = Process::from_parts(
            Box::new(drv),
            vec![TID, 101],
            Arc::new(oracle()),
            None,
        );

        p.cont().unwrap();
        assert_eq!(p.threads().len(), 1);
        assert_eq!(p.threads()[0].tid, TID);
    }

    #[test]
    fn test_next_plants_and_clears_temps() {
        let mut drv = software_only();
        drv.set_pc(TID, Addr::from(0x1000usize));
        // fake frame: rbp points into the stack area, [rbp+8] holds a
        // return address inside main.main
        let rbp = 0x1800usize;
        drv.regs.get_mut(&TID).unwrap().rbp = rbp as u64;
        drv.mem[rbp - BASE + 8..rbp - BASE + 16]
            .copy_from_slice(&0x1050u64.to_le_bytes());
        drv.push_stop_at(trap(TID), 0x1021);
        let mut p = process(drv);

        // temps land on the line successors 0x1020 and 0x1040 and on the
        // return address 0x1050; the run stops on the first of them
        p.next().unwrap();
        assert_eq!(p.pc().unwrap(), Addr::from(0x1020usize));
        assert!(p.list_breakpoints().is_empty());
        for off in [0x20usize, 0x40, 0x50] {
            let b = p.read_memory(Addr::from(BASE + off), 1).unwrap();
            assert_eq!(b, vec![0x90], "byte at offset {off:#x} not restored");
        }
    }

    #[test]
    fn test_next_while_nexting_rejected() {
        let drv = software_only();
        let mut p = process(drv);
        p.set_temp_breakpoint(Addr::from(0x1040usize), None).unwrap();
        assert!(matches!(p.next(), Err(DebuggerError::NextWhileNexting)));
    }

    #[test]
    fn test_halt_on_stopped_process_is_noop() {
        let drv = software_only();
        let mut p = process(drv);
        assert_eq!(p.status(), ProcessStatus::Stopped);
        p.halt().unwrap();
        p.halt().unwrap();
    }

    #[test]
    fn test_switch_thread_validates() {
        let drv = software_only();
        let mut p = process(drv);
        assert!(matches!(
            p.switch_thread(999),
            Err(DebuggerError::UnknownThread(999))
        ));
        p.switch_thread(TID).unwrap();
        assert_eq!(p.current_thread(), TID);
    }

    #[test]
    fn test_find_breakpoint_checks_trap_advance() {
        let drv = software_only();
        let mut p = process(drv);
        p.set_breakpoint(Addr::from(0x1020usize)).unwrap();
        assert!(p.find_breakpoint(Addr::from(0x1020usize)).is_some());
        assert!(p.find_breakpoint(Addr::from(0x1021usize)).is_some());
        assert!(p.find_breakpoint(Addr::from(0x1022usize)).is_none());
    }

    #[test]
    fn test_goroutines_without_layout_is_empty() {
        let drv = software_only();
        let mut p = process(drv);
        assert!(p.goroutines().unwrap().is_empty());
    }

    #[test]
    fn test_checkpoint_requires_recording() {
        let drv = software_only();
        let mut p = process(drv);
        assert!(matches!(
            p.checkpoint("before the bug"),
            Err(DebuggerError::NotRecorded)
        ));
        assert!(matches!(p.when(), Err(DebuggerError::NotRecorded)));
    }
}
