//! Native Linux driver, built on ptrace.
//!
//! Every ptrace request is routed through the [`PtraceLane`] the driver
//! was created with; see that module for why. `waitpid` runs on the
//! calling thread.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execv, fork, ForkResult, Pid};
use tracing::{debug, trace, warn};

use super::{Driver, StopEvent, StopKind, Tid, SIGTRAP};
use crate::addr::Addr;
use crate::errors::{DebuggerError, Result};
use crate::lane::PtraceLane;
use crate::regs::Registers;

/// How long to sleep between `WNOHANG` polls of the wait loop.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

const WORD_SIZE: usize = std::mem::size_of::<libc::c_long>();

// SIGTRAP si_code values, from include/uapi/asm-generic/siginfo.h. They are
// buried in the libc headers and not exposed by the nix bindings.
/// Trap raised by the kernel itself (INT3 lands here on x86).
pub const SI_KERNEL: i32 = 0x80;
/// Process breakpoint.
pub const TRAP_BRKPT: i32 = 0x1;
/// Trace trap (single stepping).
pub const TRAP_TRACE: i32 = 0x2;
/// Hardware breakpoint or watchpoint.
pub const TRAP_HWBKPT: i32 = 0x4;

// Debug register layout within the ptrace user area on x86-64:
// offsetof(struct user, u_debugreg).
const U_DEBUGREG_OFFSET: u64 = 848;

const DR_RW_EXECUTE: u64 = 0x0;
const DR_LEN_1: u64 = 0x0 << 2;
const DR_ENABLE_SIZE: usize = 2;
const DR_CONTROL_SIZE: usize = 4;
const DR_CONTROL_SHIFT: usize = 16;

fn dr_offset(reg: usize) -> u64 {
    U_DEBUGREG_OFFSET + (reg as u64) * 8
}

/// DR7 bits owned by one slot: its 2-bit enable field and its 4-bit
/// control field.
fn dr7_slot_mask(slot: usize) -> u64 {
    (((1u64 << DR_CONTROL_SIZE) - 1) << (DR_CONTROL_SHIFT + slot * DR_CONTROL_SIZE))
        | (((1u64 << DR_ENABLE_SIZE) - 1) << (slot * DR_ENABLE_SIZE))
}

/// Stdio redirection paths for a launched debuggee.
#[derive(Debug, Clone, Default)]
pub struct Redirects {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// Driver for a native Linux target.
pub struct LinuxDriver {
    pid: Tid,
    lane: Arc<PtraceLane>,
}

impl LinuxDriver {
    /// Attach to a running process, stop it, and bring every existing
    /// thread of it under trace. Returns the driver and the thread ids
    /// found at attach time.
    pub fn attach(pid: i32, lane: Arc<PtraceLane>) -> Result<(Self, Vec<Tid>)> {
        let leader = Pid::from_raw(pid);
        lane.exec(move || ptrace::attach(leader))
            .map_err(|e| match e {
                // EPERM covers both policy denials and an existing tracer
                Errno::EPERM if tracer_pid(pid).unwrap_or(0) != 0 => {
                    DebuggerError::AlreadyTraced(pid)
                }
                Errno::EPERM => DebuggerError::PermissionDenied(pid),
                Errno::ESRCH => DebuggerError::ProcessNotFound(pid),
                other => DebuggerError::Os(other),
            })?;

        let mut driver = Self { pid, lane };
        driver.wait_for_stop(pid)?;

        let tids = driver.list_threads()?;
        for &tid in &tids {
            if tid != pid {
                driver.attach_existing(tid)?;
            }
            driver.register_thread(tid)?;
        }
        debug!("attached to {pid} with {} thread(s)", tids.len());
        Ok((driver, tids))
    }

    /// Fork and exec `path` in ptrace mode, returning after the initial
    /// exec stop.
    pub fn launch(
        path: impl AsRef<Path>,
        args: &[String],
        cwd: Option<&Path>,
        redirects: &Redirects,
        lane: Arc<PtraceLane>,
    ) -> Result<(Self, Vec<Tid>)> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DebuggerError::ExecutableDoesNotExist(
                path.to_string_lossy().to_string(),
            ));
        }
        if !path.is_file() {
            return Err(DebuggerError::ExecutableIsNotAFile(
                path.to_string_lossy().to_string(),
            ));
        }

        let cpath = CString::new(path.to_string_lossy().as_bytes())?;
        let mut cargs = vec![cpath.clone()];
        for arg in args {
            cargs.push(CString::new(arg.as_str())?);
        }
        let cwd = cwd.map(Path::to_path_buf);
        let redirects = redirects.clone();

        // The fork runs on the lane so the child is a child of the lane
        // thread and all later ptrace requests originate from it.
        let child = lane.exec(move || -> Result<Pid> {
            match unsafe { fork() }? {
                ForkResult::Parent { child } => Ok(child),
                ForkResult::Child => {
                    if let Err(e) = exec_in_child(&cpath, &cargs, cwd.as_deref(), &redirects) {
                        eprintln!("could not start debuggee: {e}");
                        unsafe { libc::_exit(127) }
                    }
                    unreachable!()
                }
            }
        })?;

        let pid = child.as_raw();
        let mut driver = Self { pid, lane };
        driver.wait_for_stop(pid)?;
        driver.register_thread(pid)?;
        debug!("launched {} as pid {pid}", path.display());
        Ok((driver, vec![pid]))
    }

    /// Block until `tid` reports its next stop.
    fn wait_for_stop(&mut self, tid: Tid) -> Result<()> {
        let status = waitpid(Pid::from_raw(tid), Some(WaitPidFlag::__WALL))?;
        trace!("initial stop of {tid}: {status:?}");
        if let WaitStatus::Exited(_, code) = status {
            return Err(DebuggerError::ProcessExited {
                pid: self.pid,
                status: code,
            });
        }
        Ok(())
    }

    /// Attach to a thread discovered at attach time. `EPERM` is tolerated:
    /// the thread may already be traced through the clone-trace option of
    /// its parent.
    fn attach_existing(&mut self, tid: Tid) -> Result<()> {
        let pid = Pid::from_raw(tid);
        match self.lane.exec(move || ptrace::attach(pid)) {
            Ok(()) => self.wait_for_stop(tid),
            Err(Errno::EPERM) => Ok(()),
            Err(e) => Err(DebuggerError::Os(e)),
        }
    }

    fn set_trace_options(&self, tid: Tid) -> std::result::Result<(), Errno> {
        let pid = Pid::from_raw(tid);
        self.lane
            .exec(move || ptrace::setoptions(pid, ptrace::Options::PTRACE_O_TRACECLONE))
    }

    fn classify(&mut self, status: WaitStatus) -> Result<Option<StopEvent>> {
        let ev = match status {
            WaitStatus::Stopped(pid, sig) => {
                let kind = if sig == Signal::SIGTRAP {
                    if let Ok(si) = self.lane.exec(move || ptrace::getsiginfo(pid)) {
                        match si.si_code {
                            SI_KERNEL => trace!("SI_KERNEL trap"),
                            TRAP_BRKPT => trace!("TRAP_BRKPT"),
                            TRAP_TRACE => trace!("TRAP_TRACE"),
                            TRAP_HWBKPT => trace!("TRAP_HWBKPT"),
                            code => warn!("strange SIGTRAP code: {code}"),
                        }
                    }
                    StopKind::Trap
                } else {
                    StopKind::Signal
                };
                StopEvent {
                    tid: pid.as_raw(),
                    kind,
                    signal: sig as i32 as u8,
                }
            }
            WaitStatus::PtraceEvent(pid, _, event) if event == libc::PTRACE_EVENT_CLONE => {
                let child = self.lane.exec(move || ptrace::getevent(pid))? as Tid;
                StopEvent {
                    tid: pid.as_raw(),
                    kind: StopKind::Clone { child },
                    signal: SIGTRAP,
                }
            }
            WaitStatus::PtraceEvent(pid, _, _) => StopEvent {
                tid: pid.as_raw(),
                kind: StopKind::Trap,
                signal: SIGTRAP,
            },
            WaitStatus::Exited(pid, code) => {
                let tid = pid.as_raw();
                let kind = if tid == self.pid {
                    StopKind::Exit { status: code }
                } else {
                    StopKind::ExitThread { code }
                };
                StopEvent {
                    tid,
                    kind,
                    signal: 0,
                }
            }
            WaitStatus::Signaled(pid, sig, _) => {
                let tid = pid.as_raw();
                let status = -(sig as i32);
                let kind = if tid == self.pid {
                    StopKind::Exit { status }
                } else {
                    StopKind::ExitThread { code: status }
                };
                StopEvent {
                    tid,
                    kind,
                    signal: sig as i32 as u8,
                }
            }
            WaitStatus::StillAlive => return Ok(None),
            other => {
                warn!("unexpected wait status: {other:?}");
                return Ok(None);
            }
        };
        Ok(Some(ev))
    }
}

impl Driver for LinuxDriver {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn list_threads(&mut self) -> Result<Vec<Tid>> {
        let mut tids = Vec::new();
        for entry in std::fs::read_dir(format!("/proc/{}/task", self.pid))? {
            let entry = entry?;
            if let Ok(tid) = entry.file_name().to_string_lossy().parse::<Tid>() {
                tids.push(tid);
            }
        }
        tids.sort_unstable();
        Ok(tids)
    }

    fn wait(&mut self) -> Result<StopEvent> {
        // Waiting on the group leader with default flags hangs forever when
        // the leader has exited but left zombie threads; the kernel
        // considers this intended behaviour (sourceware bugs 12702, 10095).
        // So: poll any child with WNOHANG|__WALL, sleeping between polls,
        // and bail out when the leader shows up as a zombie in /proc.
        loop {
            let status = waitpid(
                Pid::from_raw(-1),
                Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL),
            );
            match status {
                Ok(status) => {
                    if let Some(ev) = self.classify(status)? {
                        return Ok(ev);
                    }
                    // StillAlive: nothing reaped yet
                    if proc_state(self.pid) == 'Z' {
                        trace!("leader {} is a zombie, reaping", self.pid);
                        let reaped = waitpid(
                            Pid::from_raw(self.pid),
                            Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL),
                        );
                        if let Ok(status) = reaped {
                            if let Some(ev) = self.classify(status)? {
                                return Ok(ev);
                            }
                        }
                        return Ok(StopEvent {
                            tid: self.pid,
                            kind: StopKind::Exit { status: 0 },
                            signal: 0,
                        });
                    }
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                }
                Err(Errno::ECHILD) => {
                    return Err(DebuggerError::ProcessExited {
                        pid: self.pid,
                        status: 0,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn wait_thread(&mut self, tid: Tid) -> Result<StopEvent> {
        loop {
            let status = waitpid(
                Pid::from_raw(tid),
                Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL),
            );
            match status {
                Ok(status) => {
                    if let Some(ev) = self.classify(status)? {
                        return Ok(ev);
                    }
                    std::thread::sleep(WAIT_POLL_INTERVAL / 20);
                }
                Err(Errno::ECHILD) => return Err(DebuggerError::ThreadGone(tid)),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn cont(&mut self, tid: Tid, signal: u8) -> Result<()> {
        let pid = Pid::from_raw(tid);
        let sig = if signal == 0 {
            None
        } else {
            Some(Signal::try_from(signal as i32)?)
        };
        match self.lane.exec(move || ptrace::cont(pid, sig)) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(DebuggerError::ThreadGone(tid)),
            Err(e) => Err(e.into()),
        }
    }

    fn single_step(&mut self, tid: Tid) -> Result<()> {
        let pid = Pid::from_raw(tid);
        self.lane.exec(move || ptrace::step(pid, None))?;
        Ok(())
    }

    fn halt(&mut self) -> Result<()> {
        kill(Pid::from_raw(self.pid), Signal::SIGTRAP)?;
        Ok(())
    }

    fn register_thread(&mut self, tid: Tid) -> Result<()> {
        match self.set_trace_options(tid) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                // The thread was observed before its first stop; wait for
                // it and try once more.
                waitpid(Pid::from_raw(tid), Some(WaitPidFlag::__WALL))?;
                self.set_trace_options(tid)
                    .map_err(|_| DebuggerError::ThreadGone(tid))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_memory(&mut self, tid: Tid, addr: Addr, n: usize) -> Result<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let pid = Pid::from_raw(tid);
        self.lane.exec(move || -> Result<Vec<u8>> {
            let mut out = Vec::with_capacity(n + WORD_SIZE);
            let mut cur = addr;
            while out.len() < n {
                let word = ptrace::read(pid, cur.raw_pointer())
                    .map_err(|e| memory_error(e, addr, n))?;
                out.extend_from_slice(&word.to_ne_bytes());
                cur += WORD_SIZE;
            }
            out.truncate(n);
            Ok(out)
        })
    }

    fn write_memory(&mut self, tid: Tid, addr: Addr, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let pid = Pid::from_raw(tid);
        let data = data.to_vec();
        let len = data.len();
        self.lane.exec(move || -> Result<usize> {
            let mut written = 0;
            while written < len {
                let cur = addr + written;
                let remaining = len - written;
                let word = if remaining >= WORD_SIZE {
                    libc::c_long::from_ne_bytes(
                        data[written..written + WORD_SIZE].try_into().unwrap(),
                    )
                } else {
                    // Partial trailing word: merge with the existing bytes.
                    let existing = ptrace::read(pid, cur.raw_pointer())
                        .map_err(|e| memory_error(e, addr, len))?;
                    let mut bytes = existing.to_ne_bytes();
                    bytes[..remaining].copy_from_slice(&data[written..]);
                    libc::c_long::from_ne_bytes(bytes)
                };
                ptrace::write(pid, cur.raw_pointer(), word)
                    .map_err(|e| memory_error(e, addr, len))?;
                written += remaining.min(WORD_SIZE);
            }
            Ok(len)
        })
    }

    fn get_regs(&mut self, tid: Tid) -> Result<Registers> {
        let pid = Pid::from_raw(tid);
        let regs = self
            .lane
            .exec(move || ptrace::getregs(pid))
            .map_err(|e| match e {
                Errno::ESRCH => DebuggerError::ThreadGone(tid),
                other => DebuggerError::Os(other),
            })?;
        Ok(Registers::from(regs))
    }

    fn set_regs(&mut self, tid: Tid, regs: &Registers) -> Result<()> {
        let pid = Pid::from_raw(tid);
        let raw: libc::user_regs_struct = (*regs).into();
        self.lane.exec(move || ptrace::setregs(pid, raw))?;
        Ok(())
    }

    fn peek_user(&mut self, tid: Tid, offset: u64) -> Result<u64> {
        let pid = Pid::from_raw(tid);
        let word = self
            .lane
            .exec(move || ptrace::read_user(pid, offset as usize as ptrace::AddressType))?;
        Ok(word as u64)
    }

    fn poke_user(&mut self, tid: Tid, offset: u64, word: u64) -> Result<()> {
        let pid = Pid::from_raw(tid);
        self.lane.exec(move || {
            ptrace::write_user(pid, offset as usize as ptrace::AddressType, word as libc::c_long)
        })?;
        Ok(())
    }

    fn set_hw_breakpoint(&mut self, tid: Tid, slot: usize, addr: Addr) -> Result<()> {
        debug_assert!(slot < 4);
        let mut dr7 = self.peek_user(tid, dr_offset(7))?;
        if dr7 & (((1u64 << DR_ENABLE_SIZE) - 1) << (slot * DR_ENABLE_SIZE)) != 0 {
            return Err(DebuggerError::OutOfSlots);
        }
        self.poke_user(tid, dr_offset(slot), addr.u64())?;
        dr7 &= !dr7_slot_mask(slot);
        dr7 |= (DR_RW_EXECUTE | DR_LEN_1) << (DR_CONTROL_SHIFT + slot * DR_CONTROL_SIZE);
        dr7 |= 1u64 << (slot * DR_ENABLE_SIZE);
        self.poke_user(tid, dr_offset(7), dr7)
    }

    fn clear_hw_breakpoint(&mut self, tid: Tid, slot: usize) -> Result<()> {
        debug_assert!(slot < 4);
        let mut dr7 = self.peek_user(tid, dr_offset(7))?;
        dr7 &= !dr7_slot_mask(slot);
        self.poke_user(tid, dr_offset(7), dr7)?;
        self.poke_user(tid, dr_offset(slot), 0)
    }

    fn detach(&mut self, kill_target: bool) -> Result<()> {
        let tids = self.list_threads().unwrap_or_else(|_| vec![self.pid]);
        for tid in tids {
            let pid = Pid::from_raw(tid);
            if let Err(e) = self.lane.exec(move || ptrace::detach(pid, None)) {
                warn!("could not detach from thread {tid}: {e}");
            }
        }
        if kill_target {
            // the whole process group, debuggees are launched with setpgid
            let _ = kill(Pid::from_raw(-self.pid), Signal::SIGKILL);
        }
        Ok(())
    }
}

/// Child half of the launch fork. Runs between `fork` and `execv`, so
/// only async-signal-safe calls are allowed; libc is used directly.
fn exec_in_child(
    path: &CString,
    args: &[CString],
    cwd: Option<&Path>,
    redirects: &Redirects,
) -> Result<()> {
    ptrace::traceme()?;
    unsafe { libc::setpgid(0, 0) };
    if let Some(dir) = cwd {
        nix::unistd::chdir(dir)?;
    }
    redirect_fd(&redirects.stdin, libc::STDIN_FILENO, libc::O_RDONLY)?;
    redirect_fd(
        &redirects.stdout,
        libc::STDOUT_FILENO,
        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
    )?;
    redirect_fd(
        &redirects.stderr,
        libc::STDERR_FILENO,
        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
    )?;
    execv(path, args)?;
    unreachable!()
}

fn redirect_fd(path: &Option<PathBuf>, target: libc::c_int, flags: libc::c_int) -> Result<()> {
    let Some(path) = path else { return Ok(()) };
    let cpath = CString::new(path.to_string_lossy().as_bytes())?;
    let fd = unsafe { libc::open(cpath.as_ptr(), flags, 0o644) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if unsafe { libc::dup2(fd, target) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    unsafe { libc::close(fd) };
    Ok(())
}

fn memory_error(e: Errno, addr: Addr, len: usize) -> DebuggerError {
    match e {
        Errno::EFAULT | Errno::EIO => DebuggerError::OutOfBounds { addr, len },
        Errno::EPERM | Errno::EACCES => DebuggerError::Protected(addr),
        other => DebuggerError::Os(other),
    }
}

/// Pid of the tracer already attached to `pid`, from
/// `/proc/<pid>/status`. Zero means untraced.
fn tracer_pid(pid: i32) -> Option<i32> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|rest| rest.trim().parse().ok())
}

/// State character of a process from `/proc/<pid>/stat`, or `'\0'` when it
/// cannot be read. The comm field may contain spaces and parentheses, so
/// the state is found after the *last* closing parenthesis.
fn proc_state(pid: i32) -> char {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return '\0';
    };
    let Some(end) = stat.rfind(')') else {
        return '\0';
    };
    stat[end + 1..]
        .chars()
        .find(|c| !c.is_whitespace())
        .unwrap_or('\0')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dr7_bit_layout() {
        // slot 0: enable bit 0, control field at bit 16
        assert_eq!(dr7_slot_mask(0), 0xf_0003);
        // slot 3: enable bit 6, control field at bit 28
        assert_eq!(dr7_slot_mask(3), 0xf000_00c0);

        let mut dr7 = 0u64;
        dr7 |= (DR_RW_EXECUTE | DR_LEN_1) << (DR_CONTROL_SHIFT + 2 * DR_CONTROL_SIZE);
        dr7 |= 1u64 << (2 * DR_ENABLE_SIZE);
        assert_eq!(dr7, 0b1_0000); // execute/len1 encode as zero, enable bit 4
    }

    #[test]
    fn test_debug_register_offsets() {
        assert_eq!(dr_offset(0), 848);
        assert_eq!(dr_offset(7), 848 + 56);
    }

    #[test]
    fn test_proc_state_of_ourselves() {
        let state = proc_state(std::process::id() as i32);
        // we are certainly running
        assert!(state == 'R' || state == 'S');
    }
}
