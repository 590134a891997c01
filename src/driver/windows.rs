//! Native Windows driver, built on the Win32 debug API.
//!
//! `WaitForDebugEvent` implicitly suspends every thread of the target, so
//! the whole controller operates on a stopped process between events and
//! [`Driver::halt`] is a no-op whenever the target is already at a debug
//! event. Single-stepping arms the step: it sets the TF flag in the thread
//! context, suspends all other threads and continues the pending event;
//! the step exception (or an exit caused by the stepped instruction) is
//! then observed by the next [`Driver::wait_thread`], which resumes the
//! suspended threads and clears TF before handing the event on.

use std::collections::HashMap;

use tracing::{debug, warn};
use windows::Win32::Foundation::{CloseHandle, HANDLE, NTSTATUS};
use windows::Win32::System::Diagnostics::Debug::{
    ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, DebugBreakProcess,
    GetThreadContext, ReadProcessMemory, SetThreadContext, WaitForDebugEvent, CONTEXT,
    CONTEXT_ALL_AMD64, CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT,
    EXCEPTION_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT,
    LOAD_DLL_DEBUG_EVENT, UNLOAD_DLL_DEBUG_EVENT, WriteProcessMemory,
};
use windows::Win32::System::Threading::{
    CreateProcessW, ResumeThread, SuspendThread, TerminateProcess, CREATE_NEW_PROCESS_GROUP,
    DEBUG_ONLY_THIS_PROCESS, INFINITE, PROCESS_INFORMATION, STARTUPINFOW,
};

use super::{Driver, StopEvent, StopKind, Tid, SIGTRAP};
use crate::addr::Addr;
use crate::errors::{DebuggerError, Result};
use crate::regs::Registers;

const DBG_CONTINUE: NTSTATUS = NTSTATUS(0x0001_0002);
const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
const TRAP_FLAG: u32 = 0x100;

/// The CONTEXT structure must be 16-byte aligned on x64 or
/// `GetThreadContext` fails with `ERROR_NOACCESS`.
#[repr(align(16))]
#[derive(Default, Clone, Copy)]
struct AlignedContext(CONTEXT);

/// Driver for a native Windows target.
pub struct WindowsDriver {
    pid: Tid,
    process: HANDLE,
    threads: HashMap<Tid, HANDLE>,
    /// The debug event we are currently stopped at, if any.
    pending: Option<(u32, u32)>,
    /// An armed single-step: the stepped thread and the threads that were
    /// suspended for it. Unwound when the step's event is observed.
    stepping: Option<(Tid, Vec<Tid>)>,
}

impl WindowsDriver {
    pub fn attach(pid: i32) -> Result<(Self, Vec<Tid>)> {
        unsafe { DebugActiveProcess(pid as u32) }
            .map_err(|_| DebuggerError::PermissionDenied(pid))?;
        let mut driver = Self {
            pid,
            process: HANDLE::default(),
            threads: HashMap::new(),
            pending: None,
            stepping: None,
        };
        // the CREATE_PROCESS event delivers the process and thread handles
        driver.wait()?;
        let tids = driver.threads.keys().copied().collect();
        Ok((driver, tids))
    }

    pub fn launch(cmdline: &str) -> Result<(Self, Vec<Tid>)> {
        let mut cmd: Vec<u16> = cmdline.encode_utf16().chain(std::iter::once(0)).collect();
        let startup = STARTUPINFOW::default();
        let mut info = PROCESS_INFORMATION::default();
        unsafe {
            CreateProcessW(
                None,
                Some(windows::core::PWSTR(cmd.as_mut_ptr())),
                None,
                None,
                false,
                DEBUG_ONLY_THIS_PROCESS | CREATE_NEW_PROCESS_GROUP,
                None,
                None,
                &startup,
                &mut info,
            )
        }
        .map_err(|e| DebuggerError::Io(std::io::Error::other(e.to_string())))?;

        let mut driver = Self {
            pid: info.dwProcessId as Tid,
            process: HANDLE::default(),
            threads: HashMap::new(),
            pending: None,
            stepping: None,
        };
        driver.wait()?;
        let tids = driver.threads.keys().copied().collect();
        debug!("launched {cmdline:?} as pid {}", driver.pid);
        Ok((driver, tids))
    }

    fn thread_handle(&self, tid: Tid) -> Result<HANDLE> {
        self.threads
            .get(&tid)
            .copied()
            .ok_or(DebuggerError::UnknownThread(tid))
    }

    fn context(&self, tid: Tid) -> Result<AlignedContext> {
        let handle = self.thread_handle(tid)?;
        let mut ctx = AlignedContext::default();
        ctx.0.ContextFlags = CONTEXT_ALL_AMD64;
        unsafe { GetThreadContext(handle, &mut ctx.0) }
            .map_err(|e| DebuggerError::Io(std::io::Error::other(e.to_string())))?;
        Ok(ctx)
    }

    fn set_context(&self, tid: Tid, ctx: &AlignedContext) -> Result<()> {
        let handle = self.thread_handle(tid)?;
        unsafe { SetThreadContext(handle, &ctx.0) }
            .map_err(|e| DebuggerError::Io(std::io::Error::other(e.to_string())))?;
        Ok(())
    }

    /// Resume the pending debug event, if one is outstanding.
    fn continue_pending(&mut self) -> Result<()> {
        if let Some((pid, tid)) = self.pending.take() {
            unsafe { ContinueDebugEvent(pid, tid, DBG_CONTINUE) }
                .map_err(|e| DebuggerError::Io(std::io::Error::other(e.to_string())))?;
        }
        Ok(())
    }

    /// Unwind an armed single-step: resume the threads that were
    /// suspended for it and clear the TF flag. The stepped thread may be
    /// gone by now if the step exited it.
    fn finish_step(&mut self) {
        let Some((tid, others)) = self.stepping.take() else {
            return;
        };
        for other in others {
            if let Ok(handle) = self.thread_handle(other) {
                unsafe { ResumeThread(handle) };
            }
        }
        if let Ok(mut ctx) = self.context(tid) {
            ctx.0.EFlags &= !TRAP_FLAG;
            let _ = self.set_context(tid, &ctx);
        }
    }
}

impl Driver for WindowsDriver {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn list_threads(&mut self) -> Result<Vec<Tid>> {
        Ok(self.threads.keys().copied().collect())
    }

    fn wait(&mut self) -> Result<StopEvent> {
        loop {
            let mut event = DEBUG_EVENT::default();
            unsafe { WaitForDebugEvent(&mut event, INFINITE) }.map_err(|_| {
                DebuggerError::ProcessExited {
                    pid: self.pid,
                    status: 0,
                }
            })?;
            let tid = event.dwThreadId as Tid;
            self.pending = Some((event.dwProcessId, event.dwThreadId));

            match event.dwDebugEventCode {
                CREATE_PROCESS_DEBUG_EVENT => {
                    let info = unsafe { event.u.CreateProcessInfo };
                    self.pid = event.dwProcessId as Tid;
                    self.process = info.hProcess;
                    self.threads.insert(tid, info.hThread);
                    return Ok(StopEvent {
                        tid,
                        kind: StopKind::Trap,
                        signal: SIGTRAP,
                    });
                }
                CREATE_THREAD_DEBUG_EVENT => {
                    let info = unsafe { event.u.CreateThread };
                    self.threads.insert(tid, info.hThread);
                    return Ok(StopEvent {
                        tid,
                        kind: StopKind::Clone { child: tid },
                        signal: SIGTRAP,
                    });
                }
                EXIT_THREAD_DEBUG_EVENT => {
                    let code = unsafe { event.u.ExitThread }.dwExitCode as i32;
                    self.threads.remove(&tid);
                    return Ok(StopEvent {
                        tid,
                        kind: StopKind::ExitThread { code },
                        signal: 0,
                    });
                }
                EXIT_PROCESS_DEBUG_EVENT => {
                    let status = unsafe { event.u.ExitProcess }.dwExitCode as i32;
                    return Ok(StopEvent {
                        tid,
                        kind: StopKind::Exit { status },
                        signal: 0,
                    });
                }
                EXCEPTION_DEBUG_EVENT => {
                    let record = unsafe { event.u.Exception }.ExceptionRecord;
                    let code = record.ExceptionCode.0 as u32;
                    let kind = match code {
                        EXCEPTION_BREAKPOINT | EXCEPTION_SINGLE_STEP => StopKind::Trap,
                        _ => StopKind::Signal,
                    };
                    return Ok(StopEvent {
                        tid,
                        kind,
                        signal: SIGTRAP,
                    });
                }
                LOAD_DLL_DEBUG_EVENT | UNLOAD_DLL_DEBUG_EVENT => {
                    // not surfaced; resume and keep pumping
                    self.continue_pending()?;
                }
                other => {
                    warn!("unhandled debug event code {other:?}");
                    self.continue_pending()?;
                }
            }
        }
    }

    fn wait_thread(&mut self, _tid: Tid) -> Result<StopEvent> {
        // With every other thread suspended by single_step, the next
        // event is the stepped thread's: its step exception, or the
        // exit the stepped instruction caused. Either way the event is
        // handed to the controller.
        let ev = self.wait();
        self.finish_step();
        ev
    }

    fn cont(&mut self, _tid: Tid, _signal: u8) -> Result<()> {
        // ContinueDebugEvent resumes the whole target; per-thread resume
        // requests collapse into continuing the pending event once.
        self.continue_pending()
    }

    /// Arm a single step: set the TF flag, suspend every other thread,
    /// and resume the pending event. The step's exception (or exit) is
    /// observed by the following [`Driver::wait_thread`], which also
    /// unwinds the suspension and the flag.
    fn single_step(&mut self, tid: Tid) -> Result<()> {
        let mut ctx = self.context(tid)?;
        ctx.0.EFlags |= TRAP_FLAG;
        self.set_context(tid, &ctx)?;

        let others: Vec<Tid> = self.threads.keys().copied().filter(|&t| t != tid).collect();
        for &other in &others {
            let handle = self.thread_handle(other)?;
            unsafe { SuspendThread(handle) };
        }
        self.stepping = Some((tid, others));

        self.continue_pending()
    }

    fn halt(&mut self) -> Result<()> {
        // Already stopped whenever a debug event is pending; otherwise
        // break in remotely.
        if self.pending.is_none() {
            unsafe { DebugBreakProcess(self.process) }
                .map_err(|e| DebuggerError::Io(std::io::Error::other(e.to_string())))?;
        }
        Ok(())
    }

    fn register_thread(&mut self, _tid: Tid) -> Result<()> {
        // thread handles arrive with their CREATE_THREAD event
        Ok(())
    }

    fn read_memory(&mut self, _tid: Tid, addr: Addr, n: usize) -> Result<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; n];
        let mut count = 0usize;
        unsafe {
            ReadProcessMemory(
                self.process,
                addr.raw_pointer(),
                buf.as_mut_ptr().cast(),
                n,
                Some(&mut count),
            )
        }
        .map_err(|_| DebuggerError::OutOfBounds { addr, len: n })?;
        buf.truncate(count);
        Ok(buf)
    }

    fn write_memory(&mut self, _tid: Tid, addr: Addr, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut count = 0usize;
        unsafe {
            WriteProcessMemory(
                self.process,
                addr.raw_pointer(),
                data.as_ptr().cast(),
                data.len(),
                Some(&mut count),
            )
        }
        .map_err(|_| DebuggerError::Protected(addr))?;
        Ok(count)
    }

    fn get_regs(&mut self, tid: Tid) -> Result<Registers> {
        let ctx = self.context(tid)?;
        let c = &ctx.0;
        Ok(Registers {
            rax: c.Rax,
            rbx: c.Rbx,
            rcx: c.Rcx,
            rdx: c.Rdx,
            rsi: c.Rsi,
            rdi: c.Rdi,
            rbp: c.Rbp,
            rsp: c.Rsp,
            r8: c.R8,
            r9: c.R9,
            r10: c.R10,
            r11: c.R11,
            r12: c.R12,
            r13: c.R13,
            r14: c.R14,
            r15: c.R15,
            rip: c.Rip,
            eflags: c.EFlags as u64,
            cs: c.SegCs as u64,
            ss: c.SegSs as u64,
            ds: c.SegDs as u64,
            es: c.SegEs as u64,
            fs: c.SegFs as u64,
            gs: c.SegGs as u64,
            ..Registers::default()
        })
    }

    fn set_regs(&mut self, tid: Tid, regs: &Registers) -> Result<()> {
        let mut ctx = self.context(tid)?;
        let c = &mut ctx.0;
        c.Rax = regs.rax;
        c.Rbx = regs.rbx;
        c.Rcx = regs.rcx;
        c.Rdx = regs.rdx;
        c.Rsi = regs.rsi;
        c.Rdi = regs.rdi;
        c.Rbp = regs.rbp;
        c.Rsp = regs.rsp;
        c.R8 = regs.r8;
        c.R9 = regs.r9;
        c.R10 = regs.r10;
        c.R11 = regs.r11;
        c.R12 = regs.r12;
        c.R13 = regs.r13;
        c.R14 = regs.r14;
        c.R15 = regs.r15;
        c.Rip = regs.rip;
        c.EFlags = regs.eflags as u32;
        self.set_context(tid, &ctx)
    }

    fn peek_user(&mut self, _tid: Tid, _offset: u64) -> Result<u64> {
        Err(DebuggerError::Io(std::io::Error::other(
            "no ptrace user area on windows",
        )))
    }

    fn poke_user(&mut self, _tid: Tid, _offset: u64, _word: u64) -> Result<()> {
        Err(DebuggerError::Io(std::io::Error::other(
            "no ptrace user area on windows",
        )))
    }

    fn set_hw_breakpoint(&mut self, tid: Tid, slot: usize, addr: Addr) -> Result<()> {
        debug_assert!(slot < 4);
        let mut ctx = self.context(tid)?;
        let c = &mut ctx.0;
        match slot {
            0 => c.Dr0 = addr.u64(),
            1 => c.Dr1 = addr.u64(),
            2 => c.Dr2 = addr.u64(),
            _ => c.Dr3 = addr.u64(),
        }
        // execute/len1 encode as zero; enabling the slot is enough
        c.Dr7 &= !dr7_slot_mask(slot);
        c.Dr7 |= 1u64 << (slot * 2);
        self.set_context(tid, &ctx)
    }

    fn clear_hw_breakpoint(&mut self, tid: Tid, slot: usize) -> Result<()> {
        debug_assert!(slot < 4);
        let mut ctx = self.context(tid)?;
        ctx.0.Dr7 &= !dr7_slot_mask(slot);
        match slot {
            0 => ctx.0.Dr0 = 0,
            1 => ctx.0.Dr1 = 0,
            2 => ctx.0.Dr2 = 0,
            _ => ctx.0.Dr3 = 0,
        }
        self.set_context(tid, &ctx)
    }

    fn detach(&mut self, kill: bool) -> Result<()> {
        let _ = self.continue_pending();
        unsafe { DebugActiveProcessStop(self.pid as u32) }
            .map_err(|e| DebuggerError::Io(std::io::Error::other(e.to_string())))?;
        if kill {
            let _ = unsafe { TerminateProcess(self.process, 1) };
        }
        Ok(())
    }
}

fn dr7_slot_mask(slot: usize) -> u64 {
    (0xfu64 << (16 + slot * 4)) | (0x3u64 << (slot * 2))
}

impl Drop for WindowsDriver {
    fn drop(&mut self) {
        for handle in self.threads.values() {
            let _ = unsafe { CloseHandle(*handle) };
        }
    }
}
