//! CPU register access types.
//!
//! [`Registers`] is the portable register file handed across the [`Driver`]
//! boundary; on Linux it converts to and from the kernel's
//! `user_regs_struct`. [`Register`] names a single register for the
//! get/set-one-register surface of the façade.
//!
//! [`Driver`]: crate::driver::Driver

use std::str::FromStr;

use serde::Serialize;

use crate::addr::Addr;
use crate::errors::{DebuggerError, Result};

/// The x86-64 general purpose register file of one thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub eflags: u64,
    pub cs: u64,
    pub ss: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub orig_rax: u64,
}

impl Registers {
    pub fn pc(&self) -> Addr {
        Addr::from(self.rip)
    }

    pub fn set_pc(&mut self, pc: Addr) {
        self.rip = pc.u64();
    }

    pub fn sp(&self) -> Addr {
        Addr::from(self.rsp)
    }

    pub fn frame_pointer(&self) -> Addr {
        Addr::from(self.rbp)
    }

    pub fn get(&self, r: Register) -> u64 {
        match r {
            Register::rax => self.rax,
            Register::rbx => self.rbx,
            Register::rcx => self.rcx,
            Register::rdx => self.rdx,
            Register::rsi => self.rsi,
            Register::rdi => self.rdi,
            Register::rbp => self.rbp,
            Register::rsp => self.rsp,
            Register::r8 => self.r8,
            Register::r9 => self.r9,
            Register::r10 => self.r10,
            Register::r11 => self.r11,
            Register::r12 => self.r12,
            Register::r13 => self.r13,
            Register::r14 => self.r14,
            Register::r15 => self.r15,
            Register::rip => self.rip,
            Register::eflags => self.eflags,
        }
    }

    pub fn set(&mut self, r: Register, value: u64) {
        match r {
            Register::rax => self.rax = value,
            Register::rbx => self.rbx = value,
            Register::rcx => self.rcx = value,
            Register::rdx => self.rdx = value,
            Register::rsi => self.rsi = value,
            Register::rdi => self.rdi = value,
            Register::rbp => self.rbp = value,
            Register::rsp => self.rsp = value,
            Register::r8 => self.r8 = value,
            Register::r9 => self.r9 = value,
            Register::r10 => self.r10 = value,
            Register::r11 => self.r11 = value,
            Register::r12 => self.r12 = value,
            Register::r13 => self.r13 = value,
            Register::r14 => self.r14 = value,
            Register::r15 => self.r15 = value,
            Register::rip => self.rip = value,
            Register::eflags => self.eflags = value,
        }
    }
}

/// A single named register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(non_camel_case_types)]
pub enum Register {
    rax,
    rbx,
    rcx,
    rdx,
    rsi,
    rdi,
    rbp,
    rsp,
    r8,
    r9,
    r10,
    r11,
    r12,
    r13,
    r14,
    r15,
    rip,
    eflags,
}

impl FromStr for Register {
    type Err = DebuggerError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "rax" => Register::rax,
            "rbx" => Register::rbx,
            "rcx" => Register::rcx,
            "rdx" => Register::rdx,
            "rsi" => Register::rsi,
            "rdi" => Register::rdi,
            "rbp" => Register::rbp,
            "rsp" => Register::rsp,
            "r8" => Register::r8,
            "r9" => Register::r9,
            "r10" => Register::r10,
            "r11" => Register::r11,
            "r12" => Register::r12,
            "r13" => Register::r13,
            "r14" => Register::r14,
            "r15" => Register::r15,
            "rip" => Register::rip,
            "eflags" => Register::eflags,
            other => return Err(DebuggerError::Parse(format!("unknown register: {other}"))),
        })
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl From<nix::libc::user_regs_struct> for Registers {
    fn from(r: nix::libc::user_regs_struct) -> Self {
        Registers {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rbp: r.rbp,
            rsp: r.rsp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: r.rip,
            eflags: r.eflags,
            cs: r.cs,
            ss: r.ss,
            ds: r.ds,
            es: r.es,
            fs: r.fs,
            gs: r.gs,
            fs_base: r.fs_base,
            gs_base: r.gs_base,
            orig_rax: r.orig_rax,
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl From<Registers> for nix::libc::user_regs_struct {
    fn from(r: Registers) -> Self {
        nix::libc::user_regs_struct {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rbp: r.rbp,
            rsp: r.rsp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: r.rip,
            eflags: r.eflags,
            cs: r.cs,
            ss: r.ss,
            ds: r.ds,
            es: r.es,
            fs: r.fs,
            gs: r.gs,
            fs_base: r.fs_base,
            gs_base: r.gs_base,
            orig_rax: r.orig_rax,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_register_from_str() {
        assert_eq!(Register::from_str("rip").unwrap(), Register::rip);
        assert_eq!(Register::from_str("R15").unwrap(), Register::r15);
        assert!(Register::from_str("xmm0").is_err());
    }

    #[test]
    fn test_get_set_roundtrip() {
        let mut regs = Registers::default();
        regs.set(Register::rip, 0x4000);
        assert_eq!(regs.pc(), Addr::from(0x4000usize));
        regs.set_pc(Addr::from(0x4001usize));
        assert_eq!(regs.get(Register::rip), 0x4001);
    }
}
