//! Target architecture parameters.
//!
//! The core only cares about two properties of the target architecture:
//! the byte sequence of the breakpoint instruction (and its length) and
//! the pointer size. Everything else lives in the symbol layer.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Arch {
    X86_64,
    Arm64,
}

impl Arch {
    /// The architecture of the machine the debugger itself runs on.
    pub fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Arch::X86_64
        }
        #[cfg(target_arch = "aarch64")]
        {
            Arch::Arm64
        }
    }

    /// The trap instruction planted for software breakpoints.
    pub fn breakpoint_instruction(self) -> &'static [u8] {
        match self {
            // INT 3
            Arch::X86_64 => &[0xcc],
            // BRK #0
            Arch::Arm64 => &[0x00, 0x00, 0x20, 0xd4],
        }
    }

    pub fn breakpoint_size(self) -> usize {
        self.breakpoint_instruction().len()
    }

    pub fn ptr_size(self) -> usize {
        8
    }

    /// Whether a software trap leaves the PC *past* the trap instruction.
    ///
    /// On x86 the INT 3 has executed when the stop is reported, so the PC
    /// must be rewound by [`Self::breakpoint_size`] to find the breakpoint.
    /// On ARM64 the PC still points at the BRK.
    pub fn trap_advances_pc(self) -> bool {
        matches!(self, Arch::X86_64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_breakpoint_instruction_lengths() {
        assert_eq!(Arch::X86_64.breakpoint_size(), 1);
        assert_eq!(Arch::Arm64.breakpoint_size(), 4);
        assert_eq!(
            Arch::X86_64.breakpoint_instruction().len(),
            Arch::X86_64.breakpoint_size()
        );
    }
}
