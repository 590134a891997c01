//! # coretap
//!
//! The process-control core of a source-level debugger for compiled
//! native programs. The crate owns the target process: attaching and
//! launching, stopping and resuming, reading and writing memory and
//! registers, hardware and software breakpoints, single-stepping, and
//! observation of thread creation and exit. On top of the same driver
//! seam sits a record/replay session controller speaking the gdb serial
//! protocol to an external recorder/replayer.
//!
//! The entry points are [`process::Process::launch`],
//! [`process::Process::attach`] and [`replay::replay`]; everything else
//! hangs off the returned [`process::Process`].
//!
//! Symbol resolution (DWARF, line tables) is not done here: the core
//! consumes a [`sym::SymbolOracle`] provided by the layer above it.

pub mod addr;
pub mod arch;
pub mod breakpoint;
pub mod driver;
pub mod errors;
#[cfg(target_os = "linux")]
pub mod lane;
pub mod memory;
pub mod memorymap;
pub mod process;
pub mod regs;
pub mod replay;
pub mod sym;
pub mod thread;

pub use addr::Addr;
pub use errors::{DebuggerError, Result};
pub use process::Process;

/// A machine word of the target.
pub type Word = i64;
