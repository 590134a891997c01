//! # Error Types
//!
//! Defines error types and a result alias used throughout the [crate].
//!
//! All fallible operations in the core return [`DebuggerError`], defined with
//! the [thiserror] crate. The taxonomy distinguishes errors the core recovers
//! from internally (running out of hardware breakpoint slots, a thread
//! disappearing between two operations) from errors that are surfaced to the
//! caller unchanged. [`DebuggerError::ProcessExited`] is sticky: once a
//! target has exited, every later operation on it short-circuits with it.

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::addr::Addr;
use crate::driver::Tid;

/// Type alias for Results returned by coretap functions
pub type Result<T> = std::result::Result<T, DebuggerError>;

/// Comprehensive error type for the coretap process-control core
///
/// # Examples
///
/// ```
/// use coretap::errors::{DebuggerError, Result};
///
/// fn example_function() -> Result<()> {
///     let _file = std::fs::File::open("/proc/self/stat")?;
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum DebuggerError {
    #[cfg(unix)]
    #[error("Os error: {0}")]
    Os(#[from] nix::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Process {pid} has exited with status {status}")]
    ProcessExited { pid: i32, status: i32 },
    #[error("Thread {0} no longer exists")]
    ThreadGone(Tid),
    #[error("No thread with id {0}")]
    UnknownThread(Tid),
    #[error("Could not attach to process {0}: permission denied")]
    PermissionDenied(i32),
    #[error("Could not attach to process {0}: no such process")]
    ProcessNotFound(i32),
    #[error("Process {0} is already being traced")]
    AlreadyTraced(i32),
    #[error("Breakpoint already exists at {0}")]
    BreakpointExists(Addr),
    #[error("No breakpoint set at {0}")]
    NoBreakpoint(Addr),
    #[error("Address {0} does not resolve to a known instruction")]
    InvalidAddress(Addr),
    #[error("All hardware breakpoint slots are in use")]
    OutOfSlots,
    #[error("Memory at {0} is protected")]
    Protected(Addr),
    #[error("Memory access at {addr} (length {len}) is out of bounds")]
    OutOfBounds { addr: Addr, len: usize },
    #[error("Record/replay tools are not available on this system")]
    BackendUnavailable,
    #[error("{0} is not a LiveRecorder recording")]
    NotARecording(String),
    #[error("Could not parse: {0}")]
    Parse(String),
    #[error("Invalid checkpoint note: {0}")]
    InvalidCheckpointNote(String),
    #[error("Checkpoint c{0} not found")]
    UnknownCheckpoint(u64),
    #[error("No goroutine with id {0}")]
    UnknownGoroutine(i64),
    #[error("Operation is only valid for recorded targets")]
    NotRecorded,
    #[error("Executable does not exist: {0}")]
    ExecutableDoesNotExist(String),
    #[error("Executable is not a file: {0}")]
    ExecutableIsNotAFile(String),
    #[error("Could not convert to CString: {0}")]
    CStringConv(#[from] std::ffi::NulError),
    #[error("Could not parse integer: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
    #[error("Stepping out of the outermost frame makes no sense")]
    StepOutOfOutermostFrame,
    #[error("A step operation is already in progress")]
    NextWhileNexting,
    #[error("Error while reading information from the executable file: {0}")]
    Object(#[from] object::Error),
    #[error("Working with JSON failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl DebuggerError {
    /// True for errors that terminate the debug session for good.
    pub fn is_exited(&self) -> bool {
        matches!(self, DebuggerError::ProcessExited { .. })
    }
}

// Create a serializable representation of errors
#[derive(Serialize)]
struct SerializableError {
    error_type: String,
    message: String,
}

impl Serialize for DebuggerError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let error_type = match self {
            #[cfg(unix)]
            DebuggerError::Os(_) => "OS",
            DebuggerError::Io(_) => "IO",
            DebuggerError::ProcessExited { .. } => "ProcessExited",
            DebuggerError::ThreadGone(_) => "ThreadGone",
            DebuggerError::UnknownThread(_) => "UnknownThread",
            DebuggerError::PermissionDenied(_) => "PermissionDenied",
            DebuggerError::ProcessNotFound(_) => "ProcessNotFound",
            DebuggerError::AlreadyTraced(_) => "AlreadyTraced",
            DebuggerError::BreakpointExists(_) => "BreakpointExists",
            DebuggerError::NoBreakpoint(_) => "NoBreakpoint",
            DebuggerError::InvalidAddress(_) => "InvalidAddress",
            DebuggerError::OutOfSlots => "OutOfSlots",
            DebuggerError::Protected(_) => "Protected",
            DebuggerError::OutOfBounds { .. } => "OutOfBounds",
            DebuggerError::BackendUnavailable => "BackendUnavailable",
            DebuggerError::NotARecording(_) => "NotARecording",
            DebuggerError::Parse(_) => "Parse",
            DebuggerError::InvalidCheckpointNote(_) => "InvalidCheckpointNote",
            DebuggerError::UnknownCheckpoint(_) => "UnknownCheckpoint",
            DebuggerError::UnknownGoroutine(_) => "UnknownGoroutine",
            DebuggerError::NotRecorded => "NotRecorded",
            DebuggerError::ExecutableDoesNotExist(_) => "ExecutableDoesNotExist",
            DebuggerError::ExecutableIsNotAFile(_) => "ExecutableIsNotAFile",
            DebuggerError::CStringConv(_) => "CStringConversion",
            DebuggerError::ParseInt(_) => "ParseInt",
            DebuggerError::StepOutOfOutermostFrame => "StepOutOfOutermostFrame",
            DebuggerError::NextWhileNexting => "NextWhileNexting",
            DebuggerError::Object(_) => "Object",
            DebuggerError::Json(_) => "Json",
        };

        let message = self.to_string();

        SerializableError {
            error_type: error_type.to_string(),
            message,
        }
        .serialize(serializer)
    }
}
