use crate::fs::FsError;
use crate::vm::VmError;
use core::fmt;

/// Recoverable failures reported by the process core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No UNUSED slot left in the process table
    OutOfProcesses,
    OutOfMemory,
    /// The system-wide open file table is full
    OutOfFiles,
    /// `wait` called by a process without children
    NoChildren,
    /// The calling process has been asked to terminate
    Killed,
    /// Write to a pipe whose read side is closed
    BrokenPipe,
    /// A user address could not be copied to or from
    BadAddress,
    NoSuchProcess,
    BadFileDescriptor,
    InvalidArgument,
    NotFound,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::OutOfProcesses => "process table full",
            Self::OutOfMemory => "out of memory",
            Self::OutOfFiles => "file table full",
            Self::NoChildren => "no children",
            Self::Killed => "killed",
            Self::BrokenPipe => "broken pipe",
            Self::BadAddress => "bad address",
            Self::NoSuchProcess => "no such process",
            Self::BadFileDescriptor => "bad file descriptor",
            Self::InvalidArgument => "invalid argument",
            Self::NotFound => "not found",
        };
        f.write_str(message)
    }
}

impl From<VmError> for KernelError {
    fn from(value: VmError) -> Self {
        match value {
            VmError::OutOfMemory => Self::OutOfMemory,
            VmError::BadAddress => Self::BadAddress,
        }
    }
}

impl From<FsError> for KernelError {
    fn from(value: FsError) -> Self {
        match value {
            FsError::NotFound => Self::NotFound,
            FsError::Io => Self::BadAddress,
        }
    }
}
