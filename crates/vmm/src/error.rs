//! Error types returned at the syscall boundary and by the page fault handler.

/// Errors reported by the VM syscalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("out of memory")]
    OutOfMemory,
    #[error("permission denied")]
    AccessDenied,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("mapping already exists")]
    AlreadyExists,
    #[error("i/o error (errno {0})")]
    Io(i32),
}

impl VmError {
    pub const EPERM: i32 = 1;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;

    /// The POSIX errno for this error.
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument => Self::EINVAL,
            Self::OutOfMemory => Self::ENOMEM,
            Self::AccessDenied => Self::EACCES,
            Self::NotPermitted => Self::EPERM,
            Self::AlreadyExists => Self::EEXIST,
            Self::Io(errno) => errno,
        }
    }
}

/// Outcome of a page fault that could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    /// No mapping covers the address, or the mapping forbids the access.
    #[error("segmentation fault")]
    Segv,
    /// The mapping exists but cannot be backed: past end of file, or no memory.
    #[error("bus error")]
    Bus,
}
