//! Kernel error taxonomy.
//!
//! Every fallible kernel path returns [`Result`]. At the syscall boundary
//! the dispatcher encodes errors into the negative word of the numeric ABI:
//! EOK (0) or a non-negative value on success, a negated errno code on
//! failure. The codes follow the classic errno numbering and existing
//! user-mode binaries depend on them, so they must stay stable.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Success word of the numeric ABI.
pub const EOK: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Bad syscall number, malformed parameter, unresolved pid/tid.
    InvalidArgument,
    /// Handle unknown, destroyed, or of the wrong kind in this process.
    InvalidHandle,
    /// Non-blocking variant cannot proceed right now.
    WouldBlock,
    /// Bounded wait expired.
    TimedOut,
    /// Blocking wait ended by signal delivery.
    Interrupted,
    /// No table slot or memory left for a new kernel object.
    ResourceExhausted,
    /// Caller does not own the object it is operating on.
    PermissionDenied,
    /// Capability not wired up on this build.
    Unsupported,
    /// Placeholder table entry, reachable but intentionally inert.
    NotImplemented,
    /// Address outside the calling process's memory.
    BadAddress,
    /// No matching child process.
    NoChild,
}

impl Error {
    /// The negative errno word this kind encodes to.
    ///
    /// InvalidArgument and InvalidHandle share EINVAL on the wire; user
    /// mode has never been able to tell them apart.
    pub fn code(self) -> i64 {
        match self {
            Error::InvalidArgument => -22, // EINVAL
            Error::InvalidHandle => -22,   // EINVAL
            Error::WouldBlock => -11,      // EAGAIN
            Error::TimedOut => -62,        // ETIME
            Error::Interrupted => -4,      // EINTR
            Error::ResourceExhausted => -12, // ENOMEM
            Error::PermissionDenied => -1, // EPERM
            Error::Unsupported => -25,     // ENOTTY
            Error::NotImplemented => -38,  // ENOSYS
            Error::BadAddress => -14,      // EFAULT
            Error::NoChild => -10,         // ECHILD
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidArgument => "invalid argument",
            Error::InvalidHandle => "invalid handle",
            Error::WouldBlock => "operation would block",
            Error::TimedOut => "timed out",
            Error::Interrupted => "interrupted by signal",
            Error::ResourceExhausted => "out of kernel resources",
            Error::PermissionDenied => "permission denied",
            Error::Unsupported => "not supported",
            Error::NotImplemented => "not implemented",
            Error::BadAddress => "bad address",
            Error::NoChild => "no child processes",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for Error {}

/// Collapse a kernel result into the signed ABI word.
pub fn encode(res: Result<i64>) -> i64 {
    match res {
        Ok(v) => v,
        Err(e) => e.code(),
    }
}
