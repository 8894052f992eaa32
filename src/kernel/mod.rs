//! The kernel core - dispatch, handle tables, signals, and message ports.
//!
//! Module layering (leaf-first): `errno` and `arg` have no kernel state,
//! `mem`/`time` are per-process and global services, `proc` owns threads and
//! processes, `sync`/`signal`/`port` build the primitives on top of them,
//! and `syscall` ties everything into the numbered table and dispatcher.

pub mod arg;
pub mod errno;
pub mod io;
pub mod mem;
pub mod port;
pub mod proc;
pub mod signal;
pub mod sync;
pub mod syscall;
pub mod time;

pub use errno::{EOK, Error, Result};
pub use syscall::{Dispatch, Kernel, SYSCALLS, SyscallNr};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, shrugging off poisoning. A panicking kernel test thread
/// must not wedge every other table user.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
