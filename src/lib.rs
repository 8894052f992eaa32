//! osprey - the syscall boundary of a small real-time OS kernel.
//!
//! This crate implements the kernel side of the user/kernel trust boundary:
//! numbered syscall dispatch over an immutable table, positional argument
//! marshaling out of caller-owned buffers, per-process handle tables for
//! mutexes, condition variables and message ports, signal masks and
//! cross-thread signal posting, and the deferred exit/stop checkpoint run
//! before any syscall result is handed back to user mode.
//!
//! Design principles:
//! - Everything user mode hands us is untrusted: numbers are bounds-checked,
//!   addresses are range-checked against the process arena, handles are
//!   resolved through per-process tables.
//! - Kernel objects are reference-counted; cross-thread mutation happens
//!   only through a lookup-acquired reference.
//! - Blocking is interruptible by signal delivery, and termination/stop
//!   requests are observed at one checkpoint, never mid-handler.

pub mod kernel;
