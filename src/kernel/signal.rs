//! Signal constants, dispositions, and delivery.
//!
//! A thread's signal state is a 32-bit mask (bit i set = signal i blocked),
//! a pending set, and a trampoline address user mode registered for
//! handler entry. Delivery is deliberately small: the kill/stop/continue
//! signals map onto the deferred exit/stop flags the dispatcher checkpoint
//! acts on, and everything else becomes a pending bit that interrupts the
//! target's sleep only while unmasked. Actually running a user handler
//! through the trampoline is the trap path's job, outside this crate.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use super::proc::Thread;

/// Number of signal slots; valid signal numbers are 1..NSIG.
pub const NSIG: usize = 32;

pub const SIGKILL: u32 = 9;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;

/// Bit for `sig` in a mask or pending set. Caller guarantees `sig < 32`.
pub fn sig_bit(sig: u32) -> u32 {
    1u32 << sig
}

/// Process-wide disposition record, read and written through user memory
/// by `sigaction`. Fixed layout, part of the ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SigAction {
    /// User handler entry, 0 = default.
    pub handler: u64,
    /// Mask applied while the handler runs.
    pub mask: u32,
    pub flags: u32,
}

impl SigAction {
    pub const DEFAULT: SigAction = SigAction {
        handler: 0,
        mask: 0,
        flags: 0,
    };
}

/// Deliver `sig` to one thread through a lookup-acquired reference.
pub fn deliver(thread: &Arc<Thread>, sig: u32) {
    match sig {
        SIGKILL => {
            log::debug!("SIGKILL -> thread {}", thread.tid);
            thread.request_exit();
        }
        SIGSTOP => {
            thread.request_stop();
        }
        SIGCONT => {
            thread.clear_stop();
        }
        _ => {
            thread.add_pending(sig_bit(sig));
            if thread.sigmask() & sig_bit(sig) == 0 {
                // Unmasked: kick the target out of any interruptible sleep.
                thread.interrupt();
            }
            log::trace!("signal {} -> thread {}", sig, thread.tid);
        }
    }
}

/// Process-wide delivery. Kill/stop/continue fan out to every thread; a
/// plain signal goes to the first thread not blocking it, or stays pending
/// on the first thread when all of them block it.
pub fn deliver_process(threads: &[Arc<Thread>], sig: u32) {
    match sig {
        SIGKILL | SIGSTOP | SIGCONT => {
            for thread in threads {
                deliver(thread, sig);
            }
        }
        _ => {
            let target = threads
                .iter()
                .find(|t| t.sigmask() & sig_bit(sig) == 0)
                .or_else(|| threads.first());
            if let Some(thread) = target {
                deliver(thread, sig);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::proc::{Pid, Thread, Tid, Wake};

    fn thread(tid: u32, mask: u32) -> Arc<Thread> {
        Thread::new(Tid(tid), Pid(1), mask, 0)
    }

    #[test]
    fn test_deliver_sets_pending_and_interrupts() {
        let t = thread(1, 0);
        deliver(&t, 5);
        assert_eq!(t.pending_signals(), sig_bit(5));
        assert_eq!(t.park(None), Wake::Interrupted);
    }

    #[test]
    fn test_masked_signal_stays_pending_without_interrupt() {
        let t = thread(1, sig_bit(5));
        deliver(&t, 5);
        assert_eq!(t.pending_signals(), sig_bit(5));
        // No interrupt token was posted.
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(10);
        assert_eq!(t.park(Some(deadline)), Wake::TimedOut);
    }

    #[test]
    fn test_kill_sets_exit_flag() {
        let t = thread(1, 0);
        deliver(&t, SIGKILL);
        assert!(t.exit_pending());
    }

    #[test]
    fn test_stop_and_continue() {
        let t = thread(1, 0);
        deliver(&t, SIGSTOP);
        assert!(t.stop_pending());
        deliver(&t, SIGCONT);
        assert!(!t.stop_pending());
    }

    #[test]
    fn test_process_delivery_picks_unmasked_thread() {
        let blocked = thread(1, sig_bit(7));
        let open = thread(2, 0);
        deliver_process(&[blocked.clone(), open.clone()], 7);
        assert_eq!(blocked.pending_signals(), 0);
        assert_eq!(open.pending_signals(), sig_bit(7));
    }

    #[test]
    fn test_process_delivery_all_masked_leaves_pending() {
        let a = thread(1, sig_bit(7));
        let b = thread(2, sig_bit(7));
        deliver_process(&[a.clone(), b.clone()], 7);
        assert_eq!(a.pending_signals(), sig_bit(7));
        assert_eq!(b.pending_signals(), 0);
    }

    #[test]
    fn test_process_kill_hits_every_thread() {
        let a = thread(1, 0);
        let b = thread(2, 0);
        deliver_process(&[a.clone(), b.clone()], SIGKILL);
        assert!(a.exit_pending());
        assert!(b.exit_pending());
    }
}
