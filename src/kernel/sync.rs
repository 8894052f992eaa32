//! Kernel synchronization objects: mutexes and condition variables.
//!
//! Both live in per-process handle tables and are operated on by handle
//! only. Waiters queue themselves on the object *before* parking, and wake
//! tokens survive until the next park, so a wake delivered between queueing
//! and parking is never lost.
//!
//! Destroy semantics: `close` marks the object and wakes every queued
//! waiter; their operations return InvalidHandle. The handle itself is
//! already gone from the table by then, and handle values are never
//! reused, so in-flight operations always run against live storage.
//!
//! No FIFO ordering is promised among waiters: unlock wakes the oldest
//! waiter but a fresh caller can still barge in first.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::errno::{Error, Result};
use super::lock;
use super::proc::{Thread, Tid, Wake};

pub struct KMutex {
    inner: Mutex<MutexInner>,
}

struct MutexInner {
    owner: Option<Tid>,
    waiters: VecDeque<Arc<Thread>>,
    closed: bool,
}

impl KMutex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MutexInner {
                owner: None,
                waiters: VecDeque::new(),
                closed: false,
            }),
        })
    }

    /// Blocking lock. Interruptible by signal delivery.
    pub fn lock(&self, thread: &Arc<Thread>) -> Result<()> {
        self.lock_inner(thread, true)
    }

    /// Blocking lock that rides out interrupts. Used to reacquire after a
    /// condition wait, where the wait result already carries the error.
    pub fn lock_uninterruptible(&self, thread: &Arc<Thread>) -> Result<()> {
        self.lock_inner(thread, false)
    }

    fn lock_inner(&self, thread: &Arc<Thread>, interruptible: bool) -> Result<()> {
        loop {
            {
                let mut m = lock(&self.inner);
                if m.closed {
                    m.waiters.retain(|t| t.tid != thread.tid);
                    return Err(Error::InvalidHandle);
                }
                if m.owner.is_none() {
                    m.owner = Some(thread.tid);
                    m.waiters.retain(|t| t.tid != thread.tid);
                    return Ok(());
                }
                if m.owner == Some(thread.tid) {
                    // Non-recursive: refuse rather than self-deadlock.
                    return Err(Error::PermissionDenied);
                }
                if !m.waiters.iter().any(|t| t.tid == thread.tid) {
                    m.waiters.push_back(thread.clone());
                }
            }
            if thread.park(None) == Wake::Interrupted && interruptible {
                let mut m = lock(&self.inner);
                m.waiters.retain(|t| t.tid != thread.tid);
                return Err(Error::Interrupted);
            }
        }
    }

    /// Non-blocking lock: WouldBlock instead of queueing.
    pub fn try_lock(&self, thread: &Arc<Thread>) -> Result<()> {
        let mut m = lock(&self.inner);
        if m.closed {
            return Err(Error::InvalidHandle);
        }
        if m.owner.is_none() {
            m.owner = Some(thread.tid);
            return Ok(());
        }
        Err(Error::WouldBlock)
    }

    pub fn unlock(&self, thread: &Arc<Thread>) -> Result<()> {
        let mut m = lock(&self.inner);
        if m.closed {
            return Err(Error::InvalidHandle);
        }
        if m.owner != Some(thread.tid) {
            return Err(Error::PermissionDenied);
        }
        m.owner = None;
        if let Some(next) = m.waiters.front() {
            next.wake();
        }
        Ok(())
    }

    pub fn owner(&self) -> Option<Tid> {
        lock(&self.inner).owner
    }

    /// Invalidate the object and flush its wait queue.
    pub fn close(&self) {
        let mut m = lock(&self.inner);
        m.closed = true;
        m.owner = None;
        for waiter in &m.waiters {
            waiter.wake();
        }
    }
}

pub struct KCond {
    inner: Mutex<CondInner>,
}

struct CondInner {
    waiters: VecDeque<Arc<Thread>>,
    closed: bool,
}

impl KCond {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CondInner {
                waiters: VecDeque::new(),
                closed: false,
            }),
        })
    }

    /// Atomically release `mutex` and park until signaled, interrupted, or
    /// past `timeout_us` (0 = wait forever); then reacquire `mutex` before
    /// returning. The queue-then-unlock order is the correctness-critical
    /// step: a signal issued any time after the unlock finds us queued.
    pub fn wait(
        &self,
        thread: &Arc<Thread>,
        mutex: &Arc<KMutex>,
        timeout_us: u64,
    ) -> Result<()> {
        {
            let mut c = lock(&self.inner);
            if c.closed {
                return Err(Error::InvalidHandle);
            }
            c.waiters.push_back(thread.clone());
        }
        if let Err(e) = mutex.unlock(thread) {
            let mut c = lock(&self.inner);
            c.waiters.retain(|t| t.tid != thread.tid);
            return Err(e);
        }

        let deadline = if timeout_us == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_micros(timeout_us))
        };
        let result = loop {
            let wake = thread.park(deadline);
            let mut c = lock(&self.inner);
            let queued = c.waiters.iter().any(|t| t.tid == thread.tid);
            if !queued {
                // A signal/broadcast dequeued us; destruction afterwards
                // does not retract the wakeup.
                break Ok(());
            }
            if c.closed {
                c.waiters.retain(|t| t.tid != thread.tid);
                break Err(Error::InvalidHandle);
            }
            match wake {
                Wake::Interrupted => {
                    c.waiters.retain(|t| t.tid != thread.tid);
                    break Err(Error::Interrupted);
                }
                Wake::TimedOut => {
                    c.waiters.retain(|t| t.tid != thread.tid);
                    break Err(Error::TimedOut);
                }
                // Stale token; keep waiting.
                Wake::Woken => {}
            }
        };

        let reacquire = mutex.lock_uninterruptible(thread);
        match result {
            Err(e) => Err(e),
            Ok(()) => reacquire,
        }
    }

    /// Wake one waiter (at least one, per monitor semantics).
    pub fn signal(&self) {
        let mut c = lock(&self.inner);
        if let Some(waiter) = c.waiters.pop_front() {
            waiter.wake();
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        let mut c = lock(&self.inner);
        for waiter in c.waiters.drain(..) {
            waiter.wake();
        }
    }

    pub fn close(&self) {
        let mut c = lock(&self.inner);
        c.closed = true;
        for waiter in &c.waiters {
            waiter.wake();
        }
    }
}
