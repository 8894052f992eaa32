//! Threads, processes, and the per-thread parker.
//!
//! Threads and processes are `Arc`-shared: a lookup hands out a clone of
//! the strong reference and dropping it is the release, so acquire/release
//! symmetry is enforced by scope. Everything another thread may poke
//! cross-thread (mask, pending set, priority, trampoline, exit/stop flags)
//! is atomic; the rest of a process's state sits behind one inner mutex.
//!
//! The parker implements the sleep contract every blocking primitive is
//! built on: park until a wake token, an interrupt token, or a deadline,
//! and report which one ended the sleep. Tokens posted before the park are
//! consumed by it, which is what makes the release-then-park windows in
//! `sync` and `port` race-free.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Instant;

use super::errno::{Error, Result};
use super::lock;
use super::mem::UserMem;
use super::port::Port;
use super::signal::{NSIG, SigAction};
use super::sync::{KCond, KMutex};

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier, global across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a park ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Explicit wake token (object signaled, response arrived, ...).
    Woken,
    /// Deadline passed.
    TimedOut,
    /// Signal delivery interrupted the sleep.
    Interrupted,
}

struct ParkState {
    token: bool,
    interrupted: bool,
}

struct Parker {
    state: Mutex<ParkState>,
    cvar: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            state: Mutex::new(ParkState {
                token: false,
                interrupted: false,
            }),
            cvar: Condvar::new(),
        }
    }

    fn wake(&self) {
        let mut s = lock(&self.state);
        s.token = true;
        self.cvar.notify_all();
    }

    fn interrupt(&self) {
        let mut s = lock(&self.state);
        s.interrupted = true;
        self.cvar.notify_all();
    }

    fn park(&self, deadline: Option<Instant>) -> Wake {
        let mut s = lock(&self.state);
        loop {
            if s.interrupted {
                s.interrupted = false;
                return Wake::Interrupted;
            }
            if s.token {
                s.token = false;
                return Wake::Woken;
            }
            match deadline {
                None => {
                    s = self.cvar.wait(s).unwrap_or_else(PoisonError::into_inner);
                }
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Wake::TimedOut;
                    }
                    let (guard, _) = self
                        .cvar
                        .wait_timeout(s, d - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    s = guard;
                }
            }
        }
    }
}

/// Priority given to threads nobody configured.
pub const DEFAULT_PRIORITY: u32 = 4;

/// Highest (numerically) allowed priority value.
pub const MAX_PRIORITY: u32 = 7;

pub struct Thread {
    pub tid: Tid,
    pub pid: Pid,
    priority: AtomicU32,
    sigmask: AtomicU32,
    pending: AtomicU32,
    trampoline: AtomicU64,
    exit: AtomicBool,
    stop: AtomicBool,
    parker: Parker,
}

impl Thread {
    pub fn new(tid: Tid, pid: Pid, sigmask: u32, trampoline: u64) -> Arc<Self> {
        Arc::new(Self {
            tid,
            pid,
            priority: AtomicU32::new(DEFAULT_PRIORITY),
            sigmask: AtomicU32::new(sigmask),
            pending: AtomicU32::new(0),
            trampoline: AtomicU64::new(trampoline),
            exit: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            parker: Parker::new(),
        })
    }

    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::SeqCst)
    }

    pub fn set_priority(&self, p: u32) {
        self.priority.store(p, Ordering::SeqCst);
    }

    pub fn sigmask(&self) -> u32 {
        self.sigmask.load(Ordering::SeqCst)
    }

    /// Replace the whole mask, returning the prior value.
    pub fn set_sigmask(&self, mask: u32) -> u32 {
        self.sigmask.swap(mask, Ordering::SeqCst)
    }

    /// Merge `mask` into the current mask under `sel`:
    /// `new = (mask & sel) | (old & !sel)`. Returns the prior mask, atomic
    /// with the update.
    pub fn merge_sigmask(&self, mask: u32, sel: u32) -> u32 {
        let mut prev = self.sigmask.load(Ordering::SeqCst);
        loop {
            let next = (mask & sel) | (prev & !sel);
            match self
                .sigmask
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return prev,
                Err(observed) => prev = observed,
            }
        }
    }

    pub fn trampoline(&self) -> u64 {
        self.trampoline.load(Ordering::SeqCst)
    }

    pub fn set_trampoline(&self, addr: u64) {
        self.trampoline.store(addr, Ordering::SeqCst);
    }

    pub fn pending_signals(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn add_pending(&self, bits: u32) {
        self.pending.fetch_or(bits, Ordering::SeqCst);
    }

    pub fn take_pending(&self, bits: u32) -> u32 {
        self.pending.fetch_and(!bits, Ordering::SeqCst) & bits
    }

    pub fn exit_pending(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    /// Ask this thread to terminate at its next checkpoint, and kick it out
    /// of any interruptible sleep so it gets there.
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
        self.parker.interrupt();
    }

    pub fn stop_pending(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.parker.interrupt();
    }

    pub fn clear_stop(&self) {
        self.stop.store(false, Ordering::SeqCst);
        self.parker.wake();
    }

    pub fn wake(&self) {
        self.parker.wake();
    }

    pub fn interrupt(&self) {
        self.parker.interrupt();
    }

    /// Park until woken, interrupted, or past `deadline` (None = no limit).
    pub fn park(&self, deadline: Option<Instant>) -> Wake {
        self.parker.park(deadline)
    }

    /// Used by the dispatcher checkpoint while the stop flag is set.
    pub fn park_while_stopped(&self) {
        while self.stop.load(Ordering::SeqCst) && !self.exit.load(Ordering::SeqCst) {
            self.parker.park(None);
        }
    }

    /// Compact state word for the info syscalls.
    pub fn state_word(&self) -> u32 {
        if self.exit_pending() {
            2
        } else if self.stop_pending() {
            1
        } else {
            0
        }
    }
}

/// One entry in a process's resource table. Cloning clones the inner `Arc`,
/// so an in-flight operation keeps its object alive after destroy.
#[derive(Clone)]
pub enum Resource {
    Mutex(Arc<KMutex>),
    Cond(Arc<KCond>),
    Port(Arc<Port>),
}

/// Handle-table cap per process.
pub const MAX_HANDLES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Alive,
    Zombie(i32),
}

pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: String,
    pub mem: UserMem,
    inner: Mutex<ProcInner>,
}

struct ProcInner {
    state: ProcState,
    exiting: bool,
    exit_status: i32,
    threads: Vec<Arc<Thread>>,
    dead_threads: VecDeque<Tid>,
    children: Vec<Pid>,
    next_handle: u32,
    resources: HashMap<u32, Resource>,
    sigmask_default: u32,
    trampoline_default: u64,
    dispositions: [SigAction; NSIG],
    wait_waiters: Vec<Arc<Thread>>,
    join_waiters: Vec<Arc<Thread>>,
}

/// What `remove_thread` tells the kernel to finish off.
pub struct ReapOutcome {
    /// The process just became a zombie; its parent should be notified.
    pub zombified: bool,
    /// Resources drained from the table on zombification, to be closed.
    pub resources: Vec<Resource>,
}

impl Process {
    pub fn new(pid: Pid, ppid: Pid, name: &str) -> Arc<Self> {
        Arc::new(Self {
            pid,
            ppid,
            name: name.to_string(),
            mem: UserMem::new(),
            inner: Mutex::new(ProcInner {
                state: ProcState::Alive,
                exiting: false,
                exit_status: 0,
                threads: Vec::new(),
                dead_threads: VecDeque::new(),
                children: Vec::new(),
                next_handle: 1,
                resources: HashMap::new(),
                sigmask_default: 0,
                trampoline_default: 0,
                dispositions: [SigAction::DEFAULT; NSIG],
                wait_waiters: Vec::new(),
                join_waiters: Vec::new(),
            }),
        })
    }

    // ========== threads ==========

    pub fn signal_defaults(&self) -> (u32, u64) {
        let inner = lock(&self.inner);
        (inner.sigmask_default, inner.trampoline_default)
    }

    pub fn add_thread(&self, thread: Arc<Thread>) {
        lock(&self.inner).threads.push(thread);
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        lock(&self.inner).threads.clone()
    }

    /// Mark the whole process as exiting with `status`. The caller posts
    /// the exit request to each thread; the last one to reap zombifies us.
    pub fn mark_exiting(&self, status: i32) {
        let mut inner = lock(&self.inner);
        if !inner.exiting {
            inner.exiting = true;
            inner.exit_status = status;
        }
    }

    /// Drop `tid` from the thread list. When the last thread goes, the
    /// process turns zombie and its handle table is drained for closing.
    pub fn remove_thread(&self, tid: Tid) -> ReapOutcome {
        let mut inner = lock(&self.inner);
        inner.threads.retain(|t| t.tid != tid);
        inner.dead_threads.push_back(tid);
        for waiter in &inner.join_waiters {
            waiter.wake();
        }
        if inner.threads.is_empty() && inner.state == ProcState::Alive {
            inner.state = ProcState::Zombie(inner.exit_status);
            let resources = inner.resources.drain().map(|(_, r)| r).collect();
            ReapOutcome {
                zombified: true,
                resources,
            }
        } else {
            ReapOutcome {
                zombified: false,
                resources: Vec::new(),
            }
        }
    }

    pub fn zombie_status(&self) -> Option<i32> {
        match lock(&self.inner).state {
            ProcState::Zombie(status) => Some(status),
            ProcState::Alive => None,
        }
    }

    // ========== children / waitpid ==========

    pub fn add_child(&self, pid: Pid) {
        lock(&self.inner).children.push(pid);
    }

    pub fn remove_child(&self, pid: Pid) {
        lock(&self.inner).children.retain(|&c| c != pid);
    }

    pub fn children(&self) -> Vec<Pid> {
        lock(&self.inner).children.clone()
    }

    pub fn add_wait_waiter(&self, thread: Arc<Thread>) {
        lock(&self.inner).wait_waiters.push(thread);
    }

    pub fn remove_wait_waiter(&self, tid: Tid) {
        lock(&self.inner).wait_waiters.retain(|t| t.tid != tid);
    }

    pub fn wake_wait_waiters(&self) {
        for waiter in lock(&self.inner).wait_waiters.iter() {
            waiter.wake();
        }
    }

    // ========== thread join ==========

    pub fn add_join_waiter(&self, thread: Arc<Thread>) {
        lock(&self.inner).join_waiters.push(thread);
    }

    pub fn remove_join_waiter(&self, tid: Tid) {
        lock(&self.inner).join_waiters.retain(|t| t.tid != tid);
    }

    pub fn pop_dead_thread(&self) -> Option<Tid> {
        lock(&self.inner).dead_threads.pop_front()
    }

    // ========== signal dispositions ==========

    /// Query and optionally replace the process-wide disposition for one
    /// signal. Returns the prior disposition.
    pub fn sigaction(&self, sig: usize, new: Option<SigAction>) -> Result<SigAction> {
        if sig == 0 || sig >= NSIG {
            return Err(Error::InvalidArgument);
        }
        let mut inner = lock(&self.inner);
        let old = inner.dispositions[sig];
        if let Some(action) = new {
            inner.dispositions[sig] = action;
        }
        Ok(old)
    }

    // ========== handle table ==========

    /// Allocate a fresh handle for `res`. Handles are monotonic and never
    /// reused, so a stale handle can only ever miss the table.
    pub fn handle_alloc(&self, res: Resource) -> Result<u32> {
        let mut inner = lock(&self.inner);
        if inner.resources.len() >= MAX_HANDLES {
            return Err(Error::ResourceExhausted);
        }
        let h = inner.next_handle;
        inner.next_handle += 1;
        inner.resources.insert(h, res);
        Ok(h)
    }

    pub fn resource(&self, h: u32) -> Result<Resource> {
        lock(&self.inner)
            .resources
            .get(&h)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    pub fn mutex(&self, h: u32) -> Result<Arc<KMutex>> {
        match self.resource(h)? {
            Resource::Mutex(m) => Ok(m),
            _ => Err(Error::InvalidHandle),
        }
    }

    pub fn cond(&self, h: u32) -> Result<Arc<KCond>> {
        match self.resource(h)? {
            Resource::Cond(c) => Ok(c),
            _ => Err(Error::InvalidHandle),
        }
    }

    pub fn port(&self, h: u32) -> Result<Arc<Port>> {
        match self.resource(h)? {
            Resource::Port(p) => Ok(p),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Remove `h` from the table, returning the object for the caller to
    /// close. Works on any resource kind.
    pub fn destroy_handle(&self, h: u32) -> Result<Resource> {
        lock(&self.inner)
            .resources
            .remove(&h)
            .ok_or(Error::InvalidHandle)
    }
}
