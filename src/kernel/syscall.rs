//! Syscall table, dispatcher, and handlers.
//!
//! User mode traps in with a syscall number and the address of a packed
//! argument buffer. The dispatcher bounds-checks the number against the
//! immutable table, hands the handler a bounds-checked argument reader,
//! and - before any result crosses back to user mode - runs the deferred
//! checkpoint: a thread asked to terminate never sees its return value,
//! a thread asked to stop parks here until continued.
//!
//! The table is built once and never mutated; placeholder entries keep
//! their numbers so the ABI cannot shift under existing binaries.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::arg::{ARG_WINDOW, Args};
use super::errno::{self, EOK, Error, Result};
use super::io::{AT_FDCWD, FileOps, FileStat, NetOps, NullFileOps, NullNetOps, PollFd};
use super::lock;
use super::port::{Msg, Port};
use super::proc::{MAX_PRIORITY, Pid, Process, Resource, Thread, Tid, Wake};
use super::signal::{self, NSIG, SigAction};
use super::time::Clock;
use super::sync::{KCond, KMutex};

/// waitpid option: return instead of blocking.
pub const WNOHANG: u32 = 0x1;

/// Largest poll set a single call may hand in.
const MAX_POLL_FDS: usize = 128;

/// Largest socket address / option buffer accepted.
const MAX_ADDR_LEN: usize = 128;

/// ioctl argument window copied in and back out.
const IOCTL_ARG: usize = 64;

// ============================================================================
// Syscall numbers
// ============================================================================

/// Stable syscall numbering. Order mirrors the table below exactly; the
/// placeholder entries hold their slots so numbers never shift.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallNr {
    Debug = 0,
    MemMap = 1,
    MemUnmap = 2,
    Vforksvc = 3,
    Fork = 4,
    Release = 5,
    Spawn = 6,
    Exec = 7,
    Exit = 8,
    Waitpid = 9,
    ThreadJoin = 10,
    Getpid = 11,
    Getppid = 12,
    Gettid = 13,
    BeginThread = 14,
    EndThread = 15,
    Usleep = 16,
    Priority = 17,
    ThreadsInfo = 18,
    MemInfo = 19,
    Interrupt = 20,
    MutexCreate = 21,
    MutexLock = 22,
    MutexTry = 23,
    MutexUnlock = 24,
    CondCreate = 25,
    CondWait = 26,
    CondSignal = 27,
    CondBroadcast = 28,
    ResourceDestroy = 29,
    PortCreate = 30,
    PortGet = 31,
    PortRegister = 32,
    MsgSend = 33,
    PortRecv = 34,
    MsgRespond = 35,
    PortEvent = 36,
    Lookup = 37,
    Gettime = 38,
    Settime = 39,
    Sigaction = 40,
    SignalHandle = 41,
    SignalPost = 42,
    SignalMask = 43,
    SignalSuspend = 44,
    ThreadKill = 45,
    Openat = 46,
    Open = 47,
    Close = 48,
    Read = 49,
    Write = 50,
    Dup3 = 51,
    Seek = 52,
    Stat = 53,
    Ioctl = 54,
    Poll = 55,
    Socket = 56,
    Bind = 57,
    Connect = 58,
    Listen = 59,
    Accept4 = 60,
    Sendmsg = 61,
    Recvmsg = 62,
    Getsockopt = 63,
    Setsockopt = 64,
    Shutdown = 65,
}

impl fmt::Display for SyscallNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SYSCALLS[*self as usize].name)
    }
}

// ============================================================================
// Kernel
// ============================================================================

/// What a finished dispatch means for the trap return path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Hand this word back to user mode.
    Return(i64),
    /// The calling thread was terminated at the checkpoint; there is no
    /// result and nothing to return to.
    Exited,
}

pub struct Kernel {
    procs: Mutex<HashMap<Pid, Arc<Process>>>,
    threads: Mutex<HashMap<Tid, Arc<Thread>>>,
    /// System-wide port registry, keyed by port id.
    ports: Mutex<HashMap<u32, Arc<Port>>>,
    next_pid: AtomicU32,
    next_tid: AtomicU32,
    next_port: AtomicU32,
    pub clock: Clock,
    files: Box<dyn FileOps>,
    net: Box<dyn NetOps>,
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_ops(Box::new(NullFileOps), Box::new(NullNetOps))
    }

    pub fn with_ops(files: Box<dyn FileOps>, net: Box<dyn NetOps>) -> Self {
        log::debug!("syscall table ready, {} entries", SYSCALLS.len());
        Self {
            procs: Mutex::new(HashMap::new()),
            threads: Mutex::new(HashMap::new()),
            ports: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1),
            next_tid: AtomicU32::new(1),
            next_port: AtomicU32::new(1),
            clock: Clock::new(),
            files,
            net,
        }
    }

    // ========== process / thread lifecycle ==========

    pub fn spawn_process(&self, name: &str, parent: Option<Pid>) -> Arc<Process> {
        let pid = Pid(self.next_pid.fetch_add(1, Ordering::SeqCst));
        let proc = Process::new(pid, parent.unwrap_or(pid), name);
        if let Some(ppid) = parent {
            if let Ok(parent_proc) = self.process(ppid) {
                parent_proc.add_child(pid);
            }
        }
        lock(&self.procs).insert(pid, proc.clone());
        proc
    }

    pub fn spawn_thread(&self, pid: Pid) -> Result<Arc<Thread>> {
        let proc = self.process(pid)?;
        let tid = Tid(self.next_tid.fetch_add(1, Ordering::SeqCst));
        let (mask, trampoline) = proc.signal_defaults();
        let thread = Thread::new(tid, pid, mask, trampoline);
        proc.add_thread(thread.clone());
        lock(&self.threads).insert(tid, thread.clone());
        Ok(thread)
    }

    /// Lookup-acquire a process reference. Dropping the returned `Arc` is
    /// the release.
    pub fn process(&self, pid: Pid) -> Result<Arc<Process>> {
        lock(&self.procs)
            .get(&pid)
            .cloned()
            .ok_or(Error::InvalidArgument)
    }

    /// Lookup-acquire a thread reference.
    pub fn thread(&self, tid: Tid) -> Result<Arc<Thread>> {
        lock(&self.threads)
            .get(&tid)
            .cloned()
            .ok_or(Error::InvalidArgument)
    }

    pub fn port_by_id(&self, id: u32) -> Result<Arc<Port>> {
        lock(&self.ports)
            .get(&id)
            .cloned()
            .ok_or(Error::InvalidArgument)
    }

    // ========== dispatch ==========

    /// Entry point from the trap path.
    pub fn dispatch(&self, tid: Tid, nr: u32, ustack: u64) -> Dispatch {
        let Ok(thread) = self.thread(tid) else {
            return Dispatch::Return(Error::InvalidArgument.code());
        };
        let Some(entry) = SYSCALLS.get(nr as usize) else {
            // Out-of-range numbers invoke nothing, checkpoint included.
            log::warn!("thread {} invoked bad syscall {}", tid, nr);
            return Dispatch::Return(Error::InvalidArgument.code());
        };
        log::trace!("pid {} tid {}: {}", thread.pid, tid, entry.name);
        let ret = errno::encode(self.invoke(entry, &thread, ustack));
        self.checkpoint(&thread, ret)
    }

    fn invoke(&self, entry: &SyscallEntry, thread: &Arc<Thread>, ustack: u64) -> Result<i64> {
        let proc = self.process(thread.pid)?;
        // One copy of the argument window; the buffer is caller-owned and
        // never retained past this call.
        let window = proc.mem.read_window(ustack, ARG_WINDOW)?;
        let mut args = Args::new(&window);
        (entry.handler)(self, thread, &mut args)
    }

    /// The single deferred-action checkpoint on the way back to user mode.
    fn checkpoint(&self, thread: &Arc<Thread>, ret: i64) -> Dispatch {
        loop {
            if thread.exit_pending() {
                self.reap_thread(thread);
                return Dispatch::Exited;
            }
            if thread.stop_pending() {
                thread.park_while_stopped();
                continue;
            }
            return Dispatch::Return(ret);
        }
    }

    fn reap_thread(&self, thread: &Arc<Thread>) {
        lock(&self.threads).remove(&thread.tid);
        let Ok(proc) = self.process(thread.pid) else {
            return;
        };
        log::debug!("thread {} of {} ({}) ended", thread.tid, proc.pid, proc.name);
        let outcome = proc.remove_thread(thread.tid);
        if outcome.zombified {
            for res in outcome.resources {
                self.release_resource(proc.pid, res);
            }
            if proc.ppid != proc.pid {
                if let Ok(parent) = self.process(proc.ppid) {
                    parent.wake_wait_waiters();
                }
            }
        }
    }

    /// Close a resource leaving `pid`'s handle table. Mutexes and condition
    /// variables are process-local and die with their handle. A port dies
    /// only with its owning process: a handle attached through portGet is
    /// just dropped, leaving the owner's endpoint live.
    fn release_resource(&self, pid: Pid, res: Resource) {
        match res {
            Resource::Mutex(m) => m.close(),
            Resource::Cond(c) => c.close(),
            Resource::Port(p) => {
                if p.owner == pid {
                    p.close();
                    lock(&self.ports).remove(&p.id);
                }
            }
        }
    }

    // ========== signal posting (also the surface process teardown uses) ==========

    /// Resolve and deliver. Every acquired reference is released on every
    /// path - the `Arc`s drop at scope end, errors included.
    pub fn signal_post(&self, pid: i32, tid: i32, sig: u32) -> Result<()> {
        if pid < 0 || sig as usize >= NSIG {
            return Err(Error::InvalidArgument);
        }
        let proc = self.process(Pid(pid as u32))?;
        if tid >= 0 {
            let thread = self.thread(Tid(tid as u32))?;
            if thread.pid != proc.pid {
                return Err(Error::InvalidArgument);
            }
            if sig != 0 {
                signal::deliver(&thread, sig);
            }
        } else if sig != 0 {
            signal::deliver_process(&proc.threads(), sig);
        }
        // Nudge the CPU so the target's checkpoint flags are seen promptly.
        std::thread::yield_now();
        Ok(())
    }

    // ========== waitpid / thread join ==========

    fn waitpid(&self, thread: &Arc<Thread>, pid: i32, stat_ptr: u64, options: u32) -> Result<i64> {
        let parent = self.process(thread.pid)?;
        if stat_ptr != 0 {
            // Reaping is irreversible; fault on the status pointer before
            // any child is taken. The arena never shrinks, so the range
            // stays valid for the write below.
            parent.mem.check(stat_ptr, std::mem::size_of::<i32>())?;
        }
        loop {
            // Register before scanning so a child zombifying in between
            // leaves a wake token the park below will consume.
            parent.add_wait_waiter(thread.clone());
            let scan = (|| -> Option<Result<i64>> {
                let children = parent.children();
                let matching: Vec<Pid> = children
                    .into_iter()
                    .filter(|c| pid <= 0 || c.0 == pid as u32)
                    .collect();
                if matching.is_empty() {
                    return Some(Err(Error::NoChild));
                }
                for child_pid in matching {
                    let Ok(child) = self.process(child_pid) else {
                        continue;
                    };
                    if let Some(status) = child.zombie_status() {
                        parent.remove_child(child_pid);
                        lock(&self.procs).remove(&child_pid);
                        if stat_ptr != 0 {
                            if let Err(e) = parent.mem.write_pod(stat_ptr, &status) {
                                return Some(Err(e));
                            }
                        }
                        return Some(Ok(child_pid.0 as i64));
                    }
                }
                None
            })();
            match scan {
                Some(result) => {
                    parent.remove_wait_waiter(thread.tid);
                    return result;
                }
                None if options & WNOHANG != 0 => {
                    parent.remove_wait_waiter(thread.tid);
                    return Ok(0);
                }
                None => {}
            }
            let wake = thread.park(None);
            parent.remove_wait_waiter(thread.tid);
            if wake == Wake::Interrupted {
                return Err(Error::Interrupted);
            }
        }
    }

    fn thread_join(&self, thread: &Arc<Thread>, timeout_us: u64) -> Result<i64> {
        let proc = self.process(thread.pid)?;
        let deadline = if timeout_us == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_micros(timeout_us))
        };
        loop {
            proc.add_join_waiter(thread.clone());
            if let Some(tid) = proc.pop_dead_thread() {
                proc.remove_join_waiter(thread.tid);
                return Ok(tid.0 as i64);
            }
            let wake = thread.park(deadline);
            proc.remove_join_waiter(thread.tid);
            match wake {
                Wake::Interrupted => return Err(Error::Interrupted),
                Wake::TimedOut => return Err(Error::TimedOut),
                Wake::Woken => {}
            }
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Syscall table
// ============================================================================

pub type SyscallFn = fn(&Kernel, &Arc<Thread>, &mut Args<'_>) -> Result<i64>;

pub struct SyscallEntry {
    pub name: &'static str,
    pub handler: SyscallFn,
}

macro_rules! syscall_table {
    ($(($name:ident, $handler:expr)),* $(,)?) => {
        &[ $( SyscallEntry { name: stringify!($name), handler: $handler } ),* ]
    };
}

/// The immutable table. Built at compile time, indexed by syscall number,
/// never mutated - its length is the sole bound on valid numbers.
pub static SYSCALLS: &[SyscallEntry] = syscall_table![
    (debug, sys_debug),
    (memMap, sys_mem_map),
    (memUnmap, sys_mem_unmap),
    (vforksvc, sys_stub),
    (fork, sys_stub),
    (release, sys_stub),
    (spawn, sys_stub),
    (exec, sys_stub),
    (exit, sys_exit),
    (waitpid, sys_waitpid),
    (threadJoin, sys_thread_join),
    (getpid, sys_getpid),
    (getppid, sys_getppid),
    (gettid, sys_gettid),
    (beginthread, sys_stub),
    (endthread, sys_endthread),
    (usleep, sys_usleep),
    (priority, sys_priority),
    (threadsInfo, sys_threads_info),
    (memInfo, sys_mem_info),
    (interrupt, sys_stub),
    (mutexCreate, sys_mutex_create),
    (mutexLock, sys_mutex_lock),
    (mutexTry, sys_mutex_try),
    (mutexUnlock, sys_mutex_unlock),
    (condCreate, sys_cond_create),
    (condWait, sys_cond_wait),
    (condSignal, sys_cond_signal),
    (condBroadcast, sys_cond_broadcast),
    (resourceDestroy, sys_resource_destroy),
    (portCreate, sys_port_create),
    (portGet, sys_port_get),
    (portRegister, sys_stub),
    (msgSend, sys_msg_send),
    (portRecv, sys_port_recv),
    (msgRespond, sys_msg_respond),
    (portEvent, sys_port_event),
    (lookup, sys_stub),
    (gettime, sys_gettime),
    (settime, sys_settime),
    (sigaction, sys_sigaction),
    (signalHandle, sys_signal_handle),
    (signalPost, sys_signal_post),
    (signalMask, sys_signal_mask),
    (signalSuspend, sys_signal_suspend),
    (threadKill, sys_thread_kill),
    (openat, sys_openat),
    (open, sys_open),
    (close, sys_close),
    (read, sys_read),
    (write, sys_write),
    (dup3, sys_dup3),
    (seek, sys_seek),
    (stat, sys_stat),
    (ioctl, sys_ioctl),
    (poll, sys_poll),
    (socket, sys_socket),
    (bind, sys_bind),
    (connect, sys_connect),
    (listen, sys_listen),
    (accept4, sys_accept4),
    (sendmsg, sys_sendmsg),
    (recvmsg, sys_recvmsg),
    (getsockopt, sys_getsockopt),
    (setsockopt, sys_setsockopt),
    (shutdown, sys_shutdown),
];

// ============================================================================
// Handlers - misc bookkeeping
// ============================================================================

/// Placeholder entries: reachable, inert, number-stable.
fn sys_stub(_k: &Kernel, _t: &Arc<Thread>, _args: &mut Args<'_>) -> Result<i64> {
    Err(Error::NotImplemented)
}

fn sys_debug(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let ptr: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    let text = proc.mem.read_cstr(ptr, 256)?;
    log::info!(target: "user", "[{}] {}", proc.pid, text);
    Ok(EOK)
}

fn sys_mem_map(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let size: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    let addr = proc.mem.map(size as usize)?;
    Ok(addr as i64)
}

fn sys_mem_unmap(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let addr: u64 = args.next()?;
    let size: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    proc.mem.check(addr, size as usize)?;
    Ok(EOK)
}

fn sys_exit(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let status: i32 = args.next()?;
    let proc = k.process(t.pid)?;
    proc.mark_exiting(status);
    for thread in proc.threads() {
        thread.request_exit();
    }
    // Unreachable by the caller: the checkpoint ends this thread first.
    Ok(EOK)
}

fn sys_waitpid(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let pid: i32 = args.next()?;
    let stat_ptr: u64 = args.next()?;
    let options: u32 = args.next()?;
    k.waitpid(t, pid, stat_ptr, options)
}

fn sys_thread_join(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let timeout_us: u64 = args.next()?;
    k.thread_join(t, timeout_us)
}

fn sys_getpid(_k: &Kernel, t: &Arc<Thread>, _args: &mut Args<'_>) -> Result<i64> {
    Ok(t.pid.0 as i64)
}

fn sys_getppid(k: &Kernel, t: &Arc<Thread>, _args: &mut Args<'_>) -> Result<i64> {
    Ok(k.process(t.pid)?.ppid.0 as i64)
}

fn sys_gettid(_k: &Kernel, t: &Arc<Thread>, _args: &mut Args<'_>) -> Result<i64> {
    Ok(t.tid.0 as i64)
}

fn sys_endthread(_k: &Kernel, t: &Arc<Thread>, _args: &mut Args<'_>) -> Result<i64> {
    t.request_exit();
    Ok(EOK)
}

fn sys_usleep(_k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let us: u64 = args.next()?;
    let deadline = Instant::now() + Duration::from_micros(us);
    loop {
        match t.park(Some(deadline)) {
            Wake::TimedOut => return Ok(EOK),
            Wake::Interrupted => return Err(Error::Interrupted),
            // Stray token; sleep out the remainder.
            Wake::Woken => {}
        }
    }
}

fn sys_priority(_k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let p: i32 = args.next()?;
    match p {
        -1 => Ok(t.priority() as i64),
        0..=7 => {
            debug_assert!(p as u32 <= MAX_PRIORITY);
            t.set_priority(p as u32);
            Ok(EOK)
        }
        _ => Err(Error::InvalidArgument),
    }
}

/// Record layout for threadsInfo.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ThreadInfo {
    pub pid: u32,
    pub tid: u32,
    pub priority: u32,
    pub state: u32,
}

fn sys_threads_info(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let n: u32 = args.next()?;
    let ptr: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    let mut infos: Vec<ThreadInfo> = lock(&k.threads)
        .values()
        .map(|th| ThreadInfo {
            pid: th.pid.0,
            tid: th.tid.0,
            priority: th.priority(),
            state: th.state_word(),
        })
        .collect();
    infos.sort_unstable_by_key(|i| i.tid);
    infos.truncate(n as usize);
    let stride = std::mem::size_of::<ThreadInfo>() as u64;
    for (i, info) in infos.iter().enumerate() {
        proc.mem.write_pod(ptr + i as u64 * stride, info)?;
    }
    Ok(infos.len() as i64)
}

/// Record layout for memInfo.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MemInfo {
    pub used: u64,
    pub limit: u64,
}

fn sys_mem_info(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let ptr: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    let info = MemInfo {
        used: proc.mem.used() as u64,
        limit: super::mem::ARENA_LIMIT as u64,
    };
    proc.mem.write_pod(ptr, &info)?;
    Ok(EOK)
}

fn sys_gettime(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let raw_ptr: u64 = args.next()?;
    let offs_ptr: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    if raw_ptr != 0 {
        proc.mem.write_pod(raw_ptr, &k.clock.raw_us())?;
    }
    if offs_ptr != 0 {
        proc.mem.write_pod(offs_ptr, &k.clock.offs_us())?;
    }
    Ok(EOK)
}

fn sys_settime(k: &Kernel, _t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let offs: i64 = args.next()?;
    k.clock.set_offs_us(offs);
    Ok(EOK)
}

// ============================================================================
// Handlers - mutexes / condition variables / generic destroy
// ============================================================================

fn sys_mutex_create(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let hptr: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    let h = proc.handle_alloc(Resource::Mutex(KMutex::new()))?;
    if let Err(e) = proc.mem.write_pod(hptr, &h) {
        let _ = proc.destroy_handle(h);
        return Err(e);
    }
    Ok(EOK)
}

fn sys_mutex_lock(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let h: u32 = args.next()?;
    let mutex = k.process(t.pid)?.mutex(h)?;
    mutex.lock(t)?;
    Ok(EOK)
}

fn sys_mutex_try(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let h: u32 = args.next()?;
    let mutex = k.process(t.pid)?.mutex(h)?;
    mutex.try_lock(t)?;
    Ok(EOK)
}

fn sys_mutex_unlock(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let h: u32 = args.next()?;
    let mutex = k.process(t.pid)?.mutex(h)?;
    mutex.unlock(t)?;
    Ok(EOK)
}

fn sys_cond_create(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let hptr: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    let h = proc.handle_alloc(Resource::Cond(KCond::new()))?;
    if let Err(e) = proc.mem.write_pod(hptr, &h) {
        let _ = proc.destroy_handle(h);
        return Err(e);
    }
    Ok(EOK)
}

fn sys_cond_wait(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let ch: u32 = args.next()?;
    let mh: u32 = args.next()?;
    let timeout_us: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    let cond = proc.cond(ch)?;
    let mutex = proc.mutex(mh)?;
    cond.wait(t, &mutex, timeout_us)?;
    Ok(EOK)
}

fn sys_cond_signal(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let h: u32 = args.next()?;
    k.process(t.pid)?.cond(h)?.signal();
    Ok(EOK)
}

fn sys_cond_broadcast(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let h: u32 = args.next()?;
    k.process(t.pid)?.cond(h)?.broadcast();
    Ok(EOK)
}

fn sys_resource_destroy(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let h: u32 = args.next()?;
    let proc = k.process(t.pid)?;
    let res = proc.destroy_handle(h)?;
    k.release_resource(proc.pid, res);
    Ok(EOK)
}

// ============================================================================
// Handlers - ports / messages
// ============================================================================

fn sys_port_create(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let id_ptr: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    let id = k.next_port.fetch_add(1, Ordering::SeqCst);
    let port = Port::new(id, proc.pid);
    let h = proc.handle_alloc(Resource::Port(port.clone()))?;
    if let Err(e) = proc.mem.write_pod(id_ptr, &id) {
        let _ = proc.destroy_handle(h);
        return Err(e);
    }
    lock(&k.ports).insert(id, port);
    Ok(h as i64)
}

fn sys_port_get(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let id: u32 = args.next()?;
    let proc = k.process(t.pid)?;
    let port = k.port_by_id(id)?;
    let h = proc.handle_alloc(Resource::Port(port))?;
    Ok(h as i64)
}

fn sys_msg_send(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let h: u32 = args.next()?;
    let msg_ptr: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    let port = proc.port(h)?;
    let mut msg: Msg = proc.mem.read_pod(msg_ptr)?;
    let code = port.send(t, &mut msg)?;
    proc.mem.write_pod(msg_ptr, &msg)?;
    Ok(code as i64)
}

fn sys_port_recv(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let h: u32 = args.next()?;
    let msg_ptr: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    // Validate the destination before blocking, not after.
    proc.mem.check(msg_ptr, std::mem::size_of::<Msg>())?;
    let port = proc.port(h)?;
    let msg = port.recv(t)?;
    proc.mem.write_pod(msg_ptr, &msg)?;
    Ok(EOK)
}

fn sys_msg_respond(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let h: u32 = args.next()?;
    let err: i32 = args.next()?;
    let msg_ptr: u64 = args.next()?;
    let msg_handle: u32 = args.next()?;
    let proc = k.process(t.pid)?;
    let port = proc.port(h)?;
    let msg: Msg = proc.mem.read_pod(msg_ptr)?;
    port.respond(msg_handle, err, msg.output)?;
    Ok(EOK)
}

fn sys_port_event(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let h: u32 = args.next()?;
    let id: u64 = args.next()?;
    let events: u32 = args.next()?;
    let port = k.process(t.pid)?.port(h)?;
    port.post_event(id, events)?;
    Ok(EOK)
}

// ============================================================================
// Handlers - signals
// ============================================================================

fn sys_sigaction(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let sig: i32 = args.next()?;
    let act_ptr: u64 = args.next()?;
    let oact_ptr: u64 = args.next()?;
    if sig <= 0 || sig as usize >= NSIG {
        return Err(Error::InvalidArgument);
    }
    let proc = k.process(t.pid)?;
    let new = if act_ptr != 0 {
        Some(proc.mem.read_pod::<SigAction>(act_ptr)?)
    } else {
        None
    };
    let old = proc.sigaction(sig as usize, new)?;
    if oact_ptr != 0 {
        proc.mem.write_pod(oact_ptr, &old)?;
    }
    Ok(EOK)
}

fn sys_signal_handle(_k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let trampoline: u64 = args.next()?;
    let mask: u32 = args.next()?;
    let sel: u32 = args.next()?;
    t.set_trampoline(trampoline);
    t.merge_sigmask(mask, sel);
    Ok(EOK)
}

fn sys_signal_post(k: &Kernel, _t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let pid: i32 = args.next()?;
    let tid: i32 = args.next()?;
    let sig: u32 = args.next()?;
    k.signal_post(pid, tid, sig)?;
    Ok(EOK)
}

fn sys_signal_mask(_k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let mask: u32 = args.next()?;
    let sel: u32 = args.next()?;
    Ok(t.merge_sigmask(mask, sel) as i64)
}

fn sys_signal_suspend(_k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let mask: u32 = args.next()?;
    let old = t.set_sigmask(mask);
    loop {
        // A pending signal the new mask exposes ends the suspend at once.
        if t.pending_signals() & !mask != 0 {
            break;
        }
        if t.park(None) == Wake::Interrupted {
            break;
        }
        // Any other wakeup keeps suspending; only a signal may end it.
    }
    t.set_sigmask(old);
    Err(Error::Interrupted)
}

fn sys_thread_kill(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    // Same resolution and delivery path as signalPost.
    sys_signal_post(k, t, args)
}

// ============================================================================
// Handlers - file descriptors (marshal and forward)
// ============================================================================

fn sys_openat(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let dirfd: i32 = args.next()?;
    let path_ptr: u64 = args.next()?;
    let flags: u32 = args.next()?;
    let mode: u32 = args.next()?;
    let proc = k.process(t.pid)?;
    let path = proc.mem.read_cstr(path_ptr, 1024)?;
    Ok(k.files.open(dirfd, &path, flags, mode)? as i64)
}

fn sys_open(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let path_ptr: u64 = args.next()?;
    let flags: u32 = args.next()?;
    let mode: u32 = args.next()?;
    let proc = k.process(t.pid)?;
    let path = proc.mem.read_cstr(path_ptr, 1024)?;
    Ok(k.files.open(AT_FDCWD, &path, flags, mode)? as i64)
}

fn sys_close(k: &Kernel, _t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    k.files.close(fd)?;
    Ok(EOK)
}

fn sys_read(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let buf_ptr: u64 = args.next()?;
    let len: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    proc.mem.check(buf_ptr, len as usize)?;
    let mut buf = vec![0u8; len as usize];
    let n = k.files.read(fd, &mut buf)?;
    proc.mem.write(buf_ptr, &buf[..n.max(0) as usize])?;
    Ok(n)
}

fn sys_write(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let buf_ptr: u64 = args.next()?;
    let len: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    let buf = proc.mem.read(buf_ptr, len as usize)?;
    Ok(k.files.write(fd, &buf)?)
}

fn sys_dup3(k: &Kernel, _t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let old_fd: i32 = args.next()?;
    let new_fd: i32 = args.next()?;
    let flags: u32 = args.next()?;
    Ok(k.files.dup(old_fd, new_fd, flags)? as i64)
}

fn sys_seek(k: &Kernel, _t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let offset: i64 = args.next()?;
    let whence: i32 = args.next()?;
    Ok(k.files.seek(fd, offset, whence)?)
}

fn sys_stat(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let stat_ptr: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    let st: FileStat = k.files.stat(fd)?;
    proc.mem.write_pod(stat_ptr, &st)?;
    Ok(EOK)
}

fn sys_ioctl(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let request: u64 = args.next()?;
    let arg_ptr: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    let mut arg = if arg_ptr != 0 {
        proc.mem.read_window(arg_ptr, IOCTL_ARG)?
    } else {
        Vec::new()
    };
    let ret = k.files.ioctl(fd, request, &mut arg)?;
    if arg_ptr != 0 {
        proc.mem.write(arg_ptr, &arg)?;
    }
    Ok(ret)
}

fn sys_poll(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fds_ptr: u64 = args.next()?;
    let nfds: u32 = args.next()?;
    let timeout_ms: i32 = args.next()?;
    if nfds as usize > MAX_POLL_FDS {
        return Err(Error::InvalidArgument);
    }
    let proc = k.process(t.pid)?;
    let stride = std::mem::size_of::<PollFd>() as u64;
    let mut fds = Vec::with_capacity(nfds as usize);
    for i in 0..nfds as u64 {
        fds.push(proc.mem.read_pod::<PollFd>(fds_ptr + i * stride)?);
    }
    let ready = k.files.poll(&mut fds, timeout_ms)?;
    for (i, slot) in fds.iter().enumerate() {
        proc.mem.write_pod(fds_ptr + i as u64 * stride, slot)?;
    }
    Ok(ready)
}

// ============================================================================
// Handlers - network (marshal and forward)
// ============================================================================

fn sys_socket(k: &Kernel, _t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let domain: i32 = args.next()?;
    let ty: i32 = args.next()?;
    let protocol: i32 = args.next()?;
    Ok(k.net.socket(domain, ty, protocol)? as i64)
}

fn read_addr(k: &Kernel, t: &Arc<Thread>, addr_ptr: u64, len: u64) -> Result<Vec<u8>> {
    if len as usize > MAX_ADDR_LEN {
        return Err(Error::InvalidArgument);
    }
    k.process(t.pid)?.mem.read(addr_ptr, len as usize)
}

fn sys_bind(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let addr_ptr: u64 = args.next()?;
    let len: u64 = args.next()?;
    let addr = read_addr(k, t, addr_ptr, len)?;
    k.net.bind(fd, &addr)?;
    Ok(EOK)
}

fn sys_connect(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let addr_ptr: u64 = args.next()?;
    let len: u64 = args.next()?;
    let addr = read_addr(k, t, addr_ptr, len)?;
    k.net.connect(fd, &addr)?;
    Ok(EOK)
}

fn sys_listen(k: &Kernel, _t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let backlog: i32 = args.next()?;
    k.net.listen(fd, backlog)?;
    Ok(EOK)
}

fn sys_accept4(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let addr_ptr: u64 = args.next()?;
    let len_ptr: u64 = args.next()?;
    let flags: u32 = args.next()?;
    let proc = k.process(t.pid)?;
    let (new_fd, addr) = k.net.accept(fd, flags)?;
    if addr_ptr != 0 && len_ptr != 0 {
        let cap: u64 = proc.mem.read_pod(len_ptr)?;
        let n = addr.len().min(cap as usize);
        proc.mem.write(addr_ptr, &addr[..n])?;
        proc.mem.write_pod(len_ptr, &(n as u64))?;
    }
    Ok(new_fd as i64)
}

fn sys_sendmsg(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let buf_ptr: u64 = args.next()?;
    let len: u64 = args.next()?;
    let flags: u32 = args.next()?;
    let buf = k.process(t.pid)?.mem.read(buf_ptr, len as usize)?;
    Ok(k.net.send(fd, &buf, flags)?)
}

fn sys_recvmsg(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let buf_ptr: u64 = args.next()?;
    let len: u64 = args.next()?;
    let flags: u32 = args.next()?;
    let proc = k.process(t.pid)?;
    proc.mem.check(buf_ptr, len as usize)?;
    let mut buf = vec![0u8; len as usize];
    let n = k.net.recv(fd, &mut buf, flags)?;
    proc.mem.write(buf_ptr, &buf[..n.max(0) as usize])?;
    Ok(n)
}

fn sys_getsockopt(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let level: i32 = args.next()?;
    let opt: i32 = args.next()?;
    let val_ptr: u64 = args.next()?;
    let len_ptr: u64 = args.next()?;
    let proc = k.process(t.pid)?;
    let val = k.net.getsockopt(fd, level, opt)?;
    let cap: u64 = proc.mem.read_pod(len_ptr)?;
    let n = val.len().min(cap as usize);
    proc.mem.write(val_ptr, &val[..n])?;
    proc.mem.write_pod(len_ptr, &(n as u64))?;
    Ok(EOK)
}

fn sys_setsockopt(k: &Kernel, t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let level: i32 = args.next()?;
    let opt: i32 = args.next()?;
    let val_ptr: u64 = args.next()?;
    let len: u64 = args.next()?;
    let val = read_addr(k, t, val_ptr, len)?;
    k.net.setsockopt(fd, level, opt, &val)?;
    Ok(EOK)
}

fn sys_shutdown(k: &Kernel, _t: &Arc<Thread>, args: &mut Args<'_>) -> Result<i64> {
    let fd: i32 = args.next()?;
    let how: i32 = args.next()?;
    k.net.shutdown(fd, how)?;
    Ok(EOK)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::arg::ArgWriter;

    fn setup() -> (Arc<Kernel>, Arc<Process>, Arc<Thread>) {
        let k = Arc::new(Kernel::new());
        let proc = k.spawn_process("test", None);
        let thread = k.spawn_thread(proc.pid).unwrap();
        (k, proc, thread)
    }

    /// Pack `args` into the process arena and dispatch, expecting the
    /// thread to survive the checkpoint.
    fn call(k: &Kernel, proc: &Process, t: &Arc<Thread>, nr: SyscallNr, args: Vec<u8>) -> i64 {
        let addr = proc.mem.map(args.len().max(8)).unwrap();
        proc.mem.write(addr, &args).unwrap();
        match k.dispatch(t.tid, nr as u32, addr) {
            Dispatch::Return(v) => v,
            Dispatch::Exited => panic!("thread exited during {:?}", nr),
        }
    }

    fn no_args() -> Vec<u8> {
        Vec::new()
    }

    #[test]
    fn test_bad_syscall_number() {
        let (k, proc, t) = setup();
        let addr = proc.mem.map(8).unwrap();
        let nr = SYSCALLS.len() as u32;
        assert_eq!(k.dispatch(t.tid, nr, addr), Dispatch::Return(-22));
        assert_eq!(k.dispatch(t.tid, u32::MAX, addr), Dispatch::Return(-22));
    }

    #[test]
    fn test_placeholders_inert_at_stable_slots() {
        let (k, proc, t) = setup();
        for nr in [
            SyscallNr::Vforksvc,
            SyscallNr::Fork,
            SyscallNr::BeginThread,
            SyscallNr::PortRegister,
            SyscallNr::Lookup,
        ] {
            assert_eq!(call(&k, &proc, &t, nr, no_args()), -38);
        }
    }

    #[test]
    fn test_table_order_matches_numbers() {
        assert_eq!(SYSCALLS[SyscallNr::Debug as usize].name, "debug");
        assert_eq!(SYSCALLS[SyscallNr::MutexCreate as usize].name, "mutexCreate");
        assert_eq!(SYSCALLS[SyscallNr::MsgRespond as usize].name, "msgRespond");
        assert_eq!(SYSCALLS[SyscallNr::SignalSuspend as usize].name, "signalSuspend");
        assert_eq!(SYSCALLS[SyscallNr::Shutdown as usize].name, "shutdown");
        assert_eq!(SYSCALLS.len(), 66);
    }

    #[test]
    fn test_identity_syscalls() {
        let (k, proc, t) = setup();
        assert_eq!(
            call(&k, &proc, &t, SyscallNr::Getpid, no_args()),
            proc.pid.0 as i64
        );
        assert_eq!(
            call(&k, &proc, &t, SyscallNr::Gettid, no_args()),
            t.tid.0 as i64
        );
        // No parent: ppid == pid.
        assert_eq!(
            call(&k, &proc, &t, SyscallNr::Getppid, no_args()),
            proc.pid.0 as i64
        );
    }

    #[test]
    fn test_priority_query_set_reject() {
        let (k, proc, t) = setup();
        let query = ArgWriter::new().push(-1i32).finish();
        let initial = call(&k, &proc, &t, SyscallNr::Priority, query.clone());
        assert_eq!(initial, 4);
        let set = ArgWriter::new().push(6i32).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Priority, set), 0);
        assert_eq!(call(&k, &proc, &t, SyscallNr::Priority, query), 6);
        let bad = ArgWriter::new().push(8i32).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Priority, bad), -22);
    }

    #[test]
    fn test_gettime_settime() {
        let (k, proc, t) = setup();
        let raw_ptr = proc.mem.map(16).unwrap();
        let offs_ptr = raw_ptr + 8;
        let set = ArgWriter::new().push(123_456i64).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Settime, set), 0);
        let get = ArgWriter::new().push(raw_ptr).push(offs_ptr).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Gettime, get), 0);
        assert_eq!(proc.mem.read_pod::<i64>(offs_ptr).unwrap(), 123_456);
        // Null pointers are skipped, not faults.
        let get_none = ArgWriter::new().push(0u64).push(0u64).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Gettime, get_none), 0);
    }

    #[test]
    fn test_usleep_expires() {
        let (k, proc, t) = setup();
        let args = ArgWriter::new().push(1_000u64).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Usleep, args), 0);
    }

    #[test]
    fn test_mutex_lifecycle_via_syscalls() {
        let (k, proc, t) = setup();
        let hptr = proc.mem.map(4).unwrap();
        let create = ArgWriter::new().push(hptr).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::MutexCreate, create), 0);
        let h: u32 = proc.mem.read_pod(hptr).unwrap();

        let by_handle = ArgWriter::new().push(h).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::MutexLock, by_handle.clone()), 0);
        assert_eq!(call(&k, &proc, &t, SyscallNr::MutexUnlock, by_handle.clone()), 0);
        assert_eq!(call(&k, &proc, &t, SyscallNr::ResourceDestroy, by_handle.clone()), 0);
        // Destroyed: every further operation sees an invalid handle.
        assert_eq!(call(&k, &proc, &t, SyscallNr::MutexLock, by_handle.clone()), -22);
        assert_eq!(call(&k, &proc, &t, SyscallNr::ResourceDestroy, by_handle), -22);
    }

    #[test]
    fn test_unlock_without_ownership() {
        let (k, proc, t) = setup();
        let t2 = k.spawn_thread(proc.pid).unwrap();
        let hptr = proc.mem.map(4).unwrap();
        let create = ArgWriter::new().push(hptr).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::MutexCreate, create), 0);
        let h: u32 = proc.mem.read_pod(hptr).unwrap();
        let by_handle = ArgWriter::new().push(h).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::MutexLock, by_handle.clone()), 0);
        assert_eq!(call(&k, &proc, &t2, SyscallNr::MutexUnlock, by_handle), -1);
    }

    #[test]
    fn test_cond_wait_timeout_via_syscalls() {
        let (k, proc, t) = setup();
        let ptrs = proc.mem.map(8).unwrap();
        let create_m = ArgWriter::new().push(ptrs).finish();
        let create_c = ArgWriter::new().push(ptrs + 4).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::MutexCreate, create_m), 0);
        assert_eq!(call(&k, &proc, &t, SyscallNr::CondCreate, create_c), 0);
        let mh: u32 = proc.mem.read_pod(ptrs).unwrap();
        let ch: u32 = proc.mem.read_pod(ptrs + 4).unwrap();

        let lock_args = ArgWriter::new().push(mh).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::MutexLock, lock_args), 0);
        let wait = ArgWriter::new().push(ch).push(mh).push(5_000u64).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::CondWait, wait), -62);
        // Timeout reacquired the mutex; unlock must succeed.
        let unlock = ArgWriter::new().push(mh).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::MutexUnlock, unlock), 0);
    }

    #[test]
    fn test_handle_cross_kind_rejected() {
        let (k, proc, t) = setup();
        let hptr = proc.mem.map(4).unwrap();
        let create = ArgWriter::new().push(hptr).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::CondCreate, create), 0);
        let ch: u32 = proc.mem.read_pod(hptr).unwrap();
        let lock_cond = ArgWriter::new().push(ch).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::MutexLock, lock_cond), -22);
    }

    #[test]
    fn test_signal_mask_merge_via_syscall() {
        let (k, proc, t) = setup();
        t.set_sigmask(0b1100);
        let args = ArgWriter::new().push(0b1010u32).push(0b0110u32).finish();
        let old = call(&k, &proc, &t, SyscallNr::SignalMask, args);
        assert_eq!(old, 0b1100);
        assert_eq!(t.sigmask(), 0b1010);
    }

    #[test]
    fn test_signal_handle_sets_trampoline_and_merges() {
        let (k, proc, t) = setup();
        let args = ArgWriter::new()
            .push(0x4000u64)
            .push(0xffu32)
            .push(0x0fu32)
            .finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::SignalHandle, args), 0);
        assert_eq!(t.trampoline(), 0x4000);
        assert_eq!(t.sigmask(), 0x0f);
    }

    #[test]
    fn test_sigaction_roundtrip() {
        let (k, proc, t) = setup();
        let act_ptr = proc.mem.map(32).unwrap();
        let oact_ptr = act_ptr + 16;
        let action = SigAction {
            handler: 0xbeef,
            mask: 0x3,
            flags: 1,
        };
        proc.mem.write_pod(act_ptr, &action).unwrap();
        let install = ArgWriter::new()
            .push(5i32)
            .push(act_ptr)
            .push(0u64)
            .finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Sigaction, install), 0);
        // Query returns what we installed.
        let query = ArgWriter::new()
            .push(5i32)
            .push(0u64)
            .push(oact_ptr)
            .finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Sigaction, query), 0);
        assert_eq!(proc.mem.read_pod::<SigAction>(oact_ptr).unwrap(), action);
        // Out-of-range signal.
        let bad = ArgWriter::new().push(99i32).push(0u64).push(0u64).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Sigaction, bad), -22);
    }

    #[test]
    fn test_signal_post_resolution_errors() {
        let (k, proc, t) = setup();
        // Unknown pid.
        let bad_pid = ArgWriter::new().push(999i32).push(-1i32).push(5u32).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::SignalPost, bad_pid), -22);
        // Unknown tid.
        let bad_tid = ArgWriter::new()
            .push(proc.pid.0 as i32)
            .push(999i32)
            .push(5u32)
            .finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::SignalPost, bad_tid), -22);
        // Thread of a different process.
        let other = k.spawn_process("other", None);
        let other_t = k.spawn_thread(other.pid).unwrap();
        let cross = ArgWriter::new()
            .push(proc.pid.0 as i32)
            .push(other_t.tid.0 as i32)
            .push(5u32)
            .finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::SignalPost, cross), -22);
    }

    #[test]
    fn test_signal_post_delivers_pending() {
        let (k, proc, t) = setup();
        let t2 = k.spawn_thread(proc.pid).unwrap();
        t2.set_sigmask(signal::sig_bit(5));
        let args = ArgWriter::new()
            .push(proc.pid.0 as i32)
            .push(t2.tid.0 as i32)
            .push(5u32)
            .finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::SignalPost, args), 0);
        assert_eq!(t2.pending_signals(), signal::sig_bit(5));
    }

    #[test]
    fn test_threads_info() {
        let (k, proc, t) = setup();
        let _t2 = k.spawn_thread(proc.pid).unwrap();
        let buf = proc.mem.map(64).unwrap();
        let args = ArgWriter::new().push(4u32).push(buf).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::ThreadsInfo, args), 2);
        let first: ThreadInfo = proc.mem.read_pod(buf).unwrap();
        assert_eq!(first.tid, t.tid.0);
        assert_eq!(first.pid, proc.pid.0);
    }

    #[test]
    fn test_mem_info_and_map() {
        let (k, proc, t) = setup();
        let map_args = ArgWriter::new().push(256u64).finish();
        let addr = call(&k, &proc, &t, SyscallNr::MemMap, map_args);
        assert!(addr > 0);
        proc.mem.write(addr as u64, &[1, 2, 3]).unwrap();
        let info_ptr = proc.mem.map(16).unwrap();
        let args = ArgWriter::new().push(info_ptr).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::MemInfo, args), 0);
        let info: MemInfo = proc.mem.read_pod(info_ptr).unwrap();
        assert!(info.used >= 256);
    }

    #[test]
    fn test_debug_rejects_wild_pointer() {
        let (k, proc, t) = setup();
        let args = ArgWriter::new().push(0xdead_0000u64).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Debug, args), -14);
    }

    #[test]
    fn test_file_syscalls_unsupported_without_fs() {
        let (k, proc, t) = setup();
        let path = proc.mem.map(8).unwrap();
        proc.mem.write(path, b"/x\0").unwrap();
        let args = ArgWriter::new().push(path).push(0u32).push(0u32).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Open, args), -25);
        let sock = ArgWriter::new().push(2i32).push(1i32).push(0i32).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Socket, sock), -25);
    }

    /// Records what reached the seam, proving the marshaler decoded the
    /// declared order and types.
    struct RecordingFs {
        calls: Mutex<Vec<String>>,
    }

    impl FileOps for RecordingFs {
        fn open(&self, dirfd: i32, path: &str, flags: u32, mode: u32) -> Result<i32> {
            lock(&self.calls).push(format!("open({},{},{:#x},{:o})", dirfd, path, flags, mode));
            Ok(7)
        }
        fn close(&self, fd: i32) -> Result<()> {
            lock(&self.calls).push(format!("close({})", fd));
            Ok(())
        }
        fn read(&self, _fd: i32, buf: &mut [u8]) -> Result<i64> {
            let msg = b"data";
            let n = msg.len().min(buf.len());
            buf[..n].copy_from_slice(&msg[..n]);
            Ok(n as i64)
        }
        fn write(&self, fd: i32, buf: &[u8]) -> Result<i64> {
            lock(&self.calls)
                .push(format!("write({},{})", fd, String::from_utf8_lossy(buf)));
            Ok(buf.len() as i64)
        }
        fn seek(&self, _fd: i32, offset: i64, whence: i32) -> Result<i64> {
            lock(&self.calls).push(format!("seek({},{})", offset, whence));
            Ok(offset)
        }
        fn stat(&self, _fd: i32) -> Result<FileStat> {
            Ok(FileStat {
                dev: 1,
                ino: 42,
                mode: 0o644,
                links: 1,
                size: 1000,
            })
        }
        fn ioctl(&self, _fd: i32, _request: u64, _arg: &mut [u8]) -> Result<i64> {
            Ok(0)
        }
        fn poll(&self, fds: &mut [PollFd], _timeout_ms: i32) -> Result<i64> {
            for f in fds.iter_mut() {
                f.revents = f.events;
            }
            Ok(fds.len() as i64)
        }
        fn dup(&self, old_fd: i32, _new_fd: i32, _flags: u32) -> Result<i32> {
            Ok(old_fd + 100)
        }
    }

    #[test]
    fn test_file_marshaling_order() {
        let k = Kernel::with_ops(
            Box::new(RecordingFs {
                calls: Mutex::new(Vec::new()),
            }),
            Box::new(NullNetOps),
        );
        let proc = k.spawn_process("test", None);
        let t = k.spawn_thread(proc.pid).unwrap();

        let path = proc.mem.map(16).unwrap();
        proc.mem.write(path, b"/etc/rc\0").unwrap();
        let open_args = ArgWriter::new()
            .push(5i32) // dirfd
            .push(path)
            .push(0x2u32) // flags
            .push(0o600u32)
            .finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Openat, open_args), 7);

        let data = proc.mem.map(16).unwrap();
        proc.mem.write(data, b"hi").unwrap();
        let write_args = ArgWriter::new().push(7i32).push(data).push(2u64).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Write, write_args), 2);

        let read_buf = proc.mem.map(16).unwrap();
        let read_args = ArgWriter::new().push(7i32).push(read_buf).push(4u64).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Read, read_args), 4);
        assert_eq!(proc.mem.read(read_buf, 4).unwrap(), b"data");

        let stat_ptr = proc.mem.map(32).unwrap();
        let stat_args = ArgWriter::new().push(7i32).push(stat_ptr).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Stat, stat_args), 0);
        assert_eq!(proc.mem.read_pod::<FileStat>(stat_ptr).unwrap().ino, 42);
    }

    #[test]
    fn test_port_create_get_event() {
        let (k, proc, t) = setup();
        let id_ptr = proc.mem.map(4).unwrap();
        let create = ArgWriter::new().push(id_ptr).finish();
        let h = call(&k, &proc, &t, SyscallNr::PortCreate, create);
        assert!(h > 0);
        let id: u32 = proc.mem.read_pod(id_ptr).unwrap();

        // Another process can reach the port by id.
        let other = k.spawn_process("client", None);
        let ot = k.spawn_thread(other.pid).unwrap();
        let get = ArgWriter::new().push(id).finish();
        let oh = call(&k, &other, &ot, SyscallNr::PortGet, get);
        assert!(oh > 0);

        let ev = ArgWriter::new().push(oh as u32).push(3u64).push(0x11u32).finish();
        assert_eq!(call(&k, &other, &ot, SyscallNr::PortEvent, ev), 0);
        let port = k.port_by_id(id).unwrap();
        assert_eq!(port.take_events(), vec![(3, 0x11)]);

        // Unknown id.
        let bad = ArgWriter::new().push(id + 100).finish();
        assert_eq!(call(&k, &other, &ot, SyscallNr::PortGet, bad), -22);
    }

    #[test]
    fn test_client_destroy_leaves_owner_port_alive() {
        let (k, server, st) = setup();
        let id_ptr = server.mem.map(4).unwrap();
        let create = ArgWriter::new().push(id_ptr).finish();
        let server_h = call(&k, &server, &st, SyscallNr::PortCreate, create);
        let id: u32 = server.mem.read_pod(id_ptr).unwrap();

        let client = k.spawn_process("client", None);
        let ct = k.spawn_thread(client.pid).unwrap();
        let get = ArgWriter::new().push(id).finish();
        let client_h = call(&k, &client, &ct, SyscallNr::PortGet, get);

        // A portGet handle dies alone: only the client's table entry goes.
        let destroy = ArgWriter::new().push(client_h as u32).finish();
        assert_eq!(call(&k, &client, &ct, SyscallNr::ResourceDestroy, destroy), 0);
        let ev = ArgWriter::new().push(server_h as u32).push(1u64).push(0x1u32).finish();
        assert_eq!(call(&k, &server, &st, SyscallNr::PortEvent, ev), 0);
        let stale = ArgWriter::new().push(client_h as u32).push(1u64).push(0x1u32).finish();
        assert_eq!(call(&k, &client, &ct, SyscallNr::PortEvent, stale), -22);
        assert!(k.port_by_id(id).is_ok());

        // The owner's destroy tears the port down for everyone.
        let sd = ArgWriter::new().push(server_h as u32).finish();
        assert_eq!(call(&k, &server, &st, SyscallNr::ResourceDestroy, sd), 0);
        assert!(k.port_by_id(id).is_err());
    }

    #[test]
    fn test_client_exit_leaves_owner_port_alive() {
        let (k, server, st) = setup();
        let id_ptr = server.mem.map(4).unwrap();
        let create = ArgWriter::new().push(id_ptr).finish();
        let server_h = call(&k, &server, &st, SyscallNr::PortCreate, create);
        let id: u32 = server.mem.read_pod(id_ptr).unwrap();

        let client = k.spawn_process("client", None);
        let ct = k.spawn_thread(client.pid).unwrap();
        let get = ArgWriter::new().push(id).finish();
        call(&k, &client, &ct, SyscallNr::PortGet, get);

        // Client teardown drains its table through the same release path.
        let addr = client.mem.map(8).unwrap();
        let exit_args = ArgWriter::new().push(0i32).finish();
        client.mem.write(addr, &exit_args).unwrap();
        assert_eq!(
            k.dispatch(ct.tid, SyscallNr::Exit as u32, addr),
            Dispatch::Exited
        );

        let ev = ArgWriter::new().push(server_h as u32).push(1u64).push(0x1u32).finish();
        assert_eq!(call(&k, &server, &st, SyscallNr::PortEvent, ev), 0);
        assert!(k.port_by_id(id).is_ok());
    }

    #[test]
    fn test_waitpid_bad_status_pointer_keeps_child() {
        let (k, parent, pt) = setup();
        let child = k.spawn_process("worker", Some(parent.pid));
        let ct = k.spawn_thread(child.pid).unwrap();
        let addr = child.mem.map(8).unwrap();
        let exit_args = ArgWriter::new().push(9i32).finish();
        child.mem.write(addr, &exit_args).unwrap();
        assert_eq!(
            k.dispatch(ct.tid, SyscallNr::Exit as u32, addr),
            Dispatch::Exited
        );

        // A wild status pointer faults before anything is reaped.
        let bad = ArgWriter::new()
            .push(child.pid.0 as i32)
            .push(0xdead_0000u64)
            .push(0u32)
            .finish();
        assert_eq!(call(&k, &parent, &pt, SyscallNr::Waitpid, bad), -14);
        assert!(k.process(child.pid).is_ok());

        // The zombie and its status are intact for a well-formed wait.
        let stat_ptr = parent.mem.map(4).unwrap();
        let good = ArgWriter::new()
            .push(child.pid.0 as i32)
            .push(stat_ptr)
            .push(0u32)
            .finish();
        assert_eq!(
            call(&k, &parent, &pt, SyscallNr::Waitpid, good),
            child.pid.0 as i64
        );
        assert_eq!(parent.mem.read_pod::<i32>(stat_ptr).unwrap(), 9);
    }

    #[test]
    fn test_endthread_never_returns() {
        let (k, proc, t) = setup();
        let addr = proc.mem.map(8).unwrap();
        assert_eq!(
            k.dispatch(t.tid, SyscallNr::EndThread as u32, addr),
            Dispatch::Exited
        );
        // The thread is gone from the table.
        assert!(k.thread(t.tid).is_err());
        let _ = proc;
    }

    #[test]
    fn test_waitpid_no_children() {
        let (k, proc, t) = setup();
        let args = ArgWriter::new().push(-1i32).push(0u64).push(0u32).finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Waitpid, args), -10);
    }

    #[test]
    fn test_waitpid_wnohang_with_live_child() {
        let (k, proc, t) = setup();
        let child = k.spawn_process("child", Some(proc.pid));
        let _ct = k.spawn_thread(child.pid).unwrap();
        let args = ArgWriter::new()
            .push(-1i32)
            .push(0u64)
            .push(WNOHANG)
            .finish();
        assert_eq!(call(&k, &proc, &t, SyscallNr::Waitpid, args), 0);
    }
}
