//! Message ports.
//!
//! A port is an addressable request/response endpoint. Senders block in
//! `send` until the receiving side answers with `respond`; the correlation
//! between a received message and its eventual response is an opaque
//! message handle assigned at receive time from a slab, whose slot lives
//! exactly as long as that one request/response pair.
//!
//! Ports also accumulate readiness events (`post_event`) for the poll
//! machinery layered above them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};
use slab::Slab;

use super::errno::{Error, Result};
use super::lock;
use super::proc::{Pid, Thread, Wake};

/// Inline payload bytes per direction.
pub const MSG_PAYLOAD: usize = 64;

/// Outstanding unanswered messages a single port will hold.
pub const MAX_PENDING: usize = 256;

/// The fixed-shape message envelope, copied verbatim across the user
/// boundary. `pid` and `handle` are kernel-filled at receive time; `err`
/// and `output` are filled on the sender side when the response lands.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Msg {
    pub mtype: u32,
    pub pid: u32,
    pub handle: u32,
    pub err: i32,
    pub input: [u8; MSG_PAYLOAD],
    pub output: [u8; MSG_PAYLOAD],
}

impl Msg {
    pub fn request(mtype: u32, input: [u8; MSG_PAYLOAD]) -> Self {
        Self {
            mtype,
            pid: 0,
            handle: 0,
            err: 0,
            input,
            output: [0; MSG_PAYLOAD],
        }
    }
}

struct Pending {
    msg: Msg,
    sender: Arc<Thread>,
    taken: bool,
    response: Option<(i32, [u8; MSG_PAYLOAD])>,
}

pub struct Port {
    /// System-wide port identifier.
    pub id: u32,
    pub owner: Pid,
    inner: Mutex<PortInner>,
}

struct PortInner {
    queue: VecDeque<usize>,
    pending: Slab<Pending>,
    receivers: VecDeque<Arc<Thread>>,
    events: HashMap<u64, u32>,
    closed: bool,
}

impl Port {
    pub fn new(id: u32, owner: Pid) -> Arc<Self> {
        Arc::new(Self {
            id,
            owner,
            inner: Mutex::new(PortInner {
                queue: VecDeque::new(),
                pending: Slab::new(),
                receivers: VecDeque::new(),
                events: HashMap::new(),
                closed: false,
            }),
        })
    }

    /// Enqueue `msg` and block until the receiver responds. On success the
    /// response error code and output bytes are folded back into `msg` and
    /// the code is also the return value. An interrupt withdraws the
    /// message, answered or not; a late respond to its handle then fails.
    pub fn send(&self, thread: &Arc<Thread>, msg: &mut Msg) -> Result<i32> {
        let key = {
            let mut p = lock(&self.inner);
            if p.closed {
                return Err(Error::InvalidHandle);
            }
            if p.pending.len() >= MAX_PENDING {
                return Err(Error::ResourceExhausted);
            }
            let key = p.pending.insert(Pending {
                msg: *msg,
                sender: thread.clone(),
                taken: false,
                response: None,
            });
            p.queue.push_back(key);
            if let Some(receiver) = p.receivers.pop_front() {
                receiver.wake();
            }
            key
        };

        loop {
            let wake = thread.park(None);
            let mut p = lock(&self.inner);
            match p.pending.get(key) {
                None => return Err(Error::InvalidHandle),
                Some(entry) => {
                    if let Some((err, output)) = entry.response {
                        p.pending.remove(key);
                        msg.err = err;
                        msg.output = output;
                        return Ok(err);
                    }
                }
            }
            if p.closed {
                p.queue.retain(|&k| k != key);
                let _ = p.pending.try_remove(key);
                return Err(Error::InvalidHandle);
            }
            if wake == Wake::Interrupted {
                p.queue.retain(|&k| k != key);
                let _ = p.pending.try_remove(key);
                return Err(Error::Interrupted);
            }
        }
    }

    /// Block until a message is queued, then hand back its envelope with
    /// the sender pid and message handle filled in.
    pub fn recv(&self, thread: &Arc<Thread>) -> Result<Msg> {
        loop {
            {
                let mut p = lock(&self.inner);
                if p.closed {
                    return Err(Error::InvalidHandle);
                }
                if let Some(key) = p.queue.pop_front() {
                    p.receivers.retain(|t| t.tid != thread.tid);
                    if let Some(entry) = p.pending.get_mut(key) {
                        entry.taken = true;
                        let mut msg = entry.msg;
                        msg.pid = entry.sender.pid.0;
                        msg.handle = key as u32;
                        return Ok(msg);
                    }
                    // Sender withdrew between queue and here; keep looking.
                    continue;
                }
                if !p.receivers.iter().any(|t| t.tid == thread.tid) {
                    p.receivers.push_back(thread.clone());
                }
            }
            if thread.park(None) == Wake::Interrupted {
                let mut p = lock(&self.inner);
                p.receivers.retain(|t| t.tid != thread.tid);
                return Err(Error::Interrupted);
            }
        }
    }

    /// Answer the pending message named by `handle`, waking its sender.
    pub fn respond(&self, handle: u32, err: i32, output: [u8; MSG_PAYLOAD]) -> Result<()> {
        let mut p = lock(&self.inner);
        let entry = p
            .pending
            .get_mut(handle as usize)
            .ok_or(Error::InvalidHandle)?;
        if !entry.taken || entry.response.is_some() {
            return Err(Error::InvalidArgument);
        }
        entry.response = Some((err, output));
        entry.sender.wake();
        Ok(())
    }

    /// Merge a readiness event for `id` into the port and nudge blocked
    /// receivers so pollers re-evaluate.
    pub fn post_event(&self, id: u64, events: u32) -> Result<()> {
        let mut p = lock(&self.inner);
        if p.closed {
            return Err(Error::InvalidHandle);
        }
        *p.events.entry(id).or_insert(0) |= events;
        for receiver in &p.receivers {
            receiver.wake();
        }
        Ok(())
    }

    /// Drain accumulated events; consumed by the poll layer.
    pub fn take_events(&self) -> Vec<(u64, u32)> {
        let mut p = lock(&self.inner);
        let mut out: Vec<(u64, u32)> = p.events.drain().collect();
        out.sort_unstable();
        out
    }

    /// Invalidate the port: blocked senders and receivers all observe
    /// InvalidHandle.
    pub fn close(&self) {
        let mut p = lock(&self.inner);
        p.closed = true;
        for receiver in &p.receivers {
            receiver.wake();
        }
        for (_, entry) in p.pending.iter() {
            entry.sender.wake();
        }
    }
}
