//! Positional argument marshaling.
//!
//! Syscall arguments arrive packed back to back in a caller-owned buffer:
//! argument k begins where argument k-1 ended, each sized solely by its
//! declared type, with no padding and no runtime type tags. The decode
//! order and types in each handler *are* the calling convention - a handler
//! that declares the wrong type reads the wrong bytes. The one concession
//! to safety: reads are bounds-checked, so a short buffer yields an error
//! instead of garbage.
//!
//! Pointer-typed arguments decode as plain `u64` addresses. Nothing here
//! validates that an address is mapped or owned by the caller; that is the
//! handler's job before it touches process memory.

use bytemuck::Pod;

use super::errno::{Error, Result};

/// How many bytes of argument buffer the dispatcher copies out of user
/// memory per call. No syscall declares more than this.
pub const ARG_WINDOW: usize = 64;

/// Sequential typed reader over one syscall's argument buffer. Scoped to a
/// single dispatch; never retained.
pub struct Args<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Args<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Decode the next argument as `T`, advancing by `size_of::<T>()`.
    pub fn next<T: Pod>(&mut self) -> Result<T> {
        let size = std::mem::size_of::<T>();
        let end = self.pos.checked_add(size).ok_or(Error::InvalidArgument)?;
        let bytes = self.buf.get(self.pos..end).ok_or(Error::InvalidArgument)?;
        self.pos = end;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }
}

/// Packs argument buffers the way the user-mode runtime does. The kernel
/// never calls this; tests and simulated user code do.
#[derive(Default)]
pub struct ArgWriter {
    buf: Vec<u8>,
}

impl ArgWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T: Pod>(mut self, value: T) -> Self {
        self.buf.extend_from_slice(bytemuck::bytes_of(&value));
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
