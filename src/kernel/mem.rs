//! Per-process user memory.
//!
//! User mode is modeled as a flat byte arena per process. Every address a
//! syscall argument carries is an offset into this arena, range-checked on
//! every access - the kernel never dereferences a user value it has not
//! validated. Address 0 stays unmapped so null-pointer arguments fail (or
//! are skipped, where a null out-pointer is legal).

use bytemuck::Pod;
use std::sync::Mutex;

use super::errno::{Error, Result};
use super::lock;

/// First mapped address. Everything below is a guaranteed fault.
pub const ARENA_BASE: u64 = 0x1000;

/// Per-process arena cap.
pub const ARENA_LIMIT: usize = 1 << 20;

pub struct UserMem {
    data: Mutex<Vec<u8>>,
}

impl UserMem {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Vec::new()),
        }
    }

    /// Map `size` fresh zeroed bytes, returning their base address.
    pub fn map(&self, size: usize) -> Result<u64> {
        let mut data = lock(&self.data);
        if data.len().saturating_add(size) > ARENA_LIMIT {
            return Err(Error::ResourceExhausted);
        }
        let addr = ARENA_BASE + data.len() as u64;
        let grown = data.len() + size;
        data.resize(grown, 0);
        Ok(addr)
    }

    /// Validate a range without copying. The arena never shrinks, so a
    /// range valid here stays valid for the life of the process.
    pub fn check(&self, addr: u64, len: usize) -> Result<()> {
        let data = lock(&self.data);
        range(data.len(), addr, len)?;
        Ok(())
    }

    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let data = lock(&self.data);
        let r = range(data.len(), addr, len)?;
        Ok(data[r].to_vec())
    }

    pub fn write(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        let mut data = lock(&self.data);
        let r = range(data.len(), addr, bytes.len())?;
        data[r].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_pod<T: Pod>(&self, addr: u64) -> Result<T> {
        let data = lock(&self.data);
        let r = range(data.len(), addr, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(&data[r]))
    }

    pub fn write_pod<T: Pod>(&self, addr: u64, value: &T) -> Result<()> {
        let mut data = lock(&self.data);
        let r = range(data.len(), addr, std::mem::size_of::<T>())?;
        data[r].copy_from_slice(bytemuck::bytes_of(value));
        Ok(())
    }

    /// Read a NUL-terminated string of at most `max` bytes.
    pub fn read_cstr(&self, addr: u64, max: usize) -> Result<String> {
        let data = lock(&self.data);
        let start = range(data.len(), addr, 0)?.start;
        let end = (start + max).min(data.len());
        let nul = data[start..end]
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::InvalidArgument)?;
        Ok(String::from_utf8_lossy(&data[start..start + nul]).into_owned())
    }

    /// Copy out up to `max` bytes starting at `addr`, clamped to the arena
    /// end. Used by the dispatcher for the argument window.
    pub fn read_window(&self, addr: u64, max: usize) -> Result<Vec<u8>> {
        let data = lock(&self.data);
        let start = range(data.len(), addr, 0)?.start;
        let end = (start + max).min(data.len());
        Ok(data[start..end].to_vec())
    }

    pub fn used(&self) -> usize {
        lock(&self.data).len()
    }
}

impl Default for UserMem {
    fn default() -> Self {
        Self::new()
    }
}

fn range(arena_len: usize, addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
    if addr < ARENA_BASE {
        return Err(Error::BadAddress);
    }
    let start = (addr - ARENA_BASE) as usize;
    let end = start.checked_add(len).ok_or(Error::BadAddress)?;
    if end > arena_len {
        return Err(Error::BadAddress);
    }
    Ok(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_and_rw() {
        let mem = UserMem::new();
        let addr = mem.map(64).unwrap();
        assert_eq!(addr, ARENA_BASE);
        mem.write(addr, b"hello").unwrap();
        assert_eq!(mem.read(addr, 5).unwrap(), b"hello");
        assert_eq!(mem.used(), 64);
    }

    #[test]
    fn test_map_grows_contiguously() {
        let mem = UserMem::new();
        let a = mem.map(16).unwrap();
        let b = mem.map(8).unwrap();
        assert_eq!(b, a + 16);
        assert_eq!(mem.used(), 24);
    }

    #[test]
    fn test_null_and_out_of_range_fault() {
        let mem = UserMem::new();
        mem.map(16).unwrap();
        assert_eq!(mem.read(0, 1), Err(Error::BadAddress));
        assert_eq!(mem.read(ARENA_BASE + 16, 1), Err(Error::BadAddress));
        assert_eq!(mem.write(ARENA_BASE + 12, b"12345"), Err(Error::BadAddress));
    }

    #[test]
    fn test_pod_roundtrip_unaligned() {
        let mem = UserMem::new();
        let base = mem.map(32).unwrap();
        mem.write_pod(base + 3, &0xaabb_ccddu32).unwrap();
        assert_eq!(mem.read_pod::<u32>(base + 3).unwrap(), 0xaabb_ccdd);
    }

    #[test]
    fn test_cstr() {
        let mem = UserMem::new();
        let base = mem.map(16).unwrap();
        mem.write(base, b"osprey\0junk").unwrap();
        assert_eq!(mem.read_cstr(base, 16).unwrap(), "osprey");
        // No terminator in range
        mem.write(base, &[b'x'; 16]).unwrap();
        assert_eq!(mem.read_cstr(base, 16), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_arena_limit() {
        let mem = UserMem::new();
        assert_eq!(mem.map(ARENA_LIMIT + 1), Err(Error::ResourceExhausted));
    }

    #[test]
    fn test_read_window_clamps() {
        let mem = UserMem::new();
        let base = mem.map(10).unwrap();
        let w = mem.read_window(base + 6, 64).unwrap();
        assert_eq!(w.len(), 4);
    }
}
