//! File and network collaborator seams.
//!
//! The syscall layer only marshals descriptor operations; the actual
//! filesystem and network stack live behind these traits. The inert
//! defaults wired into a fresh kernel report Unsupported for everything,
//! which is exactly what a build without those subsystems should say.

use bytemuck::{Pod, Zeroable};

use super::errno::{Error, Result};

/// `dirfd` value meaning "resolve relative to the current directory".
pub const AT_FDCWD: i32 = -100;

/// Fixed-layout stat record written through user memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub links: u32,
    pub size: u64,
}

/// One poll slot, layout-compatible with the user-mode pollfd.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PollFd {
    pub fd: i32,
    pub events: u16,
    pub revents: u16,
}

pub const POLLIN: u16 = 0x1;
pub const POLLOUT: u16 = 0x10;
pub const POLLERR: u16 = 0x80;
pub const POLLHUP: u16 = 0x100;

pub trait FileOps: Send + Sync {
    fn open(&self, dirfd: i32, path: &str, flags: u32, mode: u32) -> Result<i32>;
    fn close(&self, fd: i32) -> Result<()>;
    fn read(&self, fd: i32, buf: &mut [u8]) -> Result<i64>;
    fn write(&self, fd: i32, buf: &[u8]) -> Result<i64>;
    fn seek(&self, fd: i32, offset: i64, whence: i32) -> Result<i64>;
    fn stat(&self, fd: i32) -> Result<FileStat>;
    fn ioctl(&self, fd: i32, request: u64, arg: &mut [u8]) -> Result<i64>;
    fn poll(&self, fds: &mut [PollFd], timeout_ms: i32) -> Result<i64>;
    fn dup(&self, old_fd: i32, new_fd: i32, flags: u32) -> Result<i32>;
}

pub trait NetOps: Send + Sync {
    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> Result<i32>;
    fn bind(&self, fd: i32, addr: &[u8]) -> Result<()>;
    fn connect(&self, fd: i32, addr: &[u8]) -> Result<()>;
    fn listen(&self, fd: i32, backlog: i32) -> Result<()>;
    fn accept(&self, fd: i32, flags: u32) -> Result<(i32, Vec<u8>)>;
    fn send(&self, fd: i32, buf: &[u8], flags: u32) -> Result<i64>;
    fn recv(&self, fd: i32, buf: &mut [u8], flags: u32) -> Result<i64>;
    fn getsockopt(&self, fd: i32, level: i32, opt: i32) -> Result<Vec<u8>>;
    fn setsockopt(&self, fd: i32, level: i32, opt: i32, val: &[u8]) -> Result<()>;
    fn shutdown(&self, fd: i32, how: i32) -> Result<()>;
}

/// Build without a filesystem.
pub struct NullFileOps;

impl FileOps for NullFileOps {
    fn open(&self, _dirfd: i32, _path: &str, _flags: u32, _mode: u32) -> Result<i32> {
        Err(Error::Unsupported)
    }
    fn close(&self, _fd: i32) -> Result<()> {
        Err(Error::Unsupported)
    }
    fn read(&self, _fd: i32, _buf: &mut [u8]) -> Result<i64> {
        Err(Error::Unsupported)
    }
    fn write(&self, _fd: i32, _buf: &[u8]) -> Result<i64> {
        Err(Error::Unsupported)
    }
    fn seek(&self, _fd: i32, _offset: i64, _whence: i32) -> Result<i64> {
        Err(Error::Unsupported)
    }
    fn stat(&self, _fd: i32) -> Result<FileStat> {
        Err(Error::Unsupported)
    }
    fn ioctl(&self, _fd: i32, _request: u64, _arg: &mut [u8]) -> Result<i64> {
        Err(Error::Unsupported)
    }
    fn poll(&self, _fds: &mut [PollFd], _timeout_ms: i32) -> Result<i64> {
        Err(Error::Unsupported)
    }
    fn dup(&self, _old_fd: i32, _new_fd: i32, _flags: u32) -> Result<i32> {
        Err(Error::Unsupported)
    }
}

/// Build without a network stack.
pub struct NullNetOps;

impl NetOps for NullNetOps {
    fn socket(&self, _domain: i32, _ty: i32, _protocol: i32) -> Result<i32> {
        Err(Error::Unsupported)
    }
    fn bind(&self, _fd: i32, _addr: &[u8]) -> Result<()> {
        Err(Error::Unsupported)
    }
    fn connect(&self, _fd: i32, _addr: &[u8]) -> Result<()> {
        Err(Error::Unsupported)
    }
    fn listen(&self, _fd: i32, _backlog: i32) -> Result<()> {
        Err(Error::Unsupported)
    }
    fn accept(&self, _fd: i32, _flags: u32) -> Result<(i32, Vec<u8>)> {
        Err(Error::Unsupported)
    }
    fn send(&self, _fd: i32, _buf: &[u8], _flags: u32) -> Result<i64> {
        Err(Error::Unsupported)
    }
    fn recv(&self, _fd: i32, _buf: &mut [u8], _flags: u32) -> Result<i64> {
        Err(Error::Unsupported)
    }
    fn getsockopt(&self, _fd: i32, _level: i32, _opt: i32) -> Result<Vec<u8>> {
        Err(Error::Unsupported)
    }
    fn setsockopt(&self, _fd: i32, _level: i32, _opt: i32, _val: &[u8]) -> Result<()> {
        Err(Error::Unsupported)
    }
    fn shutdown(&self, _fd: i32, _how: i32) -> Result<()> {
        Err(Error::Unsupported)
    }
}
