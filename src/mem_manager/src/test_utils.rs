// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Test doubles for the kernel side of fault handling.
//!
//! [`FakeUffd`] stands in for a userfault fd: a pipe carries synthetic
//! 8-byte fault addresses, so the real epoll loop wakes up and reads them
//! exactly as it would kernel fault messages, while installs are recorded
//! instead of issued.

use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vmm_sys_util::tempfile::TempFile;

use crate::uffd::{host_page_size, FaultError, UffdOps};

/// One recorded page install.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InstallRecord {
    pub src: u64,
    pub dst: u64,
    pub len: usize,
    /// Byte read back through `src`, so tests can check which snapshot page
    /// was picked.
    pub first_byte: u8,
}

pub(crate) type InstallLog = Arc<Mutex<Vec<InstallRecord>>>;

/// Write end of a fake uffd: tests push fault addresses through it.
#[derive(Debug)]
pub(crate) struct FaultInjector {
    write_fd: RawFd,
}

impl FaultInjector {
    /// Queues a page fault at `addr` on the paired [`FakeUffd`].
    pub(crate) fn inject(&self, addr: u64) {
        let buf = addr.to_le_bytes();
        // SAFETY: the write end is open for the injector's lifetime and the
        // buffer is valid; 8 bytes are far below PIPE_BUF so the write is
        // atomic.
        let ret = unsafe { libc::write(self.write_fd, buf.as_ptr().cast(), buf.len()) };
        assert_eq!(ret, buf.len() as isize);
    }
}

impl Drop for FaultInjector {
    fn drop(&mut self) {
        // SAFETY: the fd belongs to this injector.
        unsafe { libc::close(self.write_fd) };
    }
}

/// Deterministic [`UffdOps`] double backed by a pipe.
#[derive(Debug)]
pub(crate) struct FakeUffd {
    read_fd: RawFd,
    copies: InstallLog,
}

impl FakeUffd {
    pub(crate) fn new() -> (FakeUffd, FaultInjector, InstallLog) {
        let mut fds = [0; 2];
        // SAFETY: `fds` is a valid out-array for the two pipe ends.
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(ret, 0);

        let copies: InstallLog = Arc::new(Mutex::new(Vec::new()));
        let uffd = FakeUffd {
            read_fd: fds[0],
            copies: Arc::clone(&copies),
        };
        (uffd, FaultInjector { write_fd: fds[1] }, copies)
    }
}

impl AsRawFd for FakeUffd {
    fn as_raw_fd(&self) -> RawFd {
        self.read_fd
    }
}

impl Drop for FakeUffd {
    fn drop(&mut self) {
        // SAFETY: the fd belongs to this fake.
        unsafe { libc::close(self.read_fd) };
    }
}

impl UffdOps for FakeUffd {
    fn read_fault(&self) -> Result<u64, FaultError> {
        let mut buf = [0u8; 8];
        // SAFETY: the buffer is valid for 8 bytes and the fd is open.
        let ret = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
        if ret != buf.len() as isize {
            return Err(FaultError::EventNotReady);
        }
        Ok(u64::from_le_bytes(buf))
    }

    fn copy_pages(&self, src: u64, dst: u64, len: usize) -> Result<(), FaultError> {
        // SAFETY: `src` points into the VM's snapshot mapping, which the
        // registry keeps alive while the copy runs.
        let first_byte = unsafe { *(src as *const u8) };
        self.copies.lock().unwrap().push(InstallRecord {
            src,
            dst,
            len,
            first_byte,
        });
        Ok(())
    }
}

/// Creates a snapshot file of host-page-sized pages, each filled with the
/// corresponding byte of `pages`.
pub(crate) fn snapshot_file(pages: &[u8]) -> TempFile {
    let page_size = host_page_size().unwrap();
    let tmp = TempFile::new().unwrap();
    for (i, fill) in pages.iter().enumerate() {
        let page = vec![*fill; page_size];
        tmp.as_file()
            .write_all_at(&page, (i * page_size) as u64)
            .unwrap();
    }
    tmp
}

/// Spins until `cond` holds, panicking with `what` after a bounded wait.
pub(crate) fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("Timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
