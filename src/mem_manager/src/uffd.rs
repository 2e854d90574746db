// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The userfaultfd seam: reading page fault events, installing pages with
//! copy-and-wake, and receiving the fd itself from the hypervisor over a
//! Unix socket.

use std::fmt::Debug;
use std::fs;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::os::unix::net::UnixListener;
use std::path::Path;

use serde::{Deserialize, Serialize};
use userfaultfd::{Event, Uffd};
use vmm_sys_util::errno;
use vmm_sys_util::sock_ctrl_msg::ScmSocket;

/// Errors raised while reading or serving a page fault.
#[derive(Debug, thiserror::Error)]
pub enum FaultError {
    #[error("Failed to read userfaultfd event: {0}")]
    ReadEvent(userfaultfd::Error),
    #[error("Userfaultfd event is not ready")]
    EventNotReady,
    #[error("Received unexpected event on userfaultfd: {0}")]
    UnexpectedEvent(String),
    #[error("Userfaultfd copy failed: {0}")]
    Copy(userfaultfd::Error),
    #[error("Userfaultfd copy installed no bytes")]
    NoBytesCopied,
}

/// Errors receiving the userfault fd from the hypervisor.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("Failed to bind the userfaultfd socket: {0}")]
    Bind(io::Error),
    #[error("Failed to accept a connection on the userfaultfd socket: {0}")]
    Accept(io::Error),
    #[error("Failed to receive the userfault fd: {0}")]
    Recv(io::Error),
    #[error("The hypervisor sent no file descriptor with the handshake")]
    MissingFd,
    #[error("Deserializing guest memory mappings failed: {0}")]
    DeserializeMappings(serde_json::Error),
    #[error("Guest memory mappings advertise an invalid page size: {0}")]
    InvalidPageSize(usize),
    #[error("Mappings describe {mappings} bytes of guest memory, {expected} were configured")]
    SizeMismatch { mappings: usize, expected: usize },
}

/// The fault-delivery and page-install operations the event loop needs from
/// a userfault fd. Implemented for [`userfaultfd::Uffd`]; tests substitute a
/// deterministic double.
pub trait UffdOps: AsRawFd + Debug + Send + Sync + 'static {
    /// Reads one page fault message from the fd and returns the faulting
    /// guest virtual address. Any event other than a page fault is fatal in
    /// this configuration.
    fn read_fault(&self) -> Result<u64, FaultError>;

    /// Atomically copies `len` bytes from host address `src` into the guest
    /// mapping at `dst` and wakes the parked guest thread. `dst` must be
    /// page-aligned and `len` a multiple of the page size.
    fn copy_pages(&self, src: u64, dst: u64, len: usize) -> Result<(), FaultError>;
}

impl UffdOps for Uffd {
    fn read_fault(&self) -> Result<u64, FaultError> {
        match self.read_event().map_err(FaultError::ReadEvent)? {
            Some(Event::Pagefault { addr, .. }) => Ok(addr as u64),
            Some(event) => Err(FaultError::UnexpectedEvent(format!("{event:?}"))),
            None => Err(FaultError::EventNotReady),
        }
    }

    fn copy_pages(&self, src: u64, dst: u64, len: usize) -> Result<(), FaultError> {
        // SAFETY: Safe because `src` points into the snapshot mapping, which
        // outlives the copy, and `dst` is a page-aligned address inside the
        // guest region registered with this uffd.
        let copied = unsafe {
            self.copy(src as *const _, dst as *mut _, len, true)
                .map_err(FaultError::Copy)?
        };
        // The guest thread resumes only after a successful copy; zero bytes
        // would leave it parked forever.
        if copied == 0 {
            return Err(FaultError::NoBytesCopied);
        }
        Ok(())
    }
}

/// Describes where one guest memory region's contents live in the snapshot
/// file. Sent by Firecracker-style hypervisors along with the userfault fd.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct GuestRegionUffdMapping {
    /// Base host virtual address where the region is mapped in the VM
    /// process.
    pub base_host_virt_addr: u64,
    /// Region size.
    pub size: usize,
    /// Offset in the snapshot file where the region contents start.
    pub offset: u64,
    /// The page size the hypervisor configured for this region.
    pub page_size_kib: usize,
}

/// Receives the userfault fd for one VM.
///
/// Binds a listener at `sock_path` (replacing a stale socket file), accepts
/// a single connection from the hypervisor and reads the fd from the
/// SCM_RIGHTS handshake. Blocks until the hypervisor connects.
pub(crate) fn receive_uffd(sock_path: &Path, expected_size: usize) -> Result<Uffd, HandoffError> {
    match fs::remove_file(sock_path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(HandoffError::Bind(err)),
    }
    let listener = UnixListener::bind(sock_path).map_err(HandoffError::Bind)?;
    let (stream, _) = listener.accept().map_err(HandoffError::Accept)?;

    let mut message_buf = vec![0u8; 1024];
    let (bytes_read, file) = stream
        .recv_with_fd(&mut message_buf[..])
        .map_err(|err| HandoffError::Recv(err.into()))?;
    let file = file.ok_or(HandoffError::MissingFd)?;

    validate_handshake(&message_buf[..bytes_read], expected_size)?;

    // SAFETY: Safe because ownership of the received descriptor moves into
    // the Uffd, which closes it on drop.
    Ok(unsafe { Uffd::from_raw_fd(file.into_raw_fd()) })
}

/// Checks the optional guest-region message accompanying the fd.
///
/// An empty body is a bare-fd handoff and is accepted; a non-empty body must
/// be a guest region list whose summed size matches the configured guest
/// memory size.
fn validate_handshake(body: &[u8], expected_size: usize) -> Result<(), HandoffError> {
    if body.is_empty() {
        return Ok(());
    }
    let mappings: Vec<GuestRegionUffdMapping> =
        serde_json::from_slice(body).map_err(HandoffError::DeserializeMappings)?;
    // The page size is the same for every region, so the first one speaks
    // for all of them.
    if let Some(first) = mappings.first() {
        if !first.page_size_kib.is_power_of_two() {
            return Err(HandoffError::InvalidPageSize(first.page_size_kib));
        }
    }
    let mappings_size: usize = mappings.iter().map(|r| r.size).sum();
    if mappings_size != expected_size {
        return Err(HandoffError::SizeMismatch {
            mappings: mappings_size,
            expected: expected_size,
        });
    }
    Ok(())
}

/// Returns the host page size.
pub(crate) fn host_page_size() -> Result<usize, errno::Error> {
    // SAFETY: Safe because the parameters are valid.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        -1 => Err(errno::Error::last()),
        ps => Ok(ps as usize),
    }
}
