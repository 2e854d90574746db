// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-VM snapshot state: the read-only mapping of the guest memory file and
//! the base guest address deduced from the first page fault.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::null_mut;
use std::sync::OnceLock;

use log::error;
use serde::{Deserialize, Serialize};

use crate::manager::VmId;
use crate::uffd::UffdOps;

/// Errors associated with mapping the guest memory snapshot file.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Failure to open the guest memory file.
    #[error("Failed to open the guest memory file: {0}")]
    OpenFile(io::Error),
    /// The file is shorter than the configured guest memory size.
    #[error("Guest memory file holds {file_size} bytes but {requested} were requested")]
    SizeMismatch { file_size: u64, requested: usize },
    /// `mmap` returned the given error.
    #[error("Failed to mmap the guest memory file: {0}")]
    Mmap(io::Error),
}

/// Errors turning a faulting guest address into a snapshot offset.
#[derive(Debug, thiserror::Error)]
pub enum OffsetError {
    #[error("Page fault served before the base guest address was latched")]
    BaseNotLatched,
    #[error("Fault address {fault_addr:#x} is below the base guest address {base:#x}")]
    BelowBase { fault_addr: u64, base: u64 },
    #[error("Fault address {fault_addr:#x} maps to offset {offset:#x} past the guest memory size {size:#x}")]
    OutOfRange {
        fault_addr: u64,
        offset: u64,
        size: usize,
    },
}

/// Configuration for a VM registered with the memory manager.
///
/// All fields except `working_set_path` are required. The guest memory file
/// is the flat snapshot image of the guest's memory; byte `k` of the file is
/// the byte that lives at guest address `base + k` once the VM is resumed.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SnapshotStateCfg {
    /// Identifier of the VM, unique across the manager's lifetime.
    pub vm_id: VmId,
    /// Path of the guest memory snapshot file.
    pub guest_mem_file_path: PathBuf,
    /// Size of the guest memory, in bytes.
    pub guest_mem_size: usize,
    /// Unix socket on which the hypervisor hands over the userfault fd.
    pub uffd_sock_path: PathBuf,
    /// Working set file recorded on an earlier run. Reserved for the
    /// record-and-replay prefetcher.
    pub working_set_path: Option<PathBuf>,
}

impl SnapshotStateCfg {
    /// Derives the conventional per-VM file locations under `base_dir`:
    /// `<base_dir>/<vm_id>/guest_mem` and `<base_dir>/<vm_id>/uffd.sock`.
    pub fn with_base_dir(vm_id: &str, base_dir: &Path, guest_mem_size: usize) -> Self {
        let vm_dir = base_dir.join(vm_id);
        SnapshotStateCfg {
            vm_id: vm_id.to_string(),
            guest_mem_file_path: vm_dir.join("guest_mem"),
            guest_mem_size,
            uffd_sock_path: vm_dir.join("uffd.sock"),
            working_set_path: None,
        }
    }
}

/// A read-only, private, page-aligned mapping of the guest memory file.
#[derive(Debug)]
pub struct GuestMemoryMapping {
    addr: *mut u8,
    size: usize,
}

// SAFETY: The mapping is immutable for its whole lifetime, so concurrent
// reads through the raw pointer from any number of fault-service tasks are
// fine.
unsafe impl Send for GuestMemoryMapping {}
unsafe impl Sync for GuestMemoryMapping {}

impl GuestMemoryMapping {
    /// Maps `size` bytes of the file at `path`, read-only and private.
    pub fn from_file(path: &Path, size: usize) -> Result<Self, MemoryError> {
        let file = File::open(path).map_err(MemoryError::OpenFile)?;

        let file_size = file.metadata().map_err(MemoryError::OpenFile)?.len();
        if file_size < size as u64 {
            return Err(MemoryError::SizeMismatch {
                file_size,
                requested: size,
            });
        }

        // SAFETY: Safe because the fd is valid and the length has been
        // checked against the file size.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(MemoryError::Mmap(io::Error::last_os_error()));
        }

        Ok(GuestMemoryMapping {
            addr: addr.cast(),
            size,
        })
    }

    /// Returns the host address of the start of the region.
    pub fn as_ptr(&self) -> *const u8 {
        self.addr
    }

    /// Returns the size of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for GuestMemoryMapping {
    fn drop(&mut self) {
        // SAFETY: Safe because the region was mapped by `from_file` and is
        // unmapped exactly once, here.
        let ret = unsafe { libc::munmap(self.addr.cast(), self.size) };
        if ret < 0 {
            // Teardown proceeds regardless; the fd owning side has already
            // been closed by the caller on the normal path.
            error!(
                "Failed to munmap guest memory: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// State of one active VM: its snapshot mapping, its userfault fd and the
/// base guest address latched on the first fault.
///
/// The state only exists for active VMs; registered-but-inactive VMs are
/// represented by their [`SnapshotStateCfg`] alone.
#[derive(Debug)]
pub struct SnapshotState<U: UffdOps> {
    cfg: SnapshotStateCfg,
    guest_mem: GuestMemoryMapping,
    uffd: U,
    base_guest_addr: OnceLock<u64>,
}

impl<U: UffdOps> SnapshotState<U> {
    pub fn new(cfg: SnapshotStateCfg, guest_mem: GuestMemoryMapping, uffd: U) -> Self {
        SnapshotState {
            cfg,
            guest_mem,
            uffd,
            base_guest_addr: OnceLock::new(),
        }
    }

    pub fn vm_id(&self) -> &str {
        &self.cfg.vm_id
    }

    pub fn guest_mem(&self) -> &GuestMemoryMapping {
        &self.guest_mem
    }

    pub fn uffd(&self) -> &U {
        &self.uffd
    }

    /// Latches the base guest address. Only the first writer wins; all later
    /// calls are no-ops. Returns whether this call did the latching.
    pub fn latch_base_address(&self, addr: u64) -> bool {
        self.base_guest_addr.set(addr).is_ok()
    }

    /// The base guest address, if a fault has been observed yet.
    pub fn base_guest_address(&self) -> Option<u64> {
        self.base_guest_addr.get().copied()
    }

    /// Computes the snapshot offset backing `fault_addr`.
    ///
    /// The full page at the returned offset must lie inside the guest memory
    /// region; a fault outside of it is a fatal invariant violation.
    pub fn offset_of(&self, fault_addr: u64, page_size: usize) -> Result<usize, OffsetError> {
        let base = self
            .base_guest_address()
            .ok_or(OffsetError::BaseNotLatched)?;
        let offset = fault_addr
            .checked_sub(base)
            .ok_or(OffsetError::BelowBase { fault_addr, base })?;
        if offset.saturating_add(page_size as u64) > self.cfg.guest_mem_size as u64 {
            return Err(OffsetError::OutOfRange {
                fault_addr,
                offset,
                size: self.cfg.guest_mem_size,
            });
        }
        Ok(offset as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{snapshot_file, FakeUffd};
    use crate::uffd::host_page_size;

    fn page_size() -> usize {
        host_page_size().unwrap()
    }

    fn dummy_state() -> SnapshotState<FakeUffd> {
        let guest_mem_size = page_size() * 2;
        let tmp = snapshot_file(&[0xAA, 0xBB]);
        let cfg = SnapshotStateCfg {
            vm_id: String::from("vm0"),
            guest_mem_file_path: tmp.as_path().to_path_buf(),
            guest_mem_size,
            uffd_sock_path: PathBuf::from("/tmp/unused.sock"),
            working_set_path: None,
        };
        let mapping = GuestMemoryMapping::from_file(tmp.as_path(), guest_mem_size).unwrap();
        let (uffd, _injector, _log) = FakeUffd::new();
        SnapshotState::new(cfg, mapping, uffd)
    }

    #[test]
    fn test_map_guest_memory() {
        let page_size = page_size();
        let tmp = snapshot_file(&[0xAA, 0xBB]);
        let mapping = GuestMemoryMapping::from_file(tmp.as_path(), page_size * 2).unwrap();
        assert_eq!(mapping.size(), page_size * 2);
        // The mapped contents must be the file contents.
        // SAFETY: reads stay within the mapped region.
        unsafe {
            assert_eq!(*mapping.as_ptr(), 0xAA);
            assert_eq!(*mapping.as_ptr().add(page_size), 0xBB);
            assert_eq!(*mapping.as_ptr().add(page_size * 2 - 1), 0xBB);
        }
    }

    #[test]
    fn test_map_missing_file() {
        let res = GuestMemoryMapping::from_file(Path::new("/this/file/is/not/there"), page_size());
        assert!(matches!(res, Err(MemoryError::OpenFile(_))));
    }

    #[test]
    fn test_map_short_file() {
        let page_size = page_size();
        let tmp = snapshot_file(&[0xAA]);
        let res = GuestMemoryMapping::from_file(tmp.as_path(), page_size * 2);
        assert!(matches!(
            res,
            Err(MemoryError::SizeMismatch {
                file_size,
                requested,
            }) if file_size == page_size as u64 && requested == page_size * 2
        ));
    }

    #[test]
    fn test_base_address_latches_once() {
        let state = dummy_state();
        assert_eq!(state.base_guest_address(), None);

        assert!(state.latch_base_address(0x1000_0000));
        assert!(!state.latch_base_address(0xdead_0000));
        assert_eq!(state.base_guest_address(), Some(0x1000_0000));
    }

    #[test]
    fn test_concurrent_latch_single_winner() {
        let state = dummy_state();

        let (first, second) = std::thread::scope(|s| {
            let a = s.spawn(|| state.latch_base_address(0x1000_0000));
            let b = s.spawn(|| state.latch_base_address(0x2000_0000));
            (a.join().unwrap(), b.join().unwrap())
        });

        // Exactly one writer wins and every reader sees its value.
        assert!(first ^ second);
        let base = state.base_guest_address().unwrap();
        assert!(base == 0x1000_0000 || base == 0x2000_0000);
    }

    #[test]
    fn test_offset_of() {
        let page_size = page_size();
        let state = dummy_state();

        assert!(matches!(
            state.offset_of(0x1000_0000, page_size),
            Err(OffsetError::BaseNotLatched)
        ));

        state.latch_base_address(0x1000_0000);
        assert_eq!(state.offset_of(0x1000_0000, page_size).unwrap(), 0);
        assert_eq!(
            state
                .offset_of(0x1000_0000 + page_size as u64, page_size)
                .unwrap(),
            page_size
        );

        // The last page of the region is served; one past is fatal.
        assert!(matches!(
            state.offset_of(0x1000_0000 + 2 * page_size as u64, page_size),
            Err(OffsetError::OutOfRange { .. })
        ));
        assert!(matches!(
            state.offset_of(0x0fff_0000, page_size),
            Err(OffsetError::BelowBase { .. })
        ));
    }

    #[test]
    fn test_cfg_with_base_dir() {
        let cfg = SnapshotStateCfg::with_base_dir("vm3", Path::new("/srv/mem_manager"), 1 << 20);
        assert_eq!(cfg.vm_id, "vm3");
        assert_eq!(
            cfg.guest_mem_file_path,
            PathBuf::from("/srv/mem_manager/vm3/guest_mem")
        );
        assert_eq!(
            cfg.uffd_sock_path,
            PathBuf::from("/srv/mem_manager/vm3/uffd.sock")
        );
        assert_eq!(cfg.guest_mem_size, 1 << 20);
        assert!(cfg.working_set_path.is_none());
    }
}
