// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lazy page fault service for microVM snapshots.
//!
//! The memory manager serves page faults raised by Firecracker-style
//! hypervisors resuming VMs from snapshots: guest memory is registered with
//! a userfault fd, and whenever the guest touches a page that has not been
//! loaded yet, the manager copies it out of the memory-mapped snapshot file
//! into the VM's address space and wakes the parked guest thread.
//!
//! An orchestrator drives the lifecycle: [`MemoryManager::register`] makes a
//! VM known, [`MemoryManager::add_instance`] maps its snapshot and attaches
//! the userfault fd received from the hypervisor, and from then on a single
//! poller thread multiplexes the faults of every active VM until
//! [`MemoryManager::remove_instance`] or [`MemoryManager::shutdown`].

pub mod manager;
pub mod poller;
pub mod snapshot;
pub mod uffd;

#[cfg(test)]
pub(crate) mod test_utils;

pub use manager::{Error, MemoryManager, MemoryManagerCfg, VmId, DEFAULT_MEM_MANAGER_BASE_DIR};
pub use poller::PollError;
pub use snapshot::{GuestMemoryMapping, SnapshotState, SnapshotStateCfg};
pub use uffd::{FaultError, GuestRegionUffdMapping, HandoffError, UffdOps};
