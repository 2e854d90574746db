// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The memory manager facade: the registry of inactive and active VMs and
//! the operations moving snapshot states between them.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use userfaultfd::Uffd;
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::EventFd;

use crate::poller::{FaultPoller, PollError};
use crate::snapshot::{GuestMemoryMapping, MemoryError, SnapshotState, SnapshotStateCfg};
use crate::uffd::{receive_uffd, HandoffError, UffdOps};

/// Identifier of a VM, unique across the lifetime of one manager.
pub type VmId = String;

/// Default host directory under which per-VM snapshot files live.
pub const DEFAULT_MEM_MANAGER_BASE_DIR: &str = "/root/fccd-mem_manager";

/// Memory manager errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("VM {0} is already registered with the memory manager")]
    AlreadyRegistered(VmId),
    #[error("VM {0} is not registered with the memory manager")]
    NotRegistered(VmId),
    #[error("VM {0} is already active in the memory manager")]
    AlreadyActive(VmId),
    #[error("VM {0} is not active in the memory manager")]
    NotActive(VmId),
    #[error("Failed to map guest memory for VM {vm_id}: {err}")]
    MapGuestMemory { vm_id: VmId, err: MemoryError },
    #[error("Failed to obtain the userfault fd for VM {vm_id}: {err}")]
    ObtainUffd { vm_id: VmId, err: HandoffError },
    #[error("Failed to update the epoll interest list: {0}")]
    EpollCtl(io::Error),
    #[error("Failed to create an eventfd: {0}")]
    EventFd(io::Error),
    #[error("Failed to spawn the page fault poller thread: {0}")]
    SpawnPoller(io::Error),
    #[error("The page fault poller exited with an error: {0}")]
    Poller(PollError),
    #[error("The page fault poller thread panicked")]
    PollerPanic,
}

/// Global configuration of the memory manager.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryManagerCfg {
    /// Host directory under which per-VM snapshot files live.
    pub mem_manager_base_dir: PathBuf,
    /// Reserved for the record-and-replay working set prefetcher.
    pub record_replay_mode_enabled: bool,
}

impl Default for MemoryManagerCfg {
    fn default() -> Self {
        MemoryManagerCfg {
            mem_manager_base_dir: PathBuf::from(DEFAULT_MEM_MANAGER_BASE_DIR),
            record_replay_mode_enabled: false,
        }
    }
}

/// The registry maps. One mutex covers all of them; the fd index and the VM
/// index of the active set always describe the same states.
pub(crate) struct Registry<U: UffdOps> {
    /// Registered VMs waiting for activation, by VM id.
    pub(crate) inactive: HashMap<VmId, SnapshotStateCfg>,
    /// VMs claimed by an in-flight activation. Keeps the id taken while the
    /// registry lock is dropped for the mmap and handoff syscalls.
    pub(crate) pending: HashSet<VmId>,
    /// Userfault fd of every active VM, by VM id.
    pub(crate) active_by_vm: HashMap<VmId, RawFd>,
    /// State of every active VM, by userfault fd.
    pub(crate) active_by_fd: HashMap<RawFd, Arc<SnapshotState<U>>>,
}

impl<U: UffdOps> Registry<U> {
    fn new() -> Self {
        Registry {
            inactive: HashMap::new(),
            pending: HashSet::new(),
            active_by_vm: HashMap::new(),
            active_by_fd: HashMap::new(),
        }
    }
}

/// Locks the registry, recovering the guard from a poisoned lock. A panic
/// while holding this lock can only leave the maps in a state some earlier
/// operation fully committed or fully rolled back.
pub(crate) fn lock_registry<U: UffdOps>(registry: &Mutex<Registry<U>>) -> MutexGuard<Registry<U>> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Serves page faults for VM snapshots.
///
/// VMs go through a two-phase lifecycle: [`register`](Self::register) makes
/// the manager aware of a VM's snapshot, [`add_instance`](Self::add_instance)
/// (or [`activate`](Self::activate)) maps the snapshot, attaches the VM's
/// userfault fd and starts serving its faults. The manager is generic over
/// the userfault seam so tests can substitute a deterministic double for the
/// kernel.
pub struct MemoryManager<U: UffdOps = Uffd> {
    cfg: MemoryManagerCfg,
    registry: Arc<Mutex<Registry<U>>>,
    epoll: Arc<Epoll>,
    quit_evt: EventFd,
    exit_evt: EventFd,
    poller: Option<JoinHandle<Result<(), PollError>>>,
}

impl<U: UffdOps> MemoryManager<U> {
    /// Initializes a new memory manager and starts its page fault poller.
    /// Blocks until the poller's epoll set is live.
    pub fn new(cfg: MemoryManagerCfg) -> Result<Self, Error> {
        debug!(
            "Initializing the memory manager with base dir {}",
            cfg.mem_manager_base_dir.display()
        );
        if cfg.record_replay_mode_enabled {
            warn!("Record-replay mode is reserved and has no effect");
        }

        let quit_evt = EventFd::new(libc::EFD_NONBLOCK).map_err(Error::EventFd)?;
        let exit_evt = EventFd::new(libc::EFD_NONBLOCK).map_err(Error::EventFd)?;
        let registry = Arc::new(Mutex::new(Registry::new()));
        let (ready_tx, ready_rx) = mpsc::channel();

        let poller = FaultPoller::new(
            Arc::clone(&registry),
            quit_evt.try_clone().map_err(Error::EventFd)?,
            exit_evt.try_clone().map_err(Error::EventFd)?,
            ready_tx,
        );
        let handle = thread::Builder::new()
            .name("fault_poller".to_string())
            .spawn(move || poller.run())
            .map_err(Error::SpawnPoller)?;

        let epoll = match ready_rx.recv() {
            Ok(epoll) => epoll,
            // The poller died before signaling readiness; surface its error.
            Err(_) => {
                return Err(match handle.join() {
                    Ok(Err(err)) => Error::Poller(err),
                    _ => Error::PollerPanic,
                });
            }
        };

        Ok(MemoryManager {
            cfg,
            registry,
            epoll,
            quit_evt,
            exit_evt,
            poller: Some(handle),
        })
    }

    /// Registers a VM which is going to be managed by the memory manager.
    pub fn register(&self, cfg: SnapshotStateCfg) -> Result<(), Error> {
        debug!("Registering VM {} with the memory manager", cfg.vm_id);

        let mut registry = lock_registry(&self.registry);
        if registry.inactive.contains_key(&cfg.vm_id)
            || registry.active_by_vm.contains_key(&cfg.vm_id)
            || registry.pending.contains(&cfg.vm_id)
        {
            error!("VM {} is already registered with the memory manager", cfg.vm_id);
            return Err(Error::AlreadyRegistered(cfg.vm_id));
        }
        registry.inactive.insert(cfg.vm_id.clone(), cfg);
        Ok(())
    }

    /// Claims a registered VM for activation. While the claim is held the VM
    /// is in neither map, but its id stays taken: a concurrent register or
    /// second activation is refused.
    fn claim(&self, vm_id: &str) -> Result<SnapshotStateCfg, Error> {
        let mut registry = lock_registry(&self.registry);
        if registry.active_by_vm.contains_key(vm_id) || registry.pending.contains(vm_id) {
            error!("VM {vm_id} is already active in the memory manager");
            return Err(Error::AlreadyActive(vm_id.to_string()));
        }
        match registry.inactive.remove(vm_id) {
            Some(cfg) => {
                registry.pending.insert(vm_id.to_string());
                Ok(cfg)
            }
            None => {
                error!("VM {vm_id} is not registered with the memory manager");
                Err(Error::NotRegistered(vm_id.to_string()))
            }
        }
    }

    /// Returns a claimed VM to the inactive set after a failed activation.
    fn unclaim(&self, cfg: SnapshotStateCfg) {
        let mut registry = lock_registry(&self.registry);
        registry.pending.remove(&cfg.vm_id);
        registry.inactive.insert(cfg.vm_id.clone(), cfg);
    }

    fn map_guest_memory(cfg: &SnapshotStateCfg) -> Result<GuestMemoryMapping, Error> {
        GuestMemoryMapping::from_file(&cfg.guest_mem_file_path, cfg.guest_mem_size).map_err(
            |err| {
                error!("Failed to map guest memory for VM {}: {err}", cfg.vm_id);
                Error::MapGuestMemory {
                    vm_id: cfg.vm_id.clone(),
                    err,
                }
            },
        )
    }

    /// Moves a claimed VM into both active indices and subscribes its fd to
    /// the fault poller.
    fn commit(&self, state: SnapshotState<U>) -> Result<(), Error> {
        let vm_id = state.vm_id().to_string();
        let fd = state.uffd().as_raw_fd();

        let mut registry = lock_registry(&self.registry);
        registry.pending.remove(&vm_id);
        registry.active_by_vm.insert(vm_id.clone(), fd);
        registry.active_by_fd.insert(fd, Arc::new(state));

        if let Err(err) = self.epoll.ctl(
            ControlOperation::Add,
            fd,
            EpollEvent::new(EventSet::IN, fd as u64),
        ) {
            // Fatal to this VM: it ends up in neither map and its mapping
            // and fd are released on drop.
            error!("Failed to subscribe VM {vm_id} to the fault poller: {err}");
            registry.active_by_vm.remove(&vm_id);
            registry.active_by_fd.remove(&fd);
            return Err(Error::EpollCtl(err));
        }
        Ok(())
    }

    /// Activates a registered VM with an externally obtained userfault fd:
    /// maps its snapshot and subscribes the fd to the fault poller.
    pub fn activate(&self, vm_id: &str, uffd: U) -> Result<(), Error> {
        debug!("Adding instance {vm_id} to the memory manager");

        let cfg = self.claim(vm_id)?;
        let guest_mem = match Self::map_guest_memory(&cfg) {
            Ok(guest_mem) => guest_mem,
            Err(err) => {
                // The VM stays registered; only the activation failed.
                self.unclaim(cfg);
                return Err(err);
            }
        };
        self.commit(SnapshotState::new(cfg, guest_mem, uffd))
    }

    /// Removes an active VM: unsubscribes its fd from the fault poller and
    /// releases its snapshot state. The mapping is unmapped and the fd
    /// closed when the last in-flight fault service lets go of the state.
    pub fn remove_instance(&self, vm_id: &str) -> Result<(), Error> {
        debug!("Removing instance {vm_id} from the memory manager");

        let mut registry = lock_registry(&self.registry);
        let fd = match registry.active_by_vm.get(vm_id) {
            Some(fd) => *fd,
            None => {
                error!("VM {vm_id} is not active in the memory manager");
                return Err(Error::NotActive(vm_id.to_string()));
            }
        };

        // Stop watching the fd before retiring the state, so the poller
        // picks up no new events for it.
        self.epoll
            .ctl(ControlOperation::Delete, fd, EpollEvent::default())
            .map_err(Error::EpollCtl)?;

        registry.active_by_vm.remove(vm_id);
        let state = registry.active_by_fd.remove(&fd);
        drop(registry);
        // Usually the last reference: unmap and close happen here.
        drop(state);
        Ok(())
    }

    /// Fetches the working set recorded on an earlier run.
    ///
    /// Reserved: currently a successful no-op.
    pub fn fetch_state(&self, vm_id: &str) -> Result<(), Error> {
        debug!("State fetching is not implemented; nothing to do for VM {vm_id}");
        Ok(())
    }

    /// Stops the fault poller and releases every active VM, as if
    /// [`remove_instance`](Self::remove_instance) had been called for each.
    /// Returns the poller's verdict: `Ok` for a clean quit, the fatal loop
    /// error otherwise.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        let Some(handle) = self.poller.take() else {
            return Ok(());
        };
        debug!("Shutting down the memory manager");

        self.quit_evt.write(1).map_err(Error::EventFd)?;
        let poll_res = handle.join().map_err(|_| Error::PollerPanic)?;

        let mut registry = lock_registry(&self.registry);
        let active: Vec<(VmId, RawFd)> = registry.active_by_vm.drain().collect();
        for (vm_id, fd) in active {
            if let Err(err) = self
                .epoll
                .ctl(ControlOperation::Delete, fd, EpollEvent::default())
            {
                warn!("Failed to unsubscribe VM {vm_id} during shutdown: {err}");
            }
            registry.active_by_fd.remove(&fd);
            debug!("Released active VM {vm_id}");
        }
        drop(registry);

        poll_res.map_err(Error::Poller)
    }

    /// The eventfd pulsed when the fault poller exits, cleanly or fatally.
    /// The orchestrator can watch it to react to a dead loop.
    pub fn exit_event(&self) -> &EventFd {
        &self.exit_evt
    }

    /// The manager's global configuration.
    pub fn cfg(&self) -> &MemoryManagerCfg {
        &self.cfg
    }

    /// Whether `vm_id` is registered but not yet active.
    pub fn is_registered(&self, vm_id: &str) -> bool {
        lock_registry(&self.registry).inactive.contains_key(vm_id)
    }

    /// Whether `vm_id` is currently served by the fault poller.
    pub fn is_active(&self, vm_id: &str) -> bool {
        lock_registry(&self.registry).active_by_vm.contains_key(vm_id)
    }

    /// Number of active VMs.
    pub fn active_count(&self) -> usize {
        lock_registry(&self.registry).active_by_vm.len()
    }
}

impl MemoryManager<Uffd> {
    /// Activates a registered VM, receiving its userfault fd from the
    /// hypervisor over the VM's handoff socket. Blocks until the hypervisor
    /// connects.
    pub fn add_instance(&self, vm_id: &str) -> Result<(), Error> {
        debug!("Adding instance {vm_id} to the memory manager");

        let cfg = self.claim(vm_id)?;
        // Guest memory is mapped before the handoff: a broken snapshot path
        // fails fast instead of waiting for the hypervisor to connect.
        let guest_mem = match Self::map_guest_memory(&cfg) {
            Ok(guest_mem) => guest_mem,
            Err(err) => {
                self.unclaim(cfg);
                return Err(err);
            }
        };

        let uffd = match receive_uffd(&cfg.uffd_sock_path, cfg.guest_mem_size) {
            Ok(uffd) => uffd,
            Err(err) => {
                error!("Failed to obtain the userfault fd for VM {vm_id}: {err}");
                // Unmap before returning the VM to the inactive set.
                drop(guest_mem);
                self.unclaim(cfg);
                return Err(Error::ObtainUffd {
                    vm_id: vm_id.to_string(),
                    err,
                });
            }
        };

        self.commit(SnapshotState::new(cfg, guest_mem, uffd))
    }
}

impl<U: UffdOps> Drop for MemoryManager<U> {
    fn drop(&mut self) {
        if self.poller.is_some() {
            if let Err(err) = self.shutdown() {
                error!("Failed to shut down the memory manager: {err}");
            }
        }
    }
}

#[cfg(test)]
impl<U: UffdOps> MemoryManager<U> {
    /// Checks the registry invariants: a VM is in at most one of inactive,
    /// pending and active, and the two active indices mirror each other.
    pub(crate) fn assert_registry_consistent(&self) {
        let registry = lock_registry(&self.registry);
        assert_eq!(registry.active_by_vm.len(), registry.active_by_fd.len());
        for (vm_id, fd) in &registry.active_by_vm {
            let state = registry
                .active_by_fd
                .get(fd)
                .expect("active fd index is missing an entry");
            assert_eq!(state.vm_id(), vm_id);
            assert!(!registry.inactive.contains_key(vm_id));
            assert!(!registry.pending.contains(vm_id));
        }
        for vm_id in &registry.pending {
            assert!(!registry.inactive.contains_key(vm_id));
        }
    }
}
