// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The page fault event loop: one thread multiplexing every active VM's
//! userfault fd through an epoll set and installing snapshot pages inline.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::errno;
use vmm_sys_util::eventfd::EventFd;

use crate::manager::{lock_registry, Registry};
use crate::snapshot::{OffsetError, SnapshotState};
use crate::uffd::{host_page_size, FaultError, UffdOps};

/// Size of the buffer handed to `epoll_wait`.
const EPOLL_EVENTS_LEN: usize = 256;

/// Fatal event loop errors. Any of these terminates the loop; the guest
/// threads whose faults were pending stay parked, which beats serving them a
/// wrong page.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Failed to create the epoll instance: {0}")]
    EpollCreate(io::Error),
    #[error("Failed to add the quit eventfd to the epoll interest list: {0}")]
    EpollAdd(io::Error),
    #[error("epoll_wait failed: {0}")]
    EpollWait(io::Error),
    #[error("Blocking epoll_wait returned no events")]
    SpuriousWake,
    #[error("Failed to fetch the host page size: {0}")]
    PageSize(errno::Error),
    #[error("Failed to read a page fault: {0}")]
    Fault(FaultError),
    #[error("Failed to install pages: {0}")]
    Install(FaultError),
    #[error(transparent)]
    Offset(#[from] OffsetError),
}

/// The fault-service loop of the memory manager.
///
/// Owns the epoll set for its whole life; the manager only keeps a shared
/// handle for interest-list updates. Faults are served inline, which keeps
/// reads on one fd strictly ordered while distinct VMs are still independent
/// of each other's progress.
pub(crate) struct FaultPoller<U: UffdOps> {
    registry: Arc<Mutex<Registry<U>>>,
    quit_evt: EventFd,
    exit_evt: EventFd,
    ready_tx: Sender<Arc<Epoll>>,
}

impl<U: UffdOps> FaultPoller<U> {
    pub(crate) fn new(
        registry: Arc<Mutex<Registry<U>>>,
        quit_evt: EventFd,
        exit_evt: EventFd,
        ready_tx: Sender<Arc<Epoll>>,
    ) -> Self {
        FaultPoller {
            registry,
            quit_evt,
            exit_evt,
            ready_tx,
        }
    }

    /// Runs the loop to completion, then pulses the exit eventfd so the
    /// orchestrator can observe the loop ending, cleanly or not.
    pub(crate) fn run(self) -> Result<(), PollError> {
        let res = self.poll_loop();
        if let Err(ref err) = res {
            error!("Page fault poller exited: {err}");
        }
        if let Err(err) = self.exit_evt.write(1) {
            error!("Failed to signal the poller exit event: {err}");
        }
        res
    }

    fn poll_loop(&self) -> Result<(), PollError> {
        let epoll = Arc::new(Epoll::new().map_err(PollError::EpollCreate)?);
        epoll
            .ctl(
                ControlOperation::Add,
                self.quit_evt.as_raw_fd(),
                EpollEvent::new(EventSet::IN, self.quit_evt.as_raw_fd() as u64),
            )
            .map_err(PollError::EpollAdd)?;
        let page_size = host_page_size().map_err(PollError::PageSize)?;

        // Hand the epoll set to the manager; this is the readiness signal
        // its constructor blocks on before accepting instances.
        let _ = self.ready_tx.send(Arc::clone(&epoll));

        let mut events = vec![EpollEvent::default(); EPOLL_EVENTS_LEN];
        loop {
            let nready = match epoll.wait(-1, &mut events[..]) {
                Ok(nready) => nready,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(PollError::EpollWait(err)),
            };
            // The wait blocks until something is ready; waking up empty
            // handed means the fd bookkeeping is broken.
            if nready == 0 {
                return Err(PollError::SpuriousWake);
            }

            for event in events.iter().take(nready) {
                let fd = event.fd();
                if fd == self.quit_evt.as_raw_fd() {
                    let _ = self.quit_evt.read();
                    debug!("Page fault poller received the signal to quit");
                    return Ok(());
                }
                self.dispatch(fd, page_size)?;
            }
        }
    }

    /// Serves one fault from a ready fd: one read per wake-up.
    fn dispatch(&self, fd: RawFd, page_size: usize) -> Result<(), PollError> {
        // Take the registry lock only for the lookup; reads and installs
        // must not delay callers mutating the registry.
        let state = lock_registry(&self.registry).active_by_fd.get(&fd).cloned();
        let Some(state) = state else {
            // The VM raced a remove_instance between the epoll wake and the
            // lookup. Its fd stays open until the state's last reference is
            // dropped, so skipping the stale event is safe.
            warn!("Dropping page fault event for fd {fd} which is no longer active");
            return Ok(());
        };

        let fault_addr = state.uffd().read_fault().map_err(PollError::Fault)?;
        if state.latch_base_address(fault_addr) {
            debug!(
                "Latched base guest address {fault_addr:#x} for VM {}",
                state.vm_id()
            );
        }
        self.serve_page_fault(&state, fault_addr, page_size)
    }

    fn serve_page_fault(
        &self,
        state: &SnapshotState<U>,
        fault_addr: u64,
        page_size: usize,
    ) -> Result<(), PollError> {
        let offset = state.offset_of(fault_addr, page_size)?;
        let src = state.guest_mem().as_ptr() as u64 + offset as u64;
        let dst = fault_addr & !(page_size as u64 - 1);

        state
            .uffd()
            .copy_pages(src, dst, page_size)
            .map_err(PollError::Install)?;
        debug!(
            "Served page fault at {fault_addr:#x} from offset {offset:#x} for VM {}",
            state.vm_id()
        );
        Ok(())
    }
}
