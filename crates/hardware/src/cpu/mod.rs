//! CPU-side actor.
//!
//! A `Cpu` is a cloneable handle to one CPU's interface record. It provides:
//! 1. **Binding:** `bind_system_interface`, called once by the hub at startup.
//! 2. **Pipeline API:** Issue memory references, block for completions, retire
//!    victims, and buffer I/O writes.
//! 3. **Probe service:** Drains the probe ring through the controller, either one
//!    pass at a time or as the body of the CPU's thread.
//!
//! Every call takes only this CPU's lock. Work queued for the hub is announced
//! after the lock is released.

use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{debug, error, trace};

use crate::cbox::CoherenceController;
use crate::cbox::iowb::IowbHandle;
use crate::cbox::maf::{MafCompletion, MafHandle, MafType};
use crate::cbox::state::LineState;
use crate::cbox::victim::VictimHandle;
use crate::common::data::{byte_mask, lane_mask};
use crate::common::{BlockData, CoherenceError, CpuId, InvalidRequest, LsqRef, PhysAddr, Result};
use crate::soc::interface::{CpuInterface, CpuPort, CpuSide, HubSignal};
use crate::stats::CoherenceStats;

/// Handle to one emulated CPU.
#[derive(Clone, Debug)]
pub struct Cpu {
    id: CpuId,
    port: Arc<CpuPort>,
    hub: Option<Arc<HubSignal>>,
}

impl Cpu {
    /// Creates a CPU around its controller with a probe ring of `probe_depth` slots.
    pub fn new(controller: CoherenceController, probe_depth: usize) -> Self {
        let id = controller.cpu();
        Self {
            id,
            port: Arc::new(CpuPort::new(controller, probe_depth)),
            hub: None,
        }
    }

    /// CPU id.
    pub const fn id(&self) -> CpuId {
        self.id
    }

    /// The CPU's interface record.
    pub fn port(&self) -> Arc<CpuPort> {
        Arc::clone(&self.port)
    }

    /// `true` once the hub has bound this CPU.
    pub const fn is_bound(&self) -> bool {
        self.hub.is_some()
    }

    /// Accepts the record the hub built for this CPU.
    ///
    /// # Errors
    ///
    /// `InitializationFailure` if the record names another CPU or another
    /// port, or if the CPU is already bound.
    pub fn bind_system_interface(&mut self, interface: &CpuInterface) -> Result<()> {
        if interface.cpu != self.id || !Arc::ptr_eq(&interface.port, &self.port) {
            return Err(CoherenceError::InitializationFailure(format!(
                "{} offered the interface record of {}",
                self.id, interface.cpu
            )));
        }
        if self.hub.is_some() {
            return Err(CoherenceError::InitializationFailure(format!(
                "{} is already bound",
                self.id
            )));
        }
        self.hub = Some(Arc::clone(&interface.hub));
        debug!(cpu = %self.id, "system interface bound");
        Ok(())
    }

    /// Runs `f` on the controller under this CPU's lock, then rings the hub if
    /// anything was queued for it.
    pub fn with_controller<T>(&self, f: impl FnOnce(&mut CoherenceController) -> T) -> T {
        let (value, queued) = {
            let mut side = self.port.lock();
            let value = f(&mut side.controller);
            (value, side.controller.pending_requests() > 0)
        };
        if queued {
            self.ring_hub();
        }
        value
    }

    fn ring_hub(&self) {
        if let Some(hub) = &self.hub {
            hub.ring();
        }
    }

    /// Issues a memory reference. Returns the MAF slot to wait on.
    ///
    /// # Errors
    ///
    /// See `CoherenceController::allocate_miss`.
    pub fn issue_memory_reference(
        &self,
        kind: MafType,
        addr: PhysAddr,
        mask: u64,
        refs: &[LsqRef],
    ) -> Result<MafHandle> {
        self.with_controller(|c| c.allocate_miss(kind, addr, mask, refs))
    }

    /// Returns `true` once `handle` has completed.
    pub fn is_complete(&self, handle: MafHandle) -> bool {
        self.port.lock().controller.maf().is_complete(handle)
    }

    /// Blocks until `handle` completes, then frees the slot and returns the fill.
    ///
    /// # Errors
    ///
    /// `InvalidRequest::StaleHandle` for an unused slot,
    /// `InvalidRequest::NotComplete` if the CPU is halted first, and
    /// `NonExistentMemory` when no memory backs the address.
    pub fn wait_for_completion(&self, handle: MafHandle) -> Result<MafCompletion> {
        let mut side = self.port.lock();
        loop {
            if side.controller.maf().get(handle).is_none() {
                return Err(InvalidRequest::StaleHandle(handle.index() as u8).into());
            }
            if side.controller.maf().is_complete(handle) {
                return side.controller.consume(handle);
            }
            if !side.running {
                return Err(InvalidRequest::NotComplete(handle.index() as u8).into());
            }
            self.port.wait(&mut side);
        }
    }

    /// Issues a reference and waits for it.
    ///
    /// # Errors
    ///
    /// Anything `issue_memory_reference` or `wait_for_completion` reports.
    pub fn access(&self, kind: MafType, addr: PhysAddr, refs: &[LsqRef]) -> Result<MafCompletion> {
        let mask = if kind.length() == 0 {
            0
        } else {
            byte_mask(addr.block_offset(), kind.length())
        };
        let handle = self.issue_memory_reference(kind, addr, mask, refs)?;
        self.wait_for_completion(handle)
    }

    /// Hands a dirty primary-cache block to the Cbox.
    ///
    /// # Errors
    ///
    /// See `CoherenceController::retire_victim`.
    pub fn retire_victim(&self, addr: PhysAddr, data: &BlockData) -> Result<VictimHandle> {
        self.with_controller(|c| c.retire_victim(addr, data))
    }

    /// Buffers an I/O-space store. The lane mask is derived from the address and length.
    ///
    /// # Errors
    ///
    /// See `CoherenceController::allocate_io_write`.
    pub fn io_write(&self, addr: PhysAddr, data: &[u8], refs: &[LsqRef]) -> Result<(IowbHandle, bool)> {
        let mask = lane_mask(addr.block_offset(), data.len());
        self.with_controller(|c| c.allocate_io_write(addr, data, mask, data.len(), refs))
    }

    /// Issues every buffered I/O write. Returns how many entries were sent.
    pub fn flush_io_writes(&self) -> usize {
        self.with_controller(CoherenceController::flush_io_writes)
    }

    /// Flushes I/O writes and waits until the hub has accepted everything issued before.
    ///
    /// # Errors
    ///
    /// See `wait_for_completion`.
    pub fn memory_barrier(&self) -> Result<()> {
        let _ = self.access(MafType::MemoryBarrier, PhysAddr::default(), &[])?;
        Ok(())
    }

    /// Writes into a line this CPU owns.
    ///
    /// # Errors
    ///
    /// See `CoherenceController::store_data`.
    pub fn store_data(&self, addr: PhysAddr, bytes: &[u8]) -> Result<()> {
        self.with_controller(|c| c.store_data(addr, bytes))
    }

    /// Combined line state.
    pub fn lookup(&self, addr: PhysAddr) -> LineState {
        self.port.lock().controller.lookup(addr)
    }

    /// Reads the cached copy of the block containing `addr`.
    pub fn cached_block(&self, addr: PhysAddr) -> Option<BlockData> {
        self.port.lock().controller.bcache().read(addr).copied()
    }

    /// Controller counters.
    pub fn stats(&self) -> CoherenceStats {
        *self.port.lock().controller.stats()
    }

    /// Interrupt line state.
    pub fn interrupt_pending(&self) -> bool {
        self.port.lock().irq_h
    }

    fn service(&self, side: &mut MutexGuard<'_, CpuSide>) -> usize {
        let mut serviced = 0;
        while let Some(probe) = side.probes.front() {
            match side.controller.handle_probe(&probe) {
                Ok(_) => {}
                Err(e) if e.is_backpressure() => {
                    trace!(cpu = %self.id, txn = probe.txn.0, "probe deferred");
                    break;
                }
                Err(e) => error!(cpu = %self.id, error = %e, "probe dropped"),
            }
            let _ = side.probes.pop();
            serviced += 1;
        }
        if side.probes.is_empty() {
            side.irq_h = false;
        }
        serviced
    }

    /// Answers every probe in the ring that can be answered now.
    ///
    /// A probe that needs a victim slot while the buffer is full stays at the
    /// head of the ring. Returns how many probes were answered.
    pub fn service_probes(&self) -> usize {
        let serviced = {
            let mut side = self.port.lock();
            self.service(&mut side)
        };
        if serviced > 0 {
            self.ring_hub();
        }
        serviced
    }

    /// Thread body: answers probes until the CPU is halted.
    pub fn run(&self) {
        debug!(cpu = %self.id, "cpu thread start");
        loop {
            let serviced = {
                let mut side = self.port.lock();
                loop {
                    if !side.running {
                        debug!(cpu = %self.id, "cpu thread stop");
                        return;
                    }
                    let serviced = self.service(&mut side);
                    if serviced > 0 {
                        break serviced;
                    }
                    // Nothing ready, or the head probe is waiting on a victim slot.
                    self.port.wait(&mut side);
                }
            };
            trace!(cpu = %self.id, serviced, "probes serviced");
            self.ring_hub();
        }
    }

    /// Stops the CPU thread and wakes any blocked waiter.
    pub fn halt(&self) {
        self.port.halt();
    }
}
