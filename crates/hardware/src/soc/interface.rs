//! Per-CPU interface records and the hub signal.
//!
//! Each CPU and the hub meet through two kinds of shared record:
//! 1. **`CpuPort`:** One mutex and condition variable per CPU, guarding that CPU's
//!    controller, its bounded probe ring (head/tail), and its interrupt line.
//! 2. **`HubSignal`:** The hub's mutex and condition variable, guarding the doorbell
//!    counter, the shared skid buffer, and the shutdown flag.
//!
//! A sender updates the receiver's record while holding only that record's
//! lock, releases it, then broadcasts on the matching condition variable. No
//! thread ever holds two of these locks at once.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::error;

use crate::cbox::CoherenceController;
use crate::cbox::probe::Probe;
use crate::common::CpuId;
use crate::soc::message::SysMessage;

/// Bounded ring of probes waiting for a CPU.
#[derive(Debug)]
pub struct ProbeRing {
    slots: Vec<Option<Probe>>,
    head: usize,
    tail: usize,
    len: usize,
}

impl ProbeRing {
    /// Creates an empty ring with `depth` slots.
    pub fn new(depth: usize) -> Self {
        let mut slots = Vec::with_capacity(depth);
        slots.resize_with(depth, || None);
        Self {
            slots,
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Queued probes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// `true` when no probe is queued.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `true` when no slot is free.
    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// Index of the oldest probe.
    pub const fn head(&self) -> usize {
        self.head
    }

    /// Index the next probe will land in.
    pub const fn tail(&self) -> usize {
        self.tail
    }

    /// Appends a probe, handing it back if the ring is full.
    pub fn push(&mut self, probe: Probe) -> Result<(), Probe> {
        if self.is_full() {
            return Err(probe);
        }
        self.slots[self.tail] = Some(probe);
        self.tail = (self.tail + 1) % self.slots.len();
        self.len += 1;
        Ok(())
    }

    /// Oldest probe, left in place.
    pub fn front(&self) -> Option<Probe> {
        if self.is_empty() {
            None
        } else {
            self.slots[self.head]
        }
    }

    /// Removes the oldest probe.
    pub fn pop(&mut self) -> Option<Probe> {
        if self.is_empty() {
            return None;
        }
        let probe = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        probe
    }
}

/// State guarded by a CPU's mutex.
#[derive(Debug)]
pub struct CpuSide {
    /// The CPU's coherence controller.
    pub controller: CoherenceController,
    /// Probes delivered by the hub, oldest first.
    pub probes: ProbeRing,
    /// Interrupt line: raised when a probe arrives, cleared once the ring drains.
    pub irq_h: bool,
    /// Cleared when the system shuts down.
    pub running: bool,
}

/// Result of handing a message to a CPU.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The CPU accepted the message.
    Delivered,
    /// The probe ring was full; the probe comes back for the skid buffer.
    RingFull(Probe),
}

/// A CPU's mutex-protected record.
#[derive(Debug)]
pub struct CpuPort {
    id: CpuId,
    side: Mutex<CpuSide>,
    cond: Condvar,
}

impl CpuPort {
    /// Wraps a controller with a probe ring of `depth` slots.
    pub fn new(controller: CoherenceController, depth: usize) -> Self {
        Self {
            id: controller.cpu(),
            side: Mutex::new(CpuSide {
                controller,
                probes: ProbeRing::new(depth),
                irq_h: false,
                running: true,
            }),
            cond: Condvar::new(),
        }
    }

    /// CPU this record belongs to.
    pub const fn id(&self) -> CpuId {
        self.id
    }

    /// Locks the record.
    pub fn lock(&self) -> MutexGuard<'_, CpuSide> {
        self.side.lock()
    }

    /// Blocks on the record's condition variable.
    pub fn wait(&self, guard: &mut MutexGuard<'_, CpuSide>) {
        self.cond.wait(guard);
    }

    /// Wakes every thread waiting on this CPU.
    pub fn notify(&self) {
        let _ = self.cond.notify_all();
    }

    /// Delivers a hub message under this CPU's lock, then wakes its waiters.
    ///
    /// Completions are applied to the controller on the spot; probes go into
    /// the ring and raise the interrupt line.
    pub fn deliver(&self, message: SysMessage) -> Delivery {
        let delivery = {
            let mut side = self.side.lock();
            match message {
                SysMessage::DataTransfer(completion) => {
                    if let Err(e) = side.controller.drain_completion(completion) {
                        error!(cpu = %self.id, error = %e, "completion rejected");
                    }
                    Delivery::Delivered
                }
                SysMessage::Probe(probe) => match side.probes.push(probe) {
                    Ok(()) => {
                        side.irq_h = true;
                        Delivery::Delivered
                    }
                    Err(probe) => Delivery::RingFull(probe),
                },
            }
        };
        self.notify();
        delivery
    }

    /// Marks the CPU stopped and wakes its waiters.
    pub fn halt(&self) {
        self.side.lock().running = false;
        self.notify();
    }
}

/// State guarded by the hub's mutex.
#[derive(Debug, Default)]
pub struct HubState {
    /// Bumped every time a CPU queues work for the hub.
    pub doorbell: u64,
    /// Probes waiting for room in their target's ring, oldest first.
    pub skid: VecDeque<(CpuId, Probe)>,
    /// Set once to stop the hub thread.
    pub shutdown: bool,
}

/// The hub's mutex-protected record.
#[derive(Debug, Default)]
pub struct HubSignal {
    state: Mutex<HubState>,
    cond: Condvar,
}

impl HubSignal {
    /// Creates an idle signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the record.
    pub fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock()
    }

    /// Blocks on the hub's condition variable.
    pub fn wait(&self, guard: &mut MutexGuard<'_, HubState>) {
        self.cond.wait(guard);
    }

    /// Tells the hub there is work queued.
    pub fn ring(&self) {
        self.state.lock().doorbell += 1;
        let _ = self.cond.notify_all();
    }

    /// Current doorbell count.
    pub fn doorbell(&self) -> u64 {
        self.state.lock().doorbell
    }

    /// Parks a probe in the skid buffer.
    pub fn park(&self, cpu: CpuId, probe: Probe) {
        self.state.lock().skid.push_back((cpu, probe));
    }

    /// Takes every parked probe, oldest first.
    pub fn take_skid(&self) -> VecDeque<(CpuId, Probe)> {
        std::mem::take(&mut self.state.lock().skid)
    }

    /// `true` if a probe for `cpu` is parked.
    pub fn has_parked(&self, cpu: CpuId) -> bool {
        self.state.lock().skid.iter().any(|(c, _)| *c == cpu)
    }

    /// Number of parked probes.
    pub fn parked(&self) -> usize {
        self.state.lock().skid.len()
    }

    /// Asks the hub thread to stop.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        let _ = self.cond.notify_all();
    }
}

/// The hub's view of one CPU, created by `Hub::register_cpu` and handed to the
/// CPU through `Cpu::bind_system_interface`.
#[derive(Clone, Debug)]
pub struct CpuInterface {
    /// CPU the record belongs to.
    pub cpu: CpuId,
    /// The CPU's mutex, condition variable, probe ring, and interrupt line.
    pub port: Arc<CpuPort>,
    /// The hub's mutex, condition variable, and skid buffer.
    pub hub: Arc<HubSignal>,
}
