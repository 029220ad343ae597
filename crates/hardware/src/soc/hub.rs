//! Coherence hub.
//!
//! The chipset actor every CPU talks to. It performs:
//! 1. **Registration:** Builds each CPU's interface record and binds it to the CPU.
//! 2. **Routing:** Resolves requests to memory arrays, or to I/O space.
//! 3. **Probing:** Broadcasts probes for cacheable reads to every other CPU and
//!    collects the answers in a transaction table.
//! 4. **Completion:** Supplies the fill (dirty probe data first, memory otherwise),
//!    acknowledges victims, and writes dirty data back.
//! 5. **Skid buffer:** Parks probes whose target ring is full and retries them in order.
//!
//! The hub owns the memory map and the transaction table outright. It touches a
//! CPU only through that CPU's `CpuPort`, one lock at a time.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::cbox::probe::{DataMovement, NextState, Probe, ProbeCommand, ProbeStatus, TxnId};
use crate::cbox::state::LineState;
use crate::common::constants::MAX_CPUS;
use crate::common::data::zero_block;
use crate::common::{BlockData, CoherenceError, CpuId, PhysAddr, RequestId, Result};
use crate::config::HubConfig;
use crate::cpu::Cpu;
use crate::soc::interface::{CpuInterface, Delivery, HubSignal};
use crate::soc::memory::MemoryMap;
use crate::soc::message::{Completion, ReadKind, SysMessage, SysRequest};
use crate::stats::HubStats;

/// One read in flight at the hub.
#[derive(Clone, Debug)]
pub struct Transaction {
    /// Requesting CPU.
    pub origin: CpuId,
    /// Completion id at the requester.
    pub id: RequestId,
    /// Block address.
    pub addr: PhysAddr,
    /// Requested ownership.
    pub kind: ReadKind,
    /// Next state sent with the probes.
    pub next: NextState,
    /// Probe responses still outstanding.
    pub pending: usize,
    /// Dirty data returned by a probed CPU.
    pub data: Option<Box<BlockData>>,
    /// Some probed CPU returned dirty data.
    pub dirty: bool,
    /// Some probed CPU keeps a copy.
    pub shared: bool,
}

/// The coherence hub.
#[derive(Debug)]
pub struct Hub {
    signal: Arc<HubSignal>,
    cpus: Vec<CpuInterface>,
    memory: MemoryMap,
    io_space: HashMap<PhysAddr, BlockData>,
    txns: BTreeMap<TxnId, Transaction>,
    busy: HashMap<PhysAddr, TxnId>,
    deferred: VecDeque<(CpuId, SysRequest)>,
    next_txn: u64,
    read_next_state: NextState,
    stats: HubStats,
}

impl Hub {
    /// Creates a hub over `memory`.
    pub fn new(memory: MemoryMap, config: &HubConfig) -> Self {
        Self {
            signal: Arc::new(HubSignal::new()),
            cpus: Vec::with_capacity(MAX_CPUS),
            memory,
            io_space: HashMap::new(),
            txns: BTreeMap::new(),
            busy: HashMap::new(),
            deferred: VecDeque::new(),
            next_txn: 0,
            read_next_state: config.read_probe_next_state,
            stats: HubStats::default(),
        }
    }

    /// The hub's mutex/condition-variable record.
    pub fn signal(&self) -> Arc<HubSignal> {
        Arc::clone(&self.signal)
    }

    /// Registered CPU records, in CPU order.
    pub fn cpus(&self) -> &[CpuInterface] {
        &self.cpus
    }

    /// Memory map.
    pub const fn memory(&self) -> &MemoryMap {
        &self.memory
    }

    /// Mutable memory map.
    pub fn memory_mut(&mut self) -> &mut MemoryMap {
        &mut self.memory
    }

    /// Counters.
    pub const fn stats(&self) -> &HubStats {
        &self.stats
    }

    /// Reads transactions still open.
    pub fn open_transactions(&self) -> usize {
        self.txns.len()
    }

    /// Bytes last written to the I/O-space block containing `addr`.
    pub fn io_block(&self, addr: PhysAddr) -> Option<&BlockData> {
        self.io_space.get(&addr.block())
    }

    /// Builds `cpu`'s interface record and binds it in both directions.
    ///
    /// CPUs must register in id order, each exactly once.
    ///
    /// # Errors
    ///
    /// `InitializationFailure` if the CPU is out of order, beyond `MAX_CPUS`,
    /// or refuses the binding. Nothing is registered on error.
    pub fn register_cpu(&mut self, cpu: &mut Cpu) -> Result<()> {
        let id = cpu.id();
        if id.0 != self.cpus.len() || id.0 >= MAX_CPUS {
            return Err(CoherenceError::InitializationFailure(format!(
                "cannot register {id} in slot {}",
                self.cpus.len()
            )));
        }
        let interface = CpuInterface {
            cpu: id,
            port: cpu.port(),
            hub: self.signal(),
        };
        cpu.bind_system_interface(&interface)?;
        self.cpus.push(interface);
        debug!(cpu = %id, "cpu registered");
        Ok(())
    }

    /// Drops every registration, newest first.
    pub fn unregister_all(&mut self) {
        while let Some(interface) = self.cpus.pop() {
            debug!(cpu = %interface.cpu, "cpu unregistered");
        }
    }

    fn deliver(&self, cpu: CpuId, message: SysMessage) -> Delivery {
        match self.cpus.get(cpu.0) {
            Some(interface) => interface.port.deliver(message),
            None => {
                error!(%cpu, "message for unregistered cpu dropped");
                Delivery::Delivered
            }
        }
    }

    fn complete(&self, cpu: CpuId, completion: Completion) {
        let _ = self.deliver(cpu, SysMessage::DataTransfer(completion));
    }

    fn send_probe(&mut self, cpu: CpuId, probe: Probe) {
        self.stats.probes_sent += 1;
        if self.signal.has_parked(cpu) {
            self.park(cpu, probe);
            return;
        }
        if let Delivery::RingFull(probe) = self.deliver(cpu, SysMessage::Probe(probe)) {
            self.park(cpu, probe);
        }
    }

    fn park(&mut self, cpu: CpuId, probe: Probe) {
        self.stats.skid_parks += 1;
        trace!(%cpu, txn = probe.txn.0, "probe parked");
        self.signal.park(cpu, probe);
    }

    fn retry_skid(&mut self) -> usize {
        let parked = self.signal.take_skid();
        if parked.is_empty() {
            return 0;
        }
        let mut blocked: Vec<CpuId> = Vec::new();
        let mut delivered = 0;
        for (cpu, probe) in parked {
            if blocked.contains(&cpu) {
                self.signal.park(cpu, probe);
                continue;
            }
            match self.deliver(cpu, SysMessage::Probe(probe)) {
                Delivery::Delivered => delivered += 1,
                Delivery::RingFull(probe) => {
                    blocked.push(cpu);
                    self.signal.park(cpu, probe);
                }
            }
        }
        delivered
    }

    /// Handles one request from `cpu`.
    ///
    /// Reads to a block with a transaction already open wait their turn.
    pub fn route_request(&mut self, cpu: CpuId, request: SysRequest) {
        match request {
            SysRequest::Read { id, addr, kind } => self.open_read(cpu, id, addr, kind),
            SysRequest::IoWrite {
                id,
                addr,
                data,
                mask,
                written,
            } => {
                let block = self.io_space.entry(addr.block()).or_insert_with(zero_block);
                let offset = addr.block_offset();
                for (pos, &byte) in data.iter().enumerate() {
                    let index = offset + pos;
                    if index < block.len() && (written >> index) & 1 == 1 {
                        block[index] = byte;
                    }
                }
                self.stats.io_writes += 1;
                trace!(%cpu, %addr, mask, "io write");
                self.complete(cpu, Completion::request(id, None, false));
            }
            SysRequest::Victim { handle, addr, data } => {
                if self.memory.write_block(addr, &data) {
                    self.stats.memory_writes += 1;
                } else {
                    self.stats.nonexistent += 1;
                    error!(%cpu, %addr, "victim for non-existent memory dropped");
                }
                self.complete(cpu, Completion::victim(handle));
            }
            SysRequest::ProbeResponse(response) => {
                self.stats.probe_responses += 1;
                let Some(txn) = self.txns.get_mut(&response.txn) else {
                    error!(%cpu, txn = response.txn.0, "response for unknown transaction");
                    return;
                };
                if let Some(data) = response.data.filter(|_| response.status == ProbeStatus::HitDirty)
                {
                    txn.dirty = true;
                    txn.data = Some(data);
                }
                if response.status != ProbeStatus::Miss
                    && txn.next.apply(LineState::CLEAN).valid
                {
                    txn.shared = true;
                }
                txn.pending = txn.pending.saturating_sub(1);
                let done = txn.pending == 0;
                let key = response.txn;
                if let Some(victim) = response.victim {
                    self.complete(cpu, Completion::victim(victim));
                }
                if done {
                    self.finish(key);
                }
            }
            SysRequest::MemoryBarrier { id } => {
                trace!(%cpu, "memory barrier reached");
                self.complete(cpu, Completion::request(id, None, false));
            }
        }
    }

    fn probe_command(&self, kind: ReadKind) -> ProbeCommand {
        match kind {
            ReadKind::Shared => ProbeCommand::new(DataMovement::ReadAny, self.read_next_state),
            ReadKind::Modify => ProbeCommand::new(DataMovement::ReadAny, NextState::Invalid),
            ReadKind::ChangeToDirty | ReadKind::Wh64 => {
                ProbeCommand::new(DataMovement::Nop, NextState::Invalid)
            }
        }
    }

    fn open_read(&mut self, cpu: CpuId, id: RequestId, addr: PhysAddr, kind: ReadKind) {
        if addr.is_io() {
            let data = self.io_space.get(&addr.block()).copied().unwrap_or_else(zero_block);
            self.complete(cpu, Completion::request(id, Some(Box::new(data)), false));
            return;
        }
        if !self.memory.contains(addr) {
            self.stats.nonexistent += 1;
            warn!(%cpu, %addr, "read of non-existent memory");
            self.complete(cpu, Completion::nonexistent(id));
            return;
        }
        let block = addr.block();
        if self.busy.contains_key(&block) {
            trace!(%cpu, %addr, "read deferred behind open transaction");
            self.deferred
                .push_back((cpu, SysRequest::Read { id, addr, kind }));
            return;
        }

        let key = TxnId(self.next_txn);
        self.next_txn += 1;
        self.stats.transactions += 1;
        let cmd = self.probe_command(kind);
        let targets: Vec<CpuId> = self
            .cpus
            .iter()
            .map(|c| c.cpu)
            .filter(|&c| c != cpu)
            .collect();
        let _ = self.busy.insert(block, key);
        let _ = self.txns.insert(
            key,
            Transaction {
                origin: cpu,
                id,
                addr: block,
                kind,
                next: cmd.ns,
                pending: targets.len(),
                data: None,
                dirty: false,
                shared: false,
            },
        );
        debug!(%cpu, %addr, txn = key.0, ?kind, probes = targets.len(), "transaction open");

        if targets.is_empty() {
            self.finish(key);
            return;
        }
        for target in targets {
            self.send_probe(target, Probe::new(key, block, cmd));
        }
    }

    fn finish(&mut self, key: TxnId) {
        let Some(txn) = self.txns.remove(&key) else {
            return;
        };
        let _ = self.busy.remove(&txn.addr);

        if let Some(data) = txn.data.as_deref() {
            if self.memory.write_block(txn.addr, data) {
                self.stats.memory_writes += 1;
                self.stats.dirty_responses += 1;
            }
        }
        let fill = match txn.kind {
            ReadKind::Wh64 => zero_block(),
            _ => match txn.data {
                Some(data) => *data,
                None => {
                    self.stats.memory_reads += 1;
                    self.memory.read_block(txn.addr).unwrap_or_else(zero_block)
                }
            },
        };
        let shared = txn.shared && txn.kind == ReadKind::Shared;
        debug!(
            cpu = %txn.origin,
            addr = %txn.addr,
            txn = key.0,
            dirty = txn.dirty,
            shared,
            "transaction complete"
        );
        self.complete(txn.origin, Completion::request(txn.id, Some(Box::new(fill)), shared));
    }

    fn retry_deferred(&mut self) -> usize {
        let mut ready = 0;
        for _ in 0..self.deferred.len() {
            let Some((cpu, request)) = self.deferred.pop_front() else {
                break;
            };
            let blocked = match &request {
                SysRequest::Read { addr, .. } => self.busy.contains_key(&addr.block()),
                _ => false,
            };
            if blocked {
                self.deferred.push_back((cpu, request));
            } else {
                ready += 1;
                self.route_request(cpu, request);
            }
        }
        ready
    }

    /// Makes one non-blocking pass: skid buffer, every CPU's queue, deferred reads.
    ///
    /// Returns how much work was done; zero means the hub is idle.
    pub fn poll(&mut self) -> usize {
        let mut work = self.retry_skid();
        for index in 0..self.cpus.len() {
            let interface = &self.cpus[index];
            let cpu = interface.cpu;
            let requests: Vec<SysRequest> = {
                let mut side = interface.port.lock();
                side.controller.drain_requests().collect()
            };
            for request in requests {
                self.stats.requests += 1;
                work += 1;
                self.route_request(cpu, request);
            }
        }
        work + self.retry_deferred()
    }

    /// Thread body: polls until idle, then sleeps on the hub signal until a CPU
    /// rings or shutdown is requested.
    pub fn run(mut self) -> Self {
        debug!(cpus = self.cpus.len(), "hub thread start");
        loop {
            let seen = self.signal.doorbell();
            while self.poll() > 0 {}
            let mut state = self.signal.lock();
            while state.doorbell == seen && !state.shutdown {
                self.signal.wait(&mut state);
            }
            if state.shutdown {
                break;
            }
        }
        debug!("hub thread stop");
        self
    }
}
