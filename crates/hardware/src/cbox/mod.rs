//! Cbox: the per-CPU coherence controller.
//!
//! The controller sits between the pipeline and the chipset. It provides:
//! 1. **Miss tracking:** MAF allocation, merging, and completion.
//! 2. **Eviction:** Victim buffer management for primary-cache, backup-cache, and probe victims.
//! 3. **I/O writes:** IOWB merging and flushing.
//! 4. **Probes:** Answers from the duplicate tags and backup cache, never blocking on the hub.
//! 5. **Configuration:** The Cbox CSR image, which also sizes the backup cache.
//!
//! The controller never talks to the hub directly. Requests are queued in an
//! outbound FIFO that the CPU port drains into the hub; completions come back
//! through `drain_completion`.

/// Backup cache.
pub mod bcache;
/// Cbox CSR image.
pub mod csr;
/// Duplicate tag store.
pub mod ctag;
/// I/O write buffer.
pub mod iowb;
/// Miss Address File.
pub mod maf;
/// Probe codec.
pub mod probe;
/// Line state bits.
pub mod state;
/// Victim buffer.
pub mod victim;

use std::collections::VecDeque;
use std::collections::vec_deque::Drain;

use tracing::{debug, trace, warn};

use self::bcache::{BackupCache, BcacheSize};
use self::csr::{CboxCsr, CboxCsrs};
use self::ctag::DuplicateTagStore;
use self::iowb::{IoWriteBuffer, IowbHandle};
use self::maf::{MafCompletion, MafHandle, MafType, MissAddressFile};
use self::probe::{DataMovement, NextState, Probe, ProbeResponse, ProbeStatus};
use self::state::LineState;
use self::victim::{VictimBuffer, VictimDisposition, VictimHandle};
use crate::common::{
    BlockData, CoherenceError, CpuId, InvalidRequest, LsqRef, PhysAddr, ProtocolAnomaly,
    Resource, Result,
};
use crate::soc::message::{Completion, CompletionTarget, ReadKind, SysRequest};
use crate::stats::CoherenceStats;

/// One CPU's coherence controller.
#[derive(Debug)]
pub struct CoherenceController {
    cpu: CpuId,
    csrs: CboxCsrs,
    maf: MissAddressFile,
    victims: VictimBuffer,
    iowb: IoWriteBuffer,
    ctags: DuplicateTagStore,
    bcache: BackupCache,
    outbound: VecDeque<SysRequest>,
    anomalies: Vec<ProtocolAnomaly>,
    stats: CoherenceStats,
}

impl CoherenceController {
    /// Creates a controller whose CSRs enable a backup cache of `size`.
    ///
    /// # Errors
    ///
    /// Propagates CSR range errors (none occur for valid sizes).
    pub fn new(cpu: CpuId, size: BcacheSize) -> Result<Self> {
        let mut csrs = CboxCsrs::new();
        csrs.set(CboxCsr::BcEnable, 1)?;
        csrs.set(CboxCsr::BcSize, size.encoding())?;
        csrs.set(CboxCsr::DupTagEnable, 1)?;
        csrs.set(CboxCsr::EnableEvict, 1)?;
        csrs.set(CboxCsr::EnableProbeCheck, 1)?;
        Self::with_csrs(cpu, csrs)
    }

    /// Creates a controller from a prepared CSR image.
    ///
    /// # Errors
    ///
    /// `InvalidRequest::BcacheEncoding` if `BcSize` is not one of the five encodings.
    pub fn with_csrs(cpu: CpuId, csrs: CboxCsrs) -> Result<Self> {
        let size = BcacheSize::from_encoding(csrs.get(CboxCsr::BcSize))?;
        debug!(%cpu, mb = size.megabytes(), "cbox init");
        Ok(Self {
            cpu,
            csrs,
            maf: MissAddressFile::new(),
            victims: VictimBuffer::new(),
            iowb: IoWriteBuffer::new(),
            ctags: DuplicateTagStore::new(),
            bcache: BackupCache::new(size),
            outbound: VecDeque::new(),
            anomalies: Vec::new(),
            stats: CoherenceStats::default(),
        })
    }

    /// CPU this controller belongs to.
    pub const fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// CSR image.
    pub const fn csrs(&self) -> &CboxCsrs {
        &self.csrs
    }

    /// Miss Address File.
    pub const fn maf(&self) -> &MissAddressFile {
        &self.maf
    }

    /// Victim buffer.
    pub const fn victims(&self) -> &VictimBuffer {
        &self.victims
    }

    /// I/O write buffer.
    pub const fn iowb(&self) -> &IoWriteBuffer {
        &self.iowb
    }

    /// Duplicate tag store.
    pub const fn ctags(&self) -> &DuplicateTagStore {
        &self.ctags
    }

    /// Backup cache.
    pub const fn bcache(&self) -> &BackupCache {
        &self.bcache
    }

    /// Every protocol anomaly seen so far.
    pub fn anomalies(&self) -> &[ProtocolAnomaly] {
        &self.anomalies
    }

    /// Counters.
    pub const fn stats(&self) -> &CoherenceStats {
        &self.stats
    }

    /// Combined state of `addr` across the duplicate tags and the backup cache.
    pub fn lookup(&self, addr: PhysAddr) -> LineState {
        self.ctags
            .lookup(addr)
            .state
            .merge(self.bcache.lookup(addr).state)
    }

    /// Number of requests waiting for the hub.
    pub fn pending_requests(&self) -> usize {
        self.outbound.len()
    }

    /// Hands every queued request to the caller in FIFO order.
    pub fn drain_requests(&mut self) -> Drain<'_, SysRequest> {
        self.outbound.drain(..)
    }

    fn note<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_backpressure() {
                self.stats.backpressure += 1;
                trace!(cpu = %self.cpu, error = %e, "backpressure");
            }
        }
        result
    }

    /// Records a memory reference and issues whatever the hub must do for it.
    ///
    /// Loads and instruction fetches that hit locally, and stores to lines
    /// already owned, complete at once. A load or fetch to a block with a
    /// pending miss of the same kind joins that entry without a new request.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for misaligned or block-spanning references, or
    /// ownership requests to I/O space; `ResourceExhausted` when the MAF (or,
    /// for an eviction, the victim buffer) is full.
    pub fn allocate_miss(
        &mut self,
        kind: MafType,
        addr: PhysAddr,
        mask: u64,
        refs: &[LsqRef],
    ) -> Result<MafHandle> {
        let result = self.issue(kind, addr, mask, refs);
        self.note(result)
    }

    fn issue(
        &mut self,
        kind: MafType,
        addr: PhysAddr,
        mask: u64,
        refs: &[LsqRef],
    ) -> Result<MafHandle> {
        MissAddressFile::validate(kind, addr, refs)?;
        let io_ok = matches!(kind, MafType::Load(_) | MafType::Istream | MafType::MemoryBarrier);
        if addr.is_io() && !io_ok {
            return Err(InvalidRequest::IoSpace(addr).into());
        }

        let state = if addr.is_io() {
            LineState::INVALID
        } else {
            self.lookup(addr)
        };
        let owned = state.is_dirty() && !state.shared;

        let (kind, read) = match kind {
            MafType::MemoryBarrier => return self.barrier(addr, mask, refs),
            MafType::Ecb => return self.evict_block(addr, mask, refs, state),
            MafType::Load(_) | MafType::Istream if state.valid => {
                return self.complete_locally(kind, addr, mask, refs, state);
            }
            MafType::Load(_) | MafType::Istream => (kind, ReadKind::Shared),
            _ if owned => return self.complete_locally(kind, addr, mask, refs, state),
            MafType::Wh64 => (kind, ReadKind::Wh64),
            MafType::Store(w) | MafType::StoreChangeToDirty(w) if state.valid => {
                (MafType::StoreChangeToDirty(w), ReadKind::ChangeToDirty)
            }
            MafType::StoreConditional(w) | MafType::StoreCondChangeToDirty(w) if state.valid => {
                (MafType::StoreCondChangeToDirty(w), ReadKind::ChangeToDirty)
            }
            MafType::Store(w) | MafType::StoreChangeToDirty(w) => {
                (MafType::Store(w), ReadKind::Modify)
            }
            MafType::StoreConditional(w) | MafType::StoreCondChangeToDirty(w) => {
                (MafType::StoreConditional(w), ReadKind::Modify)
            }
        };

        let (handle, merged) = self.maf.allocate(kind, addr, mask, refs)?;
        if merged {
            self.stats.maf_merges += 1;
            return Ok(handle);
        }
        self.stats.maf_allocations += 1;
        self.outbound.push_back(SysRequest::Read {
            id: handle.request_id(),
            addr,
            kind: read,
        });
        debug!(cpu = %self.cpu, %addr, ?kind, slot = handle.index(), "miss issued");
        Ok(handle)
    }

    fn complete_locally(
        &mut self,
        kind: MafType,
        addr: PhysAddr,
        mask: u64,
        refs: &[LsqRef],
        state: LineState,
    ) -> Result<MafHandle> {
        let (handle, _) = self.maf.allocate(kind, addr, mask, refs)?;
        self.stats.maf_allocations += 1;
        self.stats.local_hits += 1;
        if !self.ctags.lookup(addr).hit && self.victims.has_room() {
            self.fill_primary(addr, state)?;
        }
        let data = self.bcache.read(addr).map(|b| Box::new(*b));
        self.maf.complete(handle, data, state.shared, false)?;
        trace!(cpu = %self.cpu, %addr, ?kind, "local hit");
        Ok(handle)
    }

    fn barrier(&mut self, addr: PhysAddr, mask: u64, refs: &[LsqRef]) -> Result<MafHandle> {
        let (handle, _) = self.maf.allocate(MafType::MemoryBarrier, addr, mask, refs)?;
        self.stats.maf_allocations += 1;
        let flushed = self.flush_io_writes();
        self.outbound.push_back(SysRequest::MemoryBarrier {
            id: handle.request_id(),
        });
        debug!(cpu = %self.cpu, flushed, "memory barrier");
        Ok(handle)
    }

    fn evict_block(
        &mut self,
        addr: PhysAddr,
        mask: u64,
        refs: &[LsqRef],
        state: LineState,
    ) -> Result<MafHandle> {
        if state.is_dirty() && !self.victims.has_room() {
            return Err(CoherenceError::exhausted(Resource::VictimBuffer));
        }
        let (handle, _) = self.maf.allocate(MafType::Ecb, addr, mask, refs)?;
        self.stats.maf_allocations += 1;
        if state.valid {
            let _ = self.ctags.invalidate(addr);
            if let Some((bc_state, data)) = self.bcache.invalidate(addr) {
                if state.is_dirty() || bc_state.is_dirty() {
                    let _ = self.allocate_victim(addr, &data, VictimDisposition::ToMemory)?;
                }
            }
        }
        self.maf.complete(handle, None, false, false)?;
        debug!(cpu = %self.cpu, %addr, dirty = state.is_dirty(), "evict cache block");
        Ok(handle)
    }

    /// Hands a completed MAF entry to the pipeline and frees the slot.
    ///
    /// # Errors
    ///
    /// See `MissAddressFile::consume`.
    pub fn consume(&mut self, handle: MafHandle) -> Result<MafCompletion> {
        self.maf.consume(handle)
    }

    /// Places a block in the victim buffer and starts its transfer.
    ///
    /// Backup-cache victims drain locally at once; memory victims are queued
    /// for the hub and stay busy until it acknowledges them.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` when every slot is still draining.
    pub fn allocate_victim(
        &mut self,
        addr: PhysAddr,
        data: &BlockData,
        disposition: VictimDisposition,
    ) -> Result<VictimHandle> {
        let result = self.victims.allocate(addr, data, disposition);
        let handle = self.note(result)?;
        match disposition {
            VictimDisposition::ToBcache => self.stats.victims_to_bcache += 1,
            VictimDisposition::ToMemory => self.stats.victims_to_memory += 1,
            VictimDisposition::ProbeResponse => self.stats.victims_probe += 1,
        }
        self.transfer_victims();
        Ok(handle)
    }

    /// Accepts a dirty block the pipeline evicts from its primary data cache.
    ///
    /// # Errors
    ///
    /// `InvalidRequest::IoSpace` for I/O addresses, `ResourceExhausted` when
    /// the victim buffer is full.
    pub fn retire_victim(&mut self, addr: PhysAddr, data: &BlockData) -> Result<VictimHandle> {
        if addr.is_io() {
            return Err(InvalidRequest::IoSpace(addr).into());
        }
        let handle = self.allocate_victim(addr, data, VictimDisposition::ToBcache)?;
        let _ = self.ctags.invalidate(addr);
        Ok(handle)
    }

    fn transfer_victims(&mut self) {
        for handle in self.victims.mark_for_transfer(VictimDisposition::ToBcache) {
            self.drain_to_bcache(handle);
        }
        for handle in self.victims.mark_for_transfer(VictimDisposition::ToMemory) {
            if let Some(entry) = self.victims.get(handle) {
                self.outbound.push_back(SysRequest::Victim {
                    handle,
                    addr: entry.addr,
                    data: Box::new(entry.data),
                });
            }
        }
    }

    fn drain_to_bcache(&mut self, handle: VictimHandle) {
        let Some(entry) = self.victims.get(handle) else {
            return;
        };
        let (addr, data) = (entry.addr, entry.data);
        if self.bcache.write(addr, &data) {
            let current = self.bcache.lookup(addr).state;
            let _ = self.bcache.set_state(addr, LineState { dirty: true, ..current });
            let _ = self.victims.complete_transfer(handle);
            trace!(cpu = %self.cpu, %addr, "victim drained to bcache");
        } else {
            // Backup-cache copy is gone; write the block straight to memory.
            self.outbound.push_back(SysRequest::Victim {
                handle,
                addr,
                data: Box::new(data),
            });
        }
    }

    /// Buffers an I/O-space store, merging with a pending entry when possible.
    ///
    /// # Errors
    ///
    /// See `IoWriteBuffer::allocate`.
    pub fn allocate_io_write(
        &mut self,
        addr: PhysAddr,
        data: &[u8],
        mask: u8,
        store_len: usize,
        refs: &[LsqRef],
    ) -> Result<(IowbHandle, bool)> {
        let result = self.iowb.allocate(addr, data, mask, store_len, refs);
        let (handle, merged) = self.note(result)?;
        if merged {
            self.stats.iowb_merges += 1;
        } else {
            self.stats.iowb_allocations += 1;
        }
        Ok((handle, merged))
    }

    /// Issues every unissued IOWB entry to the hub. Returns how many were sent.
    pub fn flush_io_writes(&mut self) -> usize {
        let issued = self.iowb.issue_pending();
        for &handle in &issued {
            if let Some(entry) = self.iowb.get(handle) {
                self.outbound.push_back(SysRequest::IoWrite {
                    id: handle.request_id(),
                    addr: entry.addr,
                    data: entry.payload().to_vec(),
                    mask: entry.mask,
                    written: entry.written,
                });
            }
        }
        issued.len()
    }

    /// Writes `bytes` into a line this CPU owns.
    ///
    /// # Errors
    ///
    /// `InvalidRequest::SpansBlock` if the bytes cross a block boundary,
    /// `InvalidRequest::NotOwned` unless the line is held dirty and unshared.
    pub fn store_data(&mut self, addr: PhysAddr, bytes: &[u8]) -> Result<()> {
        if !addr.fits_in_block(bytes.len()) {
            return Err(InvalidRequest::SpansBlock {
                addr,
                len: bytes.len(),
            }
            .into());
        }
        let state = self.lookup(addr);
        if !state.is_dirty() || state.shared || !self.bcache.write(addr, bytes) {
            return Err(InvalidRequest::NotOwned(addr.block()).into());
        }
        Ok(())
    }

    /// Answers a probe without blocking.
    ///
    /// Reserved next-state codes are recorded as anomalies and answered as
    /// no-ops. A line this CPU already evicted but whose victim is still
    /// draining is answered dirty from the victim buffer. Dirty data leaving
    /// the CPU is first placed in the victim buffer as a probe response. The next state is applied only to lines the data
    /// movement counts as a hit. The response is also queued for the hub.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` if dirty data must leave and the victim buffer is
    /// full; nothing changes and the probe should be retried.
    pub fn handle_probe(&mut self, probe: &Probe) -> Result<ProbeResponse> {
        let cmd = probe.command();
        let addr = probe.addr.block();

        if cmd.ns.is_reserved() {
            let anomaly = ProtocolAnomaly {
                addr,
                raw: probe.raw,
                dm: cmd.dm as u8,
                ns: cmd.ns as u8,
            };
            warn!(cpu = %self.cpu, txn = probe.txn.0, %anomaly, "protocol anomaly");
            self.anomalies.push(anomaly);
            self.stats.anomalies += 1;
            let response = ProbeResponse {
                txn: probe.txn,
                addr,
                status: ProbeStatus::Miss,
                data: None,
                victim: None,
                anomaly: true,
            };
            self.outbound
                .push_back(SysRequest::ProbeResponse(response.clone()));
            return Ok(response);
        }

        let state = self.lookup(addr);
        if !state.valid && cmd.dm != DataMovement::Nop {
            if let Some(block) = self.evicted_block(addr) {
                self.stats.probe_hits += 1;
                trace!(
                    cpu = %self.cpu,
                    txn = probe.txn.0,
                    %addr,
                    "probe answered from victim buffer"
                );
                let response = ProbeResponse {
                    txn: probe.txn,
                    addr,
                    status: ProbeStatus::HitDirty,
                    data: Some(Box::new(block)),
                    victim: None,
                    anomaly: false,
                };
                self.outbound
                    .push_back(SysRequest::ProbeResponse(response.clone()));
                return Ok(response);
            }
        }
        let hit = cmd.dm.is_hit(state);
        let next = if hit { cmd.ns.apply(state) } else { state };
        let writeback = hit && state.is_dirty() && !next.is_dirty();
        let block = self.bcache.read(addr).copied();

        let mut data = None;
        let mut victim = None;
        if let Some(block) = block {
            if cmd.dm.returns_data(state) || writeback {
                if state.is_dirty() {
                    let result =
                        self.victims
                            .allocate(addr, &block, VictimDisposition::ProbeResponse);
                    let handle = self.note(result)?;
                    let _ = self.victims.mark_for_transfer(VictimDisposition::ProbeResponse);
                    self.stats.victims_probe += 1;
                    victim = Some(handle);
                }
                data = Some(Box::new(block));
            }
        }

        let status = match (hit, state.is_dirty()) {
            (false, _) => ProbeStatus::Miss,
            (true, false) => ProbeStatus::HitClean,
            (true, true) => ProbeStatus::HitDirty,
        };
        if hit {
            self.stats.probe_hits += 1;
            if cmd.ns != NextState::Nop {
                self.apply_state(addr, next);
            }
        } else {
            self.stats.probe_misses += 1;
        }
        trace!(
            cpu = %self.cpu,
            txn = probe.txn.0,
            %addr,
            ?cmd,
            ?status,
            "probe answered"
        );

        let response = ProbeResponse {
            txn: probe.txn,
            addr,
            status,
            data,
            victim,
            anomaly: false,
        };
        self.outbound
            .push_back(SysRequest::ProbeResponse(response.clone()));
        Ok(response)
    }

    /// Dirty data for `addr` evicted from this CPU but not yet accepted by the hub.
    fn evicted_block(&self, addr: PhysAddr) -> Option<BlockData> {
        let handle = self.victims.find_draining(addr)?;
        self.victims
            .get(handle)
            .filter(|e| e.disposition != Some(VictimDisposition::ProbeResponse))
            .map(|e| e.data)
    }

    fn apply_state(&mut self, addr: PhysAddr, next: LineState) {
        if next.valid {
            let _ = self.ctags.set_state(addr, next);
            let _ = self.bcache.set_state(addr, next);
        } else {
            let _ = self.ctags.invalidate(addr);
            let _ = self.bcache.invalidate(addr);
        }
    }

    /// Applies a completion delivered by the hub.
    ///
    /// Read fills are installed in the backup cache and duplicate tags before
    /// the MAF entry is marked complete. A fill that cannot be installed
    /// because the victim buffer is full still completes the entry; the line
    /// is simply left uncached.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a completion naming an unused or already-complete slot.
    pub fn drain_completion(&mut self, completion: Completion) -> Result<()> {
        self.stats.completions += 1;
        let Completion {
            target,
            data,
            shared,
            nxm,
        } = completion;

        let id = match target {
            CompletionTarget::Victim(handle) => {
                self.victims.complete_transfer(handle)?;
                self.victims.release(handle)?;
                trace!(cpu = %self.cpu, slot = handle.index(), "victim acknowledged");
                return Ok(());
            }
            CompletionTarget::Request(id) if id.is_iowb() => {
                return self.iowb.complete(IowbHandle(id.index() as u8));
            }
            CompletionTarget::Request(id) => id,
        };

        let handle = MafHandle(id.index() as u8);
        let entry = self
            .maf
            .get(handle)
            .ok_or(InvalidRequest::StaleHandle(id.raw()))?;
        let (kind, addr, io) = (entry.kind, entry.addr, entry.io_request);

        if nxm {
            debug!(cpu = %self.cpu, %addr, "non-existent memory");
            return self.maf.complete(handle, None, false, true);
        }

        let owned = kind.is_some_and(MafType::needs_ownership);
        let shared = shared && !owned;
        if kind.is_some_and(MafType::is_change_to_dirty) && self.lookup(addr).valid {
            // The local copy survived; only ownership changes hands.
            self.take_ownership(addr);
            let local = self.bcache.read(addr).map(|b| Box::new(*b));
            self.maf.complete(handle, local.or(data), false, false)?;
            debug!(cpu = %self.cpu, %addr, slot = handle.index(), "change to dirty complete");
            return Ok(());
        }
        if let (Some(block), false) = (data.as_deref(), io) {
            let state = if owned {
                LineState::DIRTY
            } else if shared {
                LineState::CLEAN_SHARED
            } else {
                LineState::CLEAN
            };
            if let Err(e) = self.install(addr, block, state) {
                if !e.is_backpressure() {
                    return Err(e);
                }
                self.stats.backpressure += 1;
                debug!(cpu = %self.cpu, %addr, "fill left uncached");
            }
        }
        self.maf.complete(handle, data, shared, false)?;
        debug!(cpu = %self.cpu, %addr, slot = handle.index(), "miss complete");
        Ok(())
    }

    fn take_ownership(&mut self, addr: PhysAddr) {
        if self.ctags.set_state(addr, LineState::DIRTY) {
            let current = self.bcache.lookup(addr).state;
            let _ = self.bcache.set_state(
                addr,
                LineState {
                    shared: false,
                    ..current
                },
            );
        } else {
            let _ = self.bcache.set_state(addr, LineState::DIRTY);
        }
    }

    fn install(&mut self, addr: PhysAddr, data: &BlockData, state: LineState) -> Result<()> {
        // A dirty primary copy of the displaced line is pulled down first so
        // the backup-cache eviction writes it back.
        if let Some(occupant) = self.bcache.occupant(addr) {
            if occupant.addr != addr.block() {
                if let Some(prev) = self.ctags.invalidate(occupant.addr) {
                    if prev.is_dirty() {
                        let _ = self.bcache.set_state(
                            occupant.addr,
                            LineState {
                                dirty: true,
                                ..occupant.state()
                            },
                        );
                    }
                }
            }
        }

        let backing = LineState {
            dirty: false,
            ..state
        };
        let eviction =
            self.bcache
                .insert(addr, data, backing, &mut self.victims, VictimDisposition::ToMemory)?;
        if let Some(evicted) = eviction {
            if evicted.victim.is_some() {
                self.stats.victims_to_memory += 1;
            }
        }

        if self.victims.has_room() {
            self.fill_primary(addr, state)?;
        } else {
            let _ = self.bcache.set_state(addr, state);
        }
        self.transfer_victims();
        Ok(())
    }

    fn fill_primary(&mut self, addr: PhysAddr, state: LineState) -> Result<()> {
        if let Some(evicted) = self.ctags.fill(addr, state) {
            if evicted.state.is_dirty() {
                if let Some(block) = self.bcache.read(evicted.addr).copied() {
                    let _ = self.victims.allocate(
                        evicted.addr,
                        &block,
                        VictimDisposition::ToBcache,
                    )?;
                    self.stats.victims_to_bcache += 1;
                }
            }
        }
        self.transfer_victims();
        Ok(())
    }
}
