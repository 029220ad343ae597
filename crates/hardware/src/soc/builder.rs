//! System construction, startup, and teardown.
//!
//! This module builds the complete multiprocessor from configuration. It performs:
//! 1. **Allocation:** The system record, one record per CPU, and one backing block per
//!    memory array, all from the block allocator.
//! 2. **Registration:** One controller and CPU handle per CPU, each registered with the hub.
//! 3. **Rollback:** Any failure releases every CPU record and array, then the system
//!    record, before reporting `InitializationFailure`.
//! 4. **Threads:** `start` runs the hub and each CPU on its own thread; `shutdown`
//!    stops and joins them and reports statistics.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::cbox::CoherenceController;
use crate::common::{CoherenceError, CpuId, Result};
use crate::config::Config;
use crate::cpu::Cpu;
use crate::soc::alloc::{Block, BlockAllocator, BlockClass};
use crate::soc::hub::Hub;
use crate::soc::interface::HubSignal;
use crate::soc::memory::MemoryMap;
use crate::stats::SystemStats;

/// Upper bound on `System::settle` passes before it gives up.
const SETTLE_LIMIT: usize = 100_000;

/// Blocks acquired so far during `System::allocate`.
struct Reservation<'a> {
    allocator: &'a dyn BlockAllocator,
    record: Block,
    cpus: Vec<Block>,
    arrays: Vec<Block>,
}

impl Reservation<'_> {
    fn acquire(&mut self, class: BlockClass) -> Option<Block> {
        self.allocator.allocate_block(class)
    }

    fn rollback(self, reason: String) -> CoherenceError {
        error!(%reason, cpus = self.cpus.len(), arrays = self.arrays.len(), "startup rollback");
        for block in self.cpus.into_iter().chain(self.arrays) {
            self.allocator.release_block(block);
        }
        self.allocator.release_block(self.record);
        CoherenceError::InitializationFailure(reason)
    }
}

/// A fully built, not yet running system.
pub struct System {
    allocator: Arc<dyn BlockAllocator>,
    record: Option<Block>,
    cpu_blocks: Vec<Block>,
    hub: Option<Hub>,
    cpus: Vec<Cpu>,
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("cpus", &self.cpus.len())
            .field("hub", &self.hub.is_some())
            .finish_non_exhaustive()
    }
}

impl System {
    /// Builds every record the configuration asks for, or nothing at all.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated before anything is allocated.
    /// * `allocator` - Source of the system, CPU, and memory-array blocks.
    ///
    /// # Errors
    ///
    /// Configuration errors from `Config::validate`, or `InitializationFailure`
    /// after a failed allocation or registration has been rolled back.
    pub fn allocate(config: &Config, allocator: Arc<dyn BlockAllocator>) -> Result<Self> {
        let depth = config.cbox.probe_queue_depth;
        Self::allocate_with(config, allocator, |id| {
            let controller = CoherenceController::new(id, config.cbox.bcache_size()?)?;
            Ok(Cpu::new(controller, depth))
        })
    }

    /// Like `allocate`, but each CPU handle comes from `make_cpu`.
    ///
    /// The handle for CPU `i` is registered with the hub right after it is
    /// made; a factory error or a refused registration rolls everything back.
    ///
    /// # Errors
    ///
    /// Same as `allocate`.
    pub fn allocate_with(
        config: &Config,
        allocator: Arc<dyn BlockAllocator>,
        mut make_cpu: impl FnMut(CpuId) -> Result<Cpu>,
    ) -> Result<Self> {
        config.validate()?;
        let size = config.cbox.bcache_size()?;
        let sys = &config.system;

        let Some(record) = allocator.allocate_block(BlockClass::System) else {
            error!("system record allocation failed");
            return Err(CoherenceError::InitializationFailure(
                "system record allocation failed".to_string(),
            ));
        };
        let mut reservation = Reservation {
            allocator: allocator.as_ref(),
            record,
            cpus: Vec::with_capacity(sys.cpu_count),
            arrays: Vec::with_capacity(sys.array_count),
        };

        for i in 0..sys.cpu_count {
            match reservation.acquire(BlockClass::Cpu(CpuId(i))) {
                Some(block) => reservation.cpus.push(block),
                None => return Err(reservation.rollback(format!("cpu{i} record allocation failed"))),
            }
        }
        for index in 0..sys.array_count {
            let class = BlockClass::MemoryArray {
                index,
                bytes: sys.array_size_bytes,
            };
            match reservation.acquire(class) {
                Some(block) => reservation.arrays.push(block),
                None => {
                    return Err(reservation.rollback(format!("memory array {index} allocation failed")));
                }
            }
        }

        let arrays = std::mem::take(&mut reservation.arrays);
        let mut hub = Hub::new(MemoryMap::contiguous(arrays), &config.hub);
        let mut cpus = Vec::with_capacity(sys.cpu_count);
        for i in 0..sys.cpu_count {
            let registered = make_cpu(CpuId(i))
                .and_then(|mut cpu| hub.register_cpu(&mut cpu).map(|()| cpu));
            match registered {
                Ok(cpu) => cpus.push(cpu),
                Err(e) => {
                    hub.unregister_all();
                    reservation.arrays = hub.memory_mut().take_blocks();
                    return Err(reservation.rollback(format!("cpu{i} registration failed: {e}")));
                }
            }
        }

        info!(
            cpus = sys.cpu_count,
            arrays = sys.array_count,
            array_bytes = sys.array_size_bytes,
            bcache_mb = size.megabytes(),
            "system allocated"
        );
        let Reservation { record, cpus: cpu_blocks, .. } = reservation;
        Ok(Self {
            allocator,
            record: Some(record),
            cpu_blocks,
            hub: Some(hub),
            cpus,
        })
    }

    /// CPU handles in id order.
    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    /// Handle for CPU `index`.
    pub fn cpu(&self, index: usize) -> Option<&Cpu> {
        self.cpus.get(index)
    }

    /// The hub, while the system is not running.
    pub const fn hub(&self) -> Option<&Hub> {
        self.hub.as_ref()
    }

    /// Mutable hub, while the system is not running.
    pub fn hub_mut(&mut self) -> Option<&mut Hub> {
        self.hub.as_mut()
    }

    /// Runs one hub pass and one probe-service pass per CPU on the calling thread.
    ///
    /// Returns how much work was done.
    pub fn step(&mut self) -> usize {
        let mut work = self.hub.as_mut().map_or(0, Hub::poll);
        for cpu in &self.cpus {
            work += cpu.service_probes();
        }
        work
    }

    /// Steps until nothing is left to do. Returns the total work done.
    pub fn settle(&mut self) -> usize {
        let mut total = 0;
        for _ in 0..SETTLE_LIMIT {
            let work = self.step();
            if work == 0 {
                break;
            }
            total += work;
        }
        total
    }

    /// Snapshot of every counter.
    pub fn stats(&self) -> SystemStats {
        let hub = self.hub.as_ref().map(|h| *h.stats()).unwrap_or_default();
        SystemStats::new(self.cpus.iter().map(Cpu::stats).collect(), hub)
    }

    /// Spawns the hub thread and one thread per CPU.
    ///
    /// # Errors
    ///
    /// `InitializationFailure` if the system was already started or a thread
    /// cannot be spawned; threads already running are stopped first.
    pub fn start(mut self) -> Result<RunningSystem> {
        let Some(hub) = self.hub.take() else {
            return Err(CoherenceError::InitializationFailure(
                "system already started".to_string(),
            ));
        };
        let signal = hub.signal();
        let hub_thread = thread::Builder::new()
            .name("hub".to_string())
            .spawn(move || hub.run())
            .map_err(|e| CoherenceError::InitializationFailure(format!("hub thread: {e}")))?;

        let cpus = self.cpus.clone();
        let mut running = RunningSystem {
            system: Some(self),
            signal,
            hub_thread: Some(hub_thread),
            cpu_threads: Vec::new(),
        };
        for cpu in cpus {
            let id = cpu.id();
            let spawned = thread::Builder::new()
                .name(format!("{id}"))
                .spawn(move || cpu.run());
            match spawned {
                Ok(handle) => running.cpu_threads.push(handle),
                Err(e) => {
                    running.stop();
                    return Err(CoherenceError::InitializationFailure(format!(
                        "{id} thread: {e}"
                    )));
                }
            }
        }
        info!(cpus = running.cpus().len(), "system started");
        Ok(running)
    }
}

impl Drop for System {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.as_mut() {
            hub.unregister_all();
            for block in hub.memory_mut().take_blocks() {
                self.allocator.release_block(block);
            }
        }
        for block in self.cpu_blocks.drain(..) {
            self.allocator.release_block(block);
        }
        if let Some(record) = self.record.take() {
            self.allocator.release_block(record);
        }
        debug!("system released");
    }
}

/// A system whose hub and CPUs are running on their own threads.
#[derive(Debug)]
pub struct RunningSystem {
    system: Option<System>,
    signal: Arc<HubSignal>,
    hub_thread: Option<JoinHandle<Hub>>,
    cpu_threads: Vec<JoinHandle<()>>,
}

impl RunningSystem {
    /// CPU handles in id order; clone them into workload threads.
    pub fn cpus(&self) -> &[Cpu] {
        match &self.system {
            Some(system) => system.cpus(),
            None => &[],
        }
    }

    /// Handle for CPU `index`.
    pub fn cpu(&self, index: usize) -> Option<&Cpu> {
        self.cpus().get(index)
    }

    fn stop(&mut self) {
        if let Some(handle) = self.hub_thread.take() {
            self.signal.shutdown();
            match handle.join() {
                Ok(hub) => {
                    if let Some(system) = self.system.as_mut() {
                        system.hub = Some(hub);
                    }
                }
                Err(_) => error!("hub thread panicked"),
            }
        }
        for cpu in self.cpus() {
            cpu.halt();
        }
        for handle in self.cpu_threads.drain(..) {
            if handle.join().is_err() {
                error!("cpu thread panicked");
            }
        }
    }

    /// Stops and joins every thread, then returns the run's statistics.
    ///
    /// Every block goes back to the allocator when the returned system is dropped.
    pub fn shutdown(mut self) -> (System, SystemStats) {
        self.stop();
        let Some(system) = self.system.take() else {
            unreachable!("only shutdown takes the system out");
        };
        let stats = system.stats();
        info!("system shut down");
        (system, stats)
    }
}

impl Drop for RunningSystem {
    fn drop(&mut self) {
        self.stop();
    }
}
