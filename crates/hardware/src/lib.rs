//! Multiprocessor cache-coherence subsystem.
//!
//! This crate models the memory side of a shared-memory multiprocessor with the following:
//! 1. **Cbox:** Per-CPU coherence controller with a Miss Address File, victim buffer,
//!    I/O write buffer, duplicate tags, backup cache, and CSR image.
//! 2. **CPU:** Thread-safe handle that issues references, waits for completions, and
//!    answers probes.
//! 3. **Hub:** Chipset that orders transactions per block, probes every other CPU,
//!    and parks probes that do not fit in a skid buffer.
//! 4. **System:** All-or-nothing construction with rollback, threads, and statistics.

/// Per-CPU coherence controller (MAF, victim buffer, IOWB, CTAG, Bcache, CSRs).
pub mod cbox;
/// Common types and constants (addresses, ids, block data, errors).
pub mod common;
/// System configuration (defaults, validation, hierarchical config structures).
pub mod config;
/// CPU handle and probe-service loop.
pub mod cpu;
/// Chipset (hub, interface records, memory arrays, builder).
pub mod soc;
/// Coherence statistics collection and reporting.
pub mod stats;

/// Root configuration type; use `Config::default()` or deserialize from JSON.
pub use crate::config::Config;
/// Per-CPU coherence controller.
pub use crate::cbox::CoherenceController;
/// CPU handle; clone it into workload threads.
pub use crate::cpu::Cpu;
/// Crate error and result types.
pub use crate::common::{CoherenceError, Result};
/// Top-level system; construct with `System::allocate`.
pub use crate::soc::{RunningSystem, System};
/// Block allocation seam and its heap-backed default.
pub use crate::soc::alloc::{BlockAllocator, HeapAllocator};
/// Run statistics.
pub use crate::stats::SystemStats;
