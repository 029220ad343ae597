//! Chipset side of the system.
//!
//! This module holds everything between the CPUs and memory: the coherence hub,
//! the per-CPU interface records it shares with each CPU, the memory arrays, the
//! request/completion messages, and the builder that assembles and tears down
//! the whole system.

/// Block allocation for system, CPU, and memory-array records.
pub mod alloc;

/// System builder, startup rollback, and thread lifecycle.
pub mod builder;

/// Coherence hub: transaction ordering, probes, and the skid buffer.
pub mod hub;

/// Per-CPU interface records and the hub signal.
pub mod interface;

/// Memory-array descriptors and storage.
pub mod memory;

/// Messages exchanged between the Cbox and the hub.
pub mod message;

pub use builder::{RunningSystem, System};
