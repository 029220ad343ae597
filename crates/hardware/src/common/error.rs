//! Coherence error definitions.
//!
//! This module defines the error handling for the coherence subsystem. It provides:
//! 1. **Backpressure:** `ResourceExhausted` when a fixed-capacity Cbox buffer has no usable slot.
//! 2. **Rejection:** `InvalidRequest` for malformed requests, detected before any state changes.
//! 3. **Protocol Anomalies:** Probe encodings outside the defined matrix; recorded, never fatal.
//! 4. **Startup Failure:** `InitializationFailure`, the only fatal class, raised before the system is live.

use thiserror::Error;

use super::addr::PhysAddr;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoherenceError>;

/// Fixed-capacity structures that can run out of slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    /// Miss Address File.
    MissAddressFile,
    /// Victim address/data buffer.
    VictimBuffer,
    /// I/O write buffer.
    IoWriteBuffer,
    /// Per-CPU probe ring.
    ProbeQueue,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MissAddressFile => "miss address file",
            Self::VictimBuffer => "victim buffer",
            Self::IoWriteBuffer => "I/O write buffer",
            Self::ProbeQueue => "probe queue",
        };
        f.write_str(name)
    }
}

/// Reasons a request is rejected before any state mutation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum InvalidRequest {
    /// Address is not aligned to the access width.
    #[error("address {addr} is not aligned to {align} bytes")]
    Misaligned {
        /// Offending address.
        addr: PhysAddr,
        /// Required alignment in bytes.
        align: u64,
    },
    /// A write or merge would span a cache block boundary.
    #[error("{len}-byte access at {addr} spans a block boundary")]
    SpansBlock {
        /// Start address.
        addr: PhysAddr,
        /// Length in bytes.
        len: usize,
    },
    /// Store length is not 1, 2, 4, or 8 bytes, or the data does not match it.
    #[error("unsupported store length {0}")]
    StoreLength(usize),
    /// More load/store-queue references than an entry can carry.
    #[error("{0} load/store-queue references exceed the per-entry limit")]
    TooManyRefs(usize),
    /// Backup-cache capacity outside the supported table.
    #[error("unsupported backup-cache size {0} MB")]
    BcacheSize(u32),
    /// Backup-cache size field encoding outside the supported table.
    #[error("unsupported backup-cache size encoding {0:#x}")]
    BcacheEncoding(u64),
    /// A handle that does not name a live entry.
    #[error("handle {0} does not name a live entry")]
    StaleHandle(u8),
    /// The pipeline tried to consume an entry that has not completed.
    #[error("entry {0} has not completed")]
    NotComplete(u8),
    /// A completion arrived for an entry that was already complete.
    #[error("entry {0} was already completed")]
    AlreadyComplete(u8),
    /// An ownership request or local eviction aimed at uncached I/O space.
    #[error("{0} is in I/O space and cannot be cached")]
    IoSpace(PhysAddr),
    /// A store to a line the CPU does not hold dirty.
    #[error("line {0} is not owned dirty by this CPU")]
    NotOwned(PhysAddr),
    /// Value does not fit in a CSR field.
    #[error("value {value:#x} does not fit the {width}-bit CSR field {field}")]
    CsrValue {
        /// Field name.
        field: &'static str,
        /// Field width in bits.
        width: u32,
        /// Rejected value.
        value: u64,
    },
}

/// A probe whose `ns` field is one of the reserved/transitional codes.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("probe {raw:#04x} at {addr} carries reserved next-state code {ns:#03b}")]
pub struct ProtocolAnomaly {
    /// Probed address.
    pub addr: PhysAddr,
    /// Raw packed dm/ns byte.
    pub raw: u8,
    /// Raw 2-bit data-movement field.
    pub dm: u8,
    /// Raw 3-bit next-state field.
    pub ns: u8,
}

/// Errors produced by the coherence subsystem.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CoherenceError {
    /// No free slot and no eligible merge or eviction target; retry later.
    #[error("{resource} exhausted")]
    ResourceExhausted {
        /// The saturated structure.
        resource: Resource,
    },
    /// Request rejected before any state mutation.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] InvalidRequest),
    /// Probe outside the defined dm x ns matrix.
    #[error("protocol anomaly: {0}")]
    ProtocolAnomaly(#[from] ProtocolAnomaly),
    /// A startup allocation or registration failed; everything was rolled back.
    #[error("system initialization failed: {0}")]
    InitializationFailure(String),
    /// The hub found no memory array backing the address.
    #[error("no memory array backs address {0:#x}")]
    NonExistentMemory(u64),
}

impl CoherenceError {
    /// Shorthand for a `ResourceExhausted` error.
    #[inline]
    pub const fn exhausted(resource: Resource) -> Self {
        Self::ResourceExhausted { resource }
    }

    /// `true` if the caller should back off and retry.
    #[inline]
    pub const fn is_backpressure(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}
