//! Common types shared by the coherence controller, the CPU port, and the chipset.
//!
//! This module provides the building blocks every other module leans on:
//! 1. **Addresses:** A strong physical address type with block/offset helpers.
//! 2. **Constants:** Block geometry, buffer capacities, and address-space bits.
//! 3. **Blocks:** The 64-byte cache block payload and lane-mask helpers.
//! 4. **Errors:** The crate-wide `CoherenceError` and its reason enums.
//! 5. **Identifiers:** CPU ids and the one-byte request id used in completions.

/// Physical address type.
pub mod addr;

/// System-wide constants.
pub mod constants;

/// Cache block payload and lane masks.
pub mod data;

/// Error types.
pub mod error;

/// CPU and request identifiers.
pub mod id;

pub use addr::PhysAddr;
pub use constants::{BLOCK_SIZE, MAX_CPUS, MBOX_MAX};
pub use data::{BlockData, LsqRef, LsqRefs};
pub use error::{CoherenceError, InvalidRequest, ProtocolAnomaly, Resource, Result};
pub use id::{CpuId, RequestId};
