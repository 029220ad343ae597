//! Global System Constants.
//!
//! This module defines the geometry and capacity constants used across the simulator:
//! 1. **Block Geometry:** Cache block size, offset masks, and lane widths.
//! 2. **Buffer Capacities:** Entry counts for the MAF, victim buffer, and IOWB.
//! 3. **System Limits:** Maximum CPU and memory-array counts.
//! 4. **Address Space:** The I/O space selector bit.

/// Size of a cache block in bytes.
pub const BLOCK_SIZE: usize = 64;

/// Mask selecting the byte offset within a cache block.
pub const BLOCK_OFFSET_MASK: u64 = (BLOCK_SIZE as u64) - 1;

/// Number of bits to shift to convert between bytes and blocks.
pub const BLOCK_SHIFT: u64 = 6;

/// Width of one IOWB lane in bytes; a block holds eight lanes.
pub const LANE_BYTES: usize = 8;

/// Number of entries in each Cbox buffer (MAF, victim buffer, IOWB) and the
/// maximum number of load/store-queue references a single entry can carry.
pub const MBOX_MAX: usize = 8;

/// Number of entries in the Miss Address File.
pub const MAF_ENTRIES: usize = MBOX_MAX;

/// Number of entries in the victim buffer.
pub const VICTIM_ENTRIES: usize = MBOX_MAX;

/// Number of entries in the I/O write buffer.
pub const IOWB_ENTRIES: usize = MBOX_MAX;

/// Maximum number of CPUs a system record can hold.
pub const MAX_CPUS: usize = 4;

/// Maximum number of memory arrays a system record can hold.
pub const MAX_ARRAYS: usize = 4;

/// Physical address bit selecting I/O space.
pub const IO_SPACE_BIT: u64 = 1 << 43;

/// Size of one megabyte, used by the backup-cache size table.
pub const ONE_MB: usize = 1024 * 1024;
