//! Configuration system for the multiprocessor coherence simulator.
//!
//! This module defines the configuration structures consumed at startup. It provides:
//! 1. **Defaults:** Baseline CPU count, memory-array geometry, and Cbox parameters.
//! 2. **Structures:** Hierarchical config for general, system, Cbox, and hub settings.
//! 3. **Validation:** Range checks run before any allocation takes place.
//!
//! Configuration is supplied as JSON (see the CLI) or built with `Config::default()`.

use serde::Deserialize;

use crate::cbox::bcache::BcacheSize;
use crate::cbox::probe::NextState;
use crate::common::constants::{BLOCK_SIZE, MAX_ARRAYS, MAX_CPUS};
use crate::common::{CoherenceError, Result};

/// Default configuration constants.
mod defaults {
    /// One CPU.
    pub const CPU_COUNT: usize = 1;

    /// One memory array.
    pub const ARRAY_COUNT: usize = 1;

    /// Each memory array holds 1 MiB.
    pub const ARRAY_SIZE: usize = 1024 * 1024;

    /// Smallest supported backup cache (1 MB).
    pub const BCACHE_SIZE_MB: u32 = 1;

    /// Probe ring depth per CPU; matches the 8-entry Cbox buffers.
    pub const PROBE_QUEUE_DEPTH: usize = 8;
}

/// Root configuration structure.
///
/// # Examples
///
/// ```
/// use smpsim_core::config::Config;
///
/// let json = r#"{
///     "system": { "cpu_count": 2, "array_count": 2, "array_size_bytes": 65536 },
///     "cbox": { "bcache_size_mb": 4 },
///     "hub": { "read_probe_next_state": "CleanShared" }
/// }"#;
///
/// let config: Config = serde_json::from_str(json).unwrap();
/// assert_eq!(config.system.cpu_count, 2);
/// assert_eq!(config.cbox.bcache_size_mb, 4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// General simulation settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// CPU count and memory-array geometry.
    #[serde(default)]
    pub system: SystemConfig,
    /// Per-CPU coherence controller settings.
    #[serde(default)]
    pub cbox: CboxConfig,
    /// Chipset hub settings.
    #[serde(default)]
    pub hub: HubConfig,
}

impl Config {
    /// Checks every field against its supported range.
    ///
    /// # Errors
    ///
    /// `InitializationFailure` for CPU/array counts or sizes out of range, or a
    /// read-probe next state that is reserved or `Nop`; `InvalidRequest` for a
    /// backup-cache size outside the encoded table.
    pub fn validate(&self) -> Result<()> {
        let sys = &self.system;
        if sys.cpu_count == 0 || sys.cpu_count > MAX_CPUS {
            return Err(CoherenceError::InitializationFailure(format!(
                "cpu_count {} outside 1..={MAX_CPUS}",
                sys.cpu_count
            )));
        }
        if sys.array_count == 0 || sys.array_count > MAX_ARRAYS {
            return Err(CoherenceError::InitializationFailure(format!(
                "array_count {} outside 1..={MAX_ARRAYS}",
                sys.array_count
            )));
        }
        if sys.array_size_bytes == 0 || sys.array_size_bytes % BLOCK_SIZE != 0 {
            return Err(CoherenceError::InitializationFailure(format!(
                "array_size_bytes {} is not a non-zero multiple of {BLOCK_SIZE}",
                sys.array_size_bytes
            )));
        }
        if self.cbox.probe_queue_depth == 0 {
            return Err(CoherenceError::InitializationFailure(
                "probe_queue_depth must be non-zero".to_string(),
            ));
        }
        let ns = self.hub.read_probe_next_state;
        if ns.is_reserved() {
            return Err(CoherenceError::InitializationFailure(format!(
                "read_probe_next_state {ns:?} is a reserved code"
            )));
        }
        // A read that leaves the owner's state untouched would let it keep
        // writing an exclusive line the reader now caches.
        if ns == NextState::Nop {
            return Err(CoherenceError::InitializationFailure(
                "read_probe_next_state Nop leaves the owner exclusive".to_string(),
            ));
        }
        let _ = self.cbox.bcache_size()?;
        Ok(())
    }
}

/// General simulation settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneralConfig {
    /// Emit per-transaction trace events.
    #[serde(default)]
    pub trace: bool,
}

/// CPU count and memory-array geometry.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    /// Number of CPUs to allocate (bounded by `MAX_CPUS`).
    #[serde(default = "SystemConfig::default_cpu_count")]
    pub cpu_count: usize,
    /// Number of memory arrays (bounded by `MAX_ARRAYS`).
    #[serde(default = "SystemConfig::default_array_count")]
    pub array_count: usize,
    /// Size of each memory array in bytes; arrays are contiguous from address 0.
    #[serde(default = "SystemConfig::default_array_size")]
    pub array_size_bytes: usize,
}

impl SystemConfig {
    fn default_cpu_count() -> usize {
        defaults::CPU_COUNT
    }

    fn default_array_count() -> usize {
        defaults::ARRAY_COUNT
    }

    fn default_array_size() -> usize {
        defaults::ARRAY_SIZE
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            cpu_count: defaults::CPU_COUNT,
            array_count: defaults::ARRAY_COUNT,
            array_size_bytes: defaults::ARRAY_SIZE,
        }
    }
}

/// Per-CPU coherence controller settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CboxConfig {
    /// Backup-cache capacity in MB: one of 1, 2, 4, 8, 16.
    #[serde(default = "CboxConfig::default_bcache_size_mb")]
    pub bcache_size_mb: u32,
    /// Capacity of each CPU's probe ring.
    #[serde(default = "CboxConfig::default_probe_queue_depth")]
    pub probe_queue_depth: usize,
}

impl CboxConfig {
    fn default_bcache_size_mb() -> u32 {
        defaults::BCACHE_SIZE_MB
    }

    fn default_probe_queue_depth() -> usize {
        defaults::PROBE_QUEUE_DEPTH
    }

    /// Resolves `bcache_size_mb` against the encoded size table.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if the size is not one of the five supported capacities.
    pub fn bcache_size(&self) -> Result<BcacheSize> {
        BcacheSize::from_megabytes(self.bcache_size_mb)
    }
}

impl Default for CboxConfig {
    fn default() -> Self {
        Self {
            bcache_size_mb: defaults::BCACHE_SIZE_MB,
            probe_queue_depth: defaults::PROBE_QUEUE_DEPTH,
        }
    }
}

/// Chipset hub settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Next state applied to other CPUs' copies when a CPU takes a read miss.
    #[serde(default = "HubConfig::default_read_probe_next_state")]
    pub read_probe_next_state: NextState,
}

impl HubConfig {
    fn default_read_probe_next_state() -> NextState {
        NextState::Invalid
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            read_probe_next_state: NextState::Invalid,
        }
    }
}
