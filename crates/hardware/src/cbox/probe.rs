//! Probe command codec.
//!
//! The chipset probes a CPU with a packed byte carrying two fields:
//! 1. **dm (bits 4:3):** What data the CPU must return.
//! 2. **ns (bits 2:0):** The state the CPU's copy moves to after responding.
//!
//! Fields are composed with bitwise OR; decoding never fails, but three `ns`
//! codes are reserved and are reported by the controller as protocol anomalies.

use serde::Deserialize;

use super::state::LineState;
use crate::common::{BlockData, PhysAddr};
use crate::cbox::victim::VictimHandle;

/// Mask of the dm field within a packed probe byte.
pub const PROBE_DM_MASK: u8 = 0x18;

/// Shift of the dm field within a packed probe byte.
pub const PROBE_DM_SHIFT: u8 = 3;

/// Mask of the ns field within a packed probe byte.
pub const PROBE_NS_MASK: u8 = 0x07;

/// Data-movement request carried by a probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataMovement {
    /// Return nothing.
    Nop = 0,
    /// Return the block if it is valid.
    ReadIfHit = 1,
    /// Return the block only if it is dirty.
    ReadIfDirty = 2,
    /// Always answer; data if valid, "not present" otherwise.
    ReadAny = 3,
}

impl DataMovement {
    /// Decodes the 2-bit field.
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::Nop,
            1 => Self::ReadIfHit,
            2 => Self::ReadIfDirty,
            _ => Self::ReadAny,
        }
    }

    /// Returns `true` if a line in `state` counts as a hit for this request.
    ///
    /// Read-if-dirty only targets owners of dirty data; every other movement
    /// treats any valid copy as a hit.
    pub const fn is_hit(self, state: LineState) -> bool {
        match self {
            Self::ReadIfDirty => state.is_dirty(),
            Self::Nop | Self::ReadIfHit | Self::ReadAny => state.valid,
        }
    }

    /// Returns `true` if a line in `state` must supply its data.
    pub const fn returns_data(self, state: LineState) -> bool {
        match self {
            Self::Nop => false,
            Self::ReadIfHit | Self::ReadAny => state.valid,
            Self::ReadIfDirty => state.is_dirty(),
        }
    }
}

/// Next-state request carried by a probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
pub enum NextState {
    /// Leave the line alone.
    Nop = 0,
    /// Clear dirty and shared.
    Clean = 1,
    /// Set shared, clear dirty.
    CleanShared = 2,
    /// Reserved transition.
    Trans3 = 3,
    /// Set dirty and shared.
    DirtyShared = 4,
    /// Clear valid.
    Invalid = 5,
    /// Reserved transition.
    Trans1 = 6,
    /// Reserved.
    Reserved = 7,
}

impl NextState {
    /// Decodes the 3-bit field.
    pub const fn from_bits(bits: u8) -> Self {
        match bits & PROBE_NS_MASK {
            0 => Self::Nop,
            1 => Self::Clean,
            2 => Self::CleanShared,
            3 => Self::Trans3,
            4 => Self::DirtyShared,
            5 => Self::Invalid,
            6 => Self::Trans1,
            _ => Self::Reserved,
        }
    }

    /// `true` for the codes with no defined transition.
    pub const fn is_reserved(self) -> bool {
        matches!(self, Self::Trans3 | Self::Trans1 | Self::Reserved)
    }

    /// Applies this transition to a valid line. Reserved codes and invalid
    /// lines come back unchanged.
    pub const fn apply(self, state: LineState) -> LineState {
        if !state.valid {
            return state;
        }
        match self {
            Self::Clean => LineState {
                dirty: false,
                shared: false,
                ..state
            },
            Self::CleanShared => LineState {
                dirty: false,
                shared: true,
                ..state
            },
            Self::DirtyShared => LineState {
                dirty: true,
                shared: true,
                ..state
            },
            Self::Invalid => LineState::INVALID,
            Self::Nop | Self::Trans3 | Self::Trans1 | Self::Reserved => state,
        }
    }
}

/// A dm/ns pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProbeCommand {
    /// Data movement.
    pub dm: DataMovement,
    /// Next state.
    pub ns: NextState,
}

impl ProbeCommand {
    /// Builds a command from its two fields.
    pub const fn new(dm: DataMovement, ns: NextState) -> Self {
        Self { dm, ns }
    }

    /// Packs the fields into the probe byte: `dm` in bits 4:3, `ns` in bits 2:0.
    pub const fn encode(self) -> u8 {
        (((self.dm as u8) & 0x03) << PROBE_DM_SHIFT) | ((self.ns as u8) & PROBE_NS_MASK)
    }

    /// Unpacks a probe byte. Bits above 4 are ignored.
    pub const fn decode(raw: u8) -> Self {
        Self {
            dm: DataMovement::from_bits((raw & PROBE_DM_MASK) >> PROBE_DM_SHIFT),
            ns: NextState::from_bits(raw & PROBE_NS_MASK),
        }
    }
}

/// Hub-side transaction number a probe belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

/// A probe delivered to a CPU's probe ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Probe {
    /// Transaction the response must name.
    pub txn: TxnId,
    /// Probed block address.
    pub addr: PhysAddr,
    /// Packed dm/ns byte as it travels on the wire.
    pub raw: u8,
}

impl Probe {
    /// Builds a probe from a decoded command.
    pub const fn new(txn: TxnId, addr: PhysAddr, cmd: ProbeCommand) -> Self {
        Self {
            txn,
            addr,
            raw: cmd.encode(),
        }
    }

    /// Decoded command.
    pub const fn command(&self) -> ProbeCommand {
        ProbeCommand::decode(self.raw)
    }
}

/// What the probed CPU found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Line not present (or not a hit for the requested movement).
    Miss,
    /// Line present and clean.
    HitClean,
    /// Line present and dirty.
    HitDirty,
}

/// A CPU's answer to one probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeResponse {
    /// Transaction being answered.
    pub txn: TxnId,
    /// Probed block address.
    pub addr: PhysAddr,
    /// Lookup result before `ns` was applied.
    pub status: ProbeStatus,
    /// Block contents, when the data movement required them.
    pub data: Option<Box<BlockData>>,
    /// Victim slot holding the probe-response copy of dirty data.
    pub victim: Option<VictimHandle>,
    /// The probe carried a reserved code and was answered as a no-op.
    pub anomaly: bool,
}
