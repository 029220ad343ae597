//! Cbox Control and Status Registers.
//!
//! The Cbox CSRs are loaded through a serial shift chain at reset. This module provides:
//! 1. **Field Table:** Every field with its bit width, in shift-chain order.
//! 2. **Layout:** Contiguous bit offsets computed from the widths at compile time.
//! 3. **Register Storage:** The `CboxCsrs` image with checked get/set.
//! 4. **Pack/Unpack:** Conversion between the image and four 64-bit words.
//!
//! Offsets never depend on how the compiler lays out a struct; fields may span
//! word boundaries.

use std::fmt;

use crate::common::{InvalidRequest, Result};

/// Number of 64-bit words holding the packed image.
pub const CSR_WORDS: usize = 4;

macro_rules! cbox_csrs {
    ($($name:ident : $width:literal),* $(,)?) => {
        /// Names of the Cbox CSR fields, in shift-chain order.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum CboxCsr {
            $(
                #[doc = concat!("`", stringify!($name), "` (", stringify!($width), " bits).")]
                $name,
            )*
        }

        impl CboxCsr {
            /// Every field, in shift-chain order.
            pub const ALL: &'static [Self] = &[$(Self::$name),*];

            /// Field width in bits.
            pub const fn width(self) -> u32 {
                match self {
                    $(Self::$name => $width,)*
                }
            }

            /// Field name as printed in reset-chain dumps.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)*
                }
            }
        }
    };
}

cbox_csrs! {
    BcBankEnable: 1,
    BcBurstModeEnable: 1,
    BcCleanVictim: 1,
    BcClkfwdEnable: 1,
    BcClockOut: 1,
    BcDdmFallEn: 1,
    BcDdmfEnable: 1,
    BcDdmrEnable: 1,
    BcDdmRiseEn: 1,
    BcEnable: 1,
    BcFrmClk: 1,
    BcLateWriteUpper: 1,
    BcPentiumMode: 1,
    BcRdRdBubble: 1,
    BcRdvictim: 1,
    BcSjBankEnable: 1,
    BcTagDdmFallEn: 1,
    BcTagDdmRiseEn: 1,
    BcWrWrBubble: 1,
    ThirtyTwoByteIo: 1,
    DupTagEnable: 1,
    EnableEvict: 1,
    EnableProbeCheck: 1,
    EnableStcCommand: 1,
    FastModeDisable: 1,
    InitMode: 1,
    JitterCmd: 1,
    MboxBcPrbStall: 1,
    PrbTagOnly: 1,
    RdvicAckInhibit: 1,
    SkewedFillMode: 1,
    SpecReadEnable: 1,
    StcEnable: 1,
    SysbusFormat: 1,
    SysbusMbEnable: 1,
    SysClkfwdEnable: 1,
    SysDdmFallEn: 1,
    SysDdmfEnable: 1,
    SysDdmrEnable: 1,
    SysDdmRdFallEn: 1,
    SysDdmRdRiseEn: 1,
    SysDdmRiseEn: 1,
    BcClkDelay: 2,
    BcCpuClkDelay: 2,
    BcCpuLateWriteNum: 2,
    BcRcvMuxCntPreset: 2,
    CfrFrmclkDelay: 2,
    DataValidDly: 2,
    InvalToDirty: 2,
    InvalToDirtyEnable: 2,
    SysBusSize: 2,
    SysClkDelay: 2,
    SysCpuClkDelay: 2,
    SysRcvMuxCntPreset: 2,
    SysRcvMuxPreset: 2,
    BcLateWriteNum: 3,
    CfrEv6clkDelay: 3,
    SetDirtyEnable: 3,
    SysbusVicLimit: 3,
    BcBphaseLdVector: 4,
    BcSize: 4,
    BcWrRdBubbles: 4,
    BcWrtSts: 4,
    CfrGclkDelay: 4,
    MbCnt: 4,
    SysBphaseLdVector: 4,
    SysdcDelay: 4,
    SysbusAckLimit: 5,
    SysClkRatio: 5,
    SysFrameLdVector: 5,
    BcRdWrBubbles: 6,
    BcLatTagPattern: 24,
    BcFdbkEn: 8,
    DcvicThreshold: 8,
    SysFdbkEn: 8,
    BcClkLdVector: 16,
    SysClkLdVector: 16,
    BcLatDataPattern: 32,
}

/// Number of fields in the image.
pub const CSR_COUNT: usize = CboxCsr::ALL.len();

const fn compute_offsets() -> [u32; CSR_COUNT] {
    let mut offsets = [0u32; CSR_COUNT];
    let mut i = 1;
    while i < CSR_COUNT {
        offsets[i] = offsets[i - 1] + CboxCsr::ALL[i - 1].width();
        i += 1;
    }
    offsets
}

const OFFSETS: [u32; CSR_COUNT] = compute_offsets();

/// Total bits across every field.
pub const CSR_TOTAL_BITS: u32 =
    OFFSETS[CSR_COUNT - 1] + CboxCsr::ALL[CSR_COUNT - 1].width();

const _: () = assert!(CSR_TOTAL_BITS as usize <= CSR_WORDS * 64);

impl CboxCsr {
    /// Bit offset of the field's least significant bit within the packed image.
    pub const fn offset(self) -> u32 {
        OFFSETS[self as usize]
    }

    /// Largest value the field can hold.
    pub const fn max_value(self) -> u64 {
        if self.width() >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width()) - 1
        }
    }
}

impl fmt::Display for CboxCsr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cbox CSR image, one value per field.
#[derive(Clone, PartialEq, Eq)]
pub struct CboxCsrs {
    values: [u64; CSR_COUNT],
}

impl Default for CboxCsrs {
    fn default() -> Self {
        Self {
            values: [0; CSR_COUNT],
        }
    }
}

impl fmt::Debug for CboxCsrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for &field in CboxCsr::ALL {
            let value = self.get(field);
            if value != 0 {
                let _ = map.entry(&field.name(), &value);
            }
        }
        map.finish()
    }
}

impl CboxCsrs {
    /// Creates an all-zero image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads one field.
    #[inline]
    pub const fn get(&self, field: CboxCsr) -> u64 {
        self.values[field as usize]
    }

    /// Writes one field.
    ///
    /// # Errors
    ///
    /// `InvalidRequest::CsrValue` if `value` does not fit in the field; the
    /// image is left unchanged.
    pub fn set(&mut self, field: CboxCsr, value: u64) -> Result<()> {
        if value > field.max_value() {
            return Err(InvalidRequest::CsrValue {
                field: field.name(),
                width: field.width(),
                value,
            }
            .into());
        }
        self.values[field as usize] = value;
        Ok(())
    }

    /// Packs every field into four words, field 0 at bit 0 of word 0.
    pub fn pack(&self) -> [u64; CSR_WORDS] {
        let mut words = [0u64; CSR_WORDS];
        for &field in CboxCsr::ALL {
            let value = self.get(field);
            let offset = field.offset() as usize;
            let (word, bit) = (offset / 64, offset % 64);
            words[word] |= value << bit;
            let spill = bit + field.width() as usize;
            if spill > 64 {
                words[word + 1] |= value >> (64 - bit);
            }
        }
        words
    }

    /// Rebuilds an image from packed words. Bits past the last field are ignored.
    pub fn unpack(words: &[u64; CSR_WORDS]) -> Self {
        let mut image = Self::default();
        for &field in CboxCsr::ALL {
            let offset = field.offset() as usize;
            let (word, bit) = (offset / 64, offset % 64);
            let mut value = words[word] >> bit;
            if bit + field.width() as usize > 64 {
                value |= words[word + 1] << (64 - bit);
            }
            image.values[field as usize] = value & field.max_value();
        }
        image
    }
}
