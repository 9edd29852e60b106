//! Per-mode metadata and the handshake completeness bitset
//!
//! During the handshake the sensor describes each of its modes with a burst
//! of INFO records (name, scaling limits, units, data format). The records
//! for the highest-numbered mode arrive first and the engine walks down to
//! mode 0. [`InfoFlags`] tracks which records have been seen so the session
//! can tell a complete catalog from a truncated one.

use super::codec::{ftoi, DataFormat};
use super::SENSOR_DATA_SIZE;

/// Handshake record-receipt bitset.
///
/// One bit per record kind. The required set must be complete before the
/// sensor's ACK is honored; the per-mode optional bits are cleared every
/// time a new INFO_NAME opens the next mode's record burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InfoFlags(u16);

impl InfoFlags {
    pub const CMD_TYPE: u16 = 1 << 0;
    pub const CMD_MODES: u16 = 1 << 1;
    pub const CMD_SPEED: u16 = 1 << 2;
    pub const INFO_NAME: u16 = 1 << 3;
    pub const INFO_RAW: u16 = 1 << 4;
    pub const INFO_PCT: u16 = 1 << 5;
    pub const INFO_SI: u16 = 1 << 6;
    pub const INFO_UNITS: u16 = 1 << 7;
    pub const INFO_FORMAT: u16 = 1 << 8;

    /// Records that describe a single mode and reset when the next
    /// mode's INFO_NAME arrives.
    pub const ALL_INFO: u16 = Self::INFO_NAME
        | Self::INFO_RAW
        | Self::INFO_PCT
        | Self::INFO_SI
        | Self::INFO_UNITS
        | Self::INFO_FORMAT;

    /// Records that must be present before the handshake can complete.
    pub const REQUIRED: u16 =
        Self::CMD_TYPE | Self::CMD_MODES | Self::INFO_NAME | Self::INFO_FORMAT;

    pub fn new(bits: u16) -> Self {
        InfoFlags(bits)
    }

    #[inline]
    pub fn contains(&self, bits: u16) -> bool {
        self.0 & bits == bits
    }

    #[inline]
    pub fn insert(&mut self, bits: u16) {
        self.0 |= bits;
    }

    #[inline]
    pub fn remove(&mut self, bits: u16) {
        self.0 &= !bits;
    }

    /// Set `bit` and report whether it was already set (duplicate record).
    #[inline]
    pub fn test_and_set(&mut self, bit: u16) -> bool {
        let was_set = self.0 & bit != 0;
        self.0 |= bit;
        was_set
    }

    /// True once every required record has been observed.
    #[inline]
    pub fn has_required(&self) -> bool {
        self.contains(Self::REQUIRED)
    }
}

/// Metadata and latest sample for one sensor mode.
///
/// Scaling limits are kept as raw little-endian IEEE-754 bit patterns, the
/// way they arrive on the wire; they are converted to display integers on
/// read via [`ftoi`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModeInfo {
    /// Mode name from INFO_NAME (at most 11 bytes)
    pub name: String,
    /// Raw value range, IEEE-754 bits
    pub raw_min: u32,
    pub raw_max: u32,
    /// Percent range, IEEE-754 bits
    pub pct_min: u32,
    pub pct_max: u32,
    /// SI-unit range, IEEE-754 bits
    pub si_min: u32,
    pub si_max: u32,
    /// SI unit label from INFO_UNITS (at most 4 bytes)
    pub units: String,
    /// Scalar values per DATA frame (1-32)
    pub data_sets: u8,
    /// Scalar encoding of DATA payloads
    pub format: DataFormat,
    /// Display width hint
    pub figures: u8,
    /// Fractional digits hint; also the ftoi scale
    pub decimals: u8,
    /// Latest sample bytes, overwritten in place by each DATA frame
    pub raw_data: [u8; SENSOR_DATA_SIZE],
}

impl Default for ModeInfo {
    fn default() -> Self {
        ModeInfo {
            name: String::new(),
            raw_min: 0,
            raw_max: 0x447F_C000, // 1023.0
            pct_min: 0,
            pct_max: 0x42C8_0000, // 100.0
            si_min: 0,
            si_max: 0x3F80_0000, // 1.0
            units: String::new(),
            data_sets: 0,
            format: DataFormat::S8,
            figures: 4,
            decimals: 0,
            raw_data: [0; SENSOR_DATA_SIZE],
        }
    }
}

impl ModeInfo {
    /// Decode the scalar at `index` from the latest sample.
    ///
    /// Returns `None` when `index` is beyond the mode's data sets or the
    /// scalar would fall outside the sample buffer.
    pub fn value(&self, index: usize) -> Option<i32> {
        if index >= self.data_sets as usize {
            return None;
        }
        let width = self.format.size();
        let offset = index * width;
        if offset + width > SENSOR_DATA_SIZE {
            return None;
        }
        let bytes = &self.raw_data[offset..offset + width];
        let value = match self.format {
            DataFormat::S8 => bytes[0] as i8 as i32,
            DataFormat::S16 => i16::from_le_bytes([bytes[0], bytes[1]]) as i32,
            DataFormat::S32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            DataFormat::Float => ftoi(
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                self.decimals,
            ),
        };
        Some(value)
    }

    /// Display integers for the scaling limits of this mode.
    pub fn raw_min_display(&self) -> i32 {
        ftoi(self.raw_min, self.decimals)
    }

    pub fn raw_max_display(&self) -> i32 {
        ftoi(self.raw_max, self.decimals)
    }

    pub fn pct_min_display(&self) -> i32 {
        ftoi(self.pct_min, self.decimals)
    }

    pub fn pct_max_display(&self) -> i32 {
        ftoi(self.pct_max, self.decimals)
    }

    pub fn si_min_display(&self) -> i32 {
        ftoi(self.si_min, self.decimals)
    }

    pub fn si_max_display(&self) -> i32 {
        ftoi(self.si_max, self.decimals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scaling_bits() {
        let info = ModeInfo::default();
        assert_eq!(f32::from_bits(info.raw_max), 1023.0);
        assert_eq!(f32::from_bits(info.pct_max), 100.0);
        assert_eq!(f32::from_bits(info.si_max), 1.0);
        assert_eq!(info.figures, 4);
        assert_eq!(info.raw_min, 0);
    }

    #[test]
    fn test_default_display_values() {
        let info = ModeInfo::default();
        assert_eq!(info.raw_max_display(), 1023);
        assert_eq!(info.pct_max_display(), 100);
        assert_eq!(info.si_max_display(), 1);
        assert_eq!(info.si_min_display(), 0);
    }

    #[test]
    fn test_value_s8() {
        let mut info = ModeInfo {
            data_sets: 2,
            ..ModeInfo::default()
        };
        info.raw_data[0] = 0x2A;
        info.raw_data[1] = 0xFF;
        assert_eq!(info.value(0), Some(42));
        assert_eq!(info.value(1), Some(-1));
        assert_eq!(info.value(2), None);
    }

    #[test]
    fn test_value_s16_and_s32() {
        let mut info = ModeInfo {
            data_sets: 2,
            format: DataFormat::S16,
            ..ModeInfo::default()
        };
        info.raw_data[..4].copy_from_slice(&[0x34, 0x12, 0xFE, 0xFF]);
        assert_eq!(info.value(0), Some(0x1234));
        assert_eq!(info.value(1), Some(-2));

        info.format = DataFormat::S32;
        info.data_sets = 1;
        info.raw_data[..4].copy_from_slice(&(-70_000i32).to_le_bytes());
        assert_eq!(info.value(0), Some(-70_000));
    }

    #[test]
    fn test_value_float_uses_decimals() {
        let mut info = ModeInfo {
            data_sets: 1,
            format: DataFormat::Float,
            decimals: 1,
            ..ModeInfo::default()
        };
        info.raw_data[..4].copy_from_slice(&2.5f32.to_bits().to_le_bytes());
        assert_eq!(info.value(0), Some(25));
    }

    #[test]
    fn test_value_bounded_by_sample_buffer() {
        let info = ModeInfo {
            data_sets: 32,
            format: DataFormat::S32,
            ..ModeInfo::default()
        };
        // 32 x 4 bytes would overrun the 32-byte sample buffer
        assert_eq!(info.value(8), None);
        assert!(info.value(7).is_some());
    }

    #[test]
    fn test_info_flags_required() {
        let mut flags = InfoFlags::new(InfoFlags::CMD_TYPE);
        assert!(!flags.has_required());
        flags.insert(InfoFlags::CMD_MODES | InfoFlags::INFO_NAME);
        assert!(!flags.has_required());
        flags.insert(InfoFlags::INFO_FORMAT);
        assert!(flags.has_required());
    }

    #[test]
    fn test_info_flags_test_and_set() {
        let mut flags = InfoFlags::default();
        assert!(!flags.test_and_set(InfoFlags::CMD_MODES));
        assert!(flags.test_and_set(InfoFlags::CMD_MODES));
    }

    #[test]
    fn test_info_flags_name_resets_optionals() {
        let mut flags = InfoFlags::new(InfoFlags::CMD_TYPE | InfoFlags::CMD_MODES);
        flags.insert(InfoFlags::ALL_INFO);
        flags.remove(InfoFlags::ALL_INFO);
        assert!(flags.contains(InfoFlags::CMD_TYPE | InfoFlags::CMD_MODES));
        assert!(!flags.contains(InfoFlags::INFO_NAME));
    }
}
