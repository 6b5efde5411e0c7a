//! On-medium records. All integers are little endian, all records are packed.
//!
//! The layout of a storage region is
//! `Preamble | SectionPreamble | section data [| SectionPreamble | section data ...]`.

use crc::{CRC_16_MODBUS, Crc, Digest};

pub const STORAGE_TAG: [u8; 5] = *b"SUPLA";
pub const STORAGE_VERSION: u16 = 1;

pub const PREAMBLE_SIZE: usize = 8;
pub const SECTION_PREAMBLE_SIZE: usize = 7;
pub const STATE_ENTRY_ADDRESS_SIZE: usize = 8;
pub const WL_BYTE_HEADER_SIZE: usize = 4;
pub const WL_SECTOR_CONFIG_SIZE: usize = 4;
pub const WL_SECTOR_HEADER_SIZE: usize = 2;
pub const CRC_SIZE: usize = 2;

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS, used for every checksum in the storage region.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

pub(crate) fn crc16_digest() -> Digest<'static, u16> {
    CRC16.digest()
}

#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SectionType {
    /// Reserved for the device configuration storage
    DeviceConfig = 1,
    /// Reserved for the element configuration storage
    ElementConfig = 2,
    ElementState = 3,
    ElementStateWearLevelingByte = 4,
    ElementStateWearLevelingSector = 5,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Preamble {
    pub tag: [u8; 5],
    pub version: u16,
    pub sections_count: u8,
}

impl Preamble {
    pub const fn new(sections_count: u8) -> Self {
        Self {
            tag: STORAGE_TAG,
            version: STORAGE_VERSION,
            sections_count,
        }
    }

    pub fn is_tag_valid(&self) -> bool {
        self.tag == STORAGE_TAG
    }

    pub fn to_bytes(&self) -> [u8; PREAMBLE_SIZE] {
        let mut buf = [0u8; PREAMBLE_SIZE];
        buf[..5].copy_from_slice(&self.tag);
        buf[5..7].copy_from_slice(&self.version.to_le_bytes());
        buf[7] = self.sections_count;
        buf
    }

    pub fn from_bytes(buf: &[u8; PREAMBLE_SIZE]) -> Self {
        let mut tag = [0u8; 5];
        tag.copy_from_slice(&buf[..5]);
        Self {
            tag,
            version: u16::from_le_bytes([buf[5], buf[6]]),
            sections_count: buf[7],
        }
    }
}

/// Declares the type and size of one section. `crc1` and `crc2` are written together, a
/// difference between them is left behind by an interrupted write.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
pub struct SectionPreamble {
    pub section_type: u8,
    pub size: u16,
    pub crc1: u16,
    pub crc2: u16,
}

impl SectionPreamble {
    pub fn new(section_type: SectionType, size: u16, crc: u16) -> Self {
        Self {
            section_type: section_type as u8,
            size,
            crc1: crc,
            crc2: crc,
        }
    }

    /// `None` for erased memory or types written by a newer firmware
    pub fn section_type(&self) -> Option<SectionType> {
        SectionType::from_repr(self.section_type)
    }

    pub fn is_consistent(&self) -> bool {
        self.crc1 == self.crc2
    }

    pub fn to_bytes(&self) -> [u8; SECTION_PREAMBLE_SIZE] {
        let mut buf = [0u8; SECTION_PREAMBLE_SIZE];
        buf[0] = self.section_type;
        buf[1..3].copy_from_slice(&self.size.to_le_bytes());
        buf[3..5].copy_from_slice(&self.crc1.to_le_bytes());
        buf[5..7].copy_from_slice(&self.crc2.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; SECTION_PREAMBLE_SIZE]) -> Self {
        Self {
            section_type: buf[0],
            size: u16::from_le_bytes([buf[1], buf[2]]),
            crc1: u16::from_le_bytes([buf[3], buf[4]]),
            crc2: u16::from_le_bytes([buf[5], buf[6]]),
        }
    }
}

/// Points to the current slot pair of the byte wear leveling strategy.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct StateEntryAddress {
    pub address: u32,
    pub element_state_size: u16,
    pub crc: u16,
}

impl StateEntryAddress {
    pub fn new(address: u32, element_state_size: u16) -> Self {
        let mut entry = Self {
            address,
            element_state_size,
            crc: 0,
        };
        entry.crc = crc16(&entry.to_bytes()[..6]);
        entry
    }

    pub fn is_valid(&self) -> bool {
        crc16(&self.to_bytes()[..6]) == self.crc
    }

    pub fn to_bytes(&self) -> [u8; STATE_ENTRY_ADDRESS_SIZE] {
        let mut buf = [0u8; STATE_ENTRY_ADDRESS_SIZE];
        buf[..4].copy_from_slice(&self.address.to_le_bytes());
        buf[4..6].copy_from_slice(&self.element_state_size.to_le_bytes());
        buf[6..8].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; STATE_ENTRY_ADDRESS_SIZE]) -> Self {
        Self {
            address: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            element_state_size: u16::from_le_bytes([buf[4], buf[5]]),
            crc: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }
}

/// Per slot header of the byte wear leveling strategy, `crc` covers the payload.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct StateWlByteHeader {
    pub write_count: u16,
    pub crc: u16,
}

impl StateWlByteHeader {
    pub fn to_bytes(&self) -> [u8; WL_BYTE_HEADER_SIZE] {
        let mut buf = [0u8; WL_BYTE_HEADER_SIZE];
        buf[..2].copy_from_slice(&self.write_count.to_le_bytes());
        buf[2..].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; WL_BYTE_HEADER_SIZE]) -> Self {
        Self {
            write_count: u16::from_le_bytes([buf[0], buf[1]]),
            crc: u16::from_le_bytes([buf[2], buf[3]]),
        }
    }
}

/// Slot size of the sector wear leveling strategy. Erased flash (all ones) never validates.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct StateWlSectorConfig {
    pub state_slot_size: u16,
    pub crc: u16,
}

impl StateWlSectorConfig {
    pub fn new(state_slot_size: u16) -> Self {
        Self {
            state_slot_size,
            crc: crc16(&state_slot_size.to_le_bytes()),
        }
    }

    pub const fn erased() -> Self {
        Self {
            state_slot_size: u16::MAX,
            crc: u16::MAX,
        }
    }

    pub fn is_valid(&self) -> bool {
        crc16(&self.state_slot_size.to_le_bytes()) == self.crc
    }

    pub fn to_bytes(&self) -> [u8; WL_SECTOR_CONFIG_SIZE] {
        let mut buf = [0u8; WL_SECTOR_CONFIG_SIZE];
        buf[..2].copy_from_slice(&self.state_slot_size.to_le_bytes());
        buf[2..].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; WL_SECTOR_CONFIG_SIZE]) -> Self {
        Self {
            state_slot_size: u16::from_le_bytes([buf[0], buf[1]]),
            crc: u16::from_le_bytes([buf[2], buf[3]]),
        }
    }
}

/// Per slot header of the sector wear leveling strategy.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct StateWlSectorHeader {
    pub crc: u16,
}

impl StateWlSectorHeader {
    pub fn to_bytes(&self) -> [u8; WL_SECTOR_HEADER_SIZE] {
        self.crc.to_le_bytes()
    }

    pub fn from_bytes(buf: &[u8; WL_SECTOR_HEADER_SIZE]) -> Self {
        Self {
            crc: u16::from_le_bytes(*buf),
        }
    }
}

/// Number of slots committed according to a slot index bitmap. Bits are cleared LSB first,
/// fully cleared bytes count eight slots each.
pub(crate) fn bitmap_index(bitmap: &[u8]) -> usize {
    let mut index = 0;
    for &byte in bitmap {
        if byte == 0 {
            index += 8;
            continue;
        }
        index += (!byte).trailing_ones() as usize;
        break;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_is_modbus() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
        assert_eq!(crc16(&123456i32.to_le_bytes()), 17076);
    }

    #[test]
    fn erased_config_is_invalid() {
        assert!(!StateWlSectorConfig::erased().is_valid());
        assert!(StateWlSectorConfig::new(10).is_valid());
    }

    #[test]
    fn bitmap_index_counts_cleared_bits() {
        assert_eq!(bitmap_index(&[0xFF, 0xFF]), 0);
        assert_eq!(bitmap_index(&[0b1111_1110, 0xFF]), 1);
        assert_eq!(bitmap_index(&[0b1110_0000, 0xFF]), 5);
        assert_eq!(bitmap_index(&[0x00, 0b1111_1100]), 10);
        assert_eq!(bitmap_index(&[0x00, 0x00]), 16);
    }
}
