//! Special sections: fixed size blobs at fixed offsets, outside of the rotating state area.
//!
//! With a CRC the section occupies `data | crc`, with a backup copy
//! `data | crc | backup data | backup crc`.

use crate::error::Error;
use crate::platform::Medium;
use crate::raw::{CRC_SIZE, crc16};
use crate::state::update_storage;
use alloc::vec;
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpecialSection {
    pub id: u16,
    pub offset: u32,
    pub size: u16,
    pub add_crc: bool,
    pub add_backup_copy: bool,
}

impl SpecialSection {
    fn crc_offset(&self) -> u32 {
        self.offset + self.size as u32
    }

    fn backup_offset(&self) -> u32 {
        self.crc_offset() + CRC_SIZE as u32
    }

    fn backup_crc_offset(&self) -> u32 {
        self.backup_offset() + self.size as u32
    }

    /// Bytes occupied on the medium.
    pub fn total_size(&self) -> u32 {
        let mut size = self.size as u32;
        if self.add_crc {
            size += CRC_SIZE as u32;
        }
        if self.add_backup_copy {
            size += self.size as u32 + CRC_SIZE as u32;
        }
        size
    }

    fn read_copy<M: Medium>(
        &self,
        hal: &mut M,
        offset: u32,
        crc_offset: u32,
        data: &mut [u8],
    ) -> Result<bool, Error> {
        hal.read(offset, data)?;
        let mut crc = [0u8; CRC_SIZE];
        hal.read(crc_offset, &mut crc)?;
        Ok(crc16(data) == u16::from_le_bytes(crc))
    }

    pub(crate) fn read<M: Medium>(&self, hal: &mut M, data: &mut [u8]) -> Result<(), Error> {
        if data.len() != self.size as usize {
            return Err(Error::SectionSizeMismatch);
        }

        if !self.add_crc {
            return hal.read(self.offset, data);
        }
        if self.read_copy(hal, self.offset, self.crc_offset(), data)? {
            return Ok(());
        }

        warn!("section {}: invalid crc", self.id);
        if self.add_backup_copy
            && self.read_copy(hal, self.backup_offset(), self.backup_crc_offset(), data)?
        {
            info!("section {}: using backup copy", self.id);
            return Ok(());
        }
        Err(Error::InvalidCrc)
    }

    pub(crate) fn write<M: Medium>(&self, hal: &mut M, data: &[u8]) -> Result<(), Error> {
        if data.len() != self.size as usize {
            return Err(Error::SectionSizeMismatch);
        }

        update_storage(hal, self.offset, data)?;
        if self.add_crc {
            let crc = crc16(data).to_le_bytes();
            update_storage(hal, self.crc_offset(), &crc)?;
            if self.add_backup_copy {
                update_storage(hal, self.backup_offset(), data)?;
                update_storage(hal, self.backup_crc_offset(), &crc)?;
            }
        }
        hal.commit()
    }

    /// Zeroes data, CRC and backup copy.
    pub(crate) fn delete<M: Medium>(&self, hal: &mut M) -> Result<(), Error> {
        let zeros = vec![0u8; self.total_size() as usize];
        update_storage(hal, self.offset, &zeros)?;
        hal.commit()
    }
}

/// Registry of the special sections. Registration is not persisted, the firmware registers the
/// same sections on every boot.
#[derive(Debug, Default)]
pub(crate) struct SpecialSections {
    sections: Vec<SpecialSection>,
}

impl SpecialSections {
    pub(crate) fn register(&mut self, section: SpecialSection) -> Result<(), Error> {
        if self.get(section.id).is_some() {
            warn!("section {}: already registered", section.id);
            return Err(Error::SectionAlreadyRegistered);
        }
        if section.add_backup_copy && !section.add_crc {
            warn!("section {}: backup copy requires crc", section.id);
            return Err(Error::BackupRequiresCrc);
        }
        if section.offset.checked_add(section.total_size()).is_none() {
            warn!("section {}: offset {:#x} out of range", section.id, section.offset);
            return Err(Error::OutOfBounds);
        }
        self.sections.push(section);
        Ok(())
    }

    pub(crate) fn get(&self, id: u16) -> Option<&SpecialSection> {
        self.sections.iter().find(|section| section.id == id)
    }
}
