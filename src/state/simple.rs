use super::{Phase, StateStorageInterface, update_storage};
use crate::error::Error;
use crate::platform::Medium;
use crate::raw::{SECTION_PREAMBLE_SIZE, SectionPreamble, SectionType, crc16_digest};
use crc::Digest;

const READ_CHUNK_SIZE: usize = 32;

/// A single slot directly after the section preamble, rewritten in place on every save. The
/// CRC of the payload is kept in the section preamble.
pub(crate) struct SimpleState {
    section_offset: u32,
    element_state_size: u16,
    element_state_crc: u16,
    crc_valid: bool,

    phase: Phase,
    current_offset: u32,
    new_size: u32,
    digest: Option<Digest<'static, u16>>,
}

impl SimpleState {
    pub(crate) fn new(section_offset: u32) -> Self {
        Self {
            section_offset,
            element_state_size: 0,
            element_state_crc: 0,
            crc_valid: false,
            phase: Phase::Idle,
            current_offset: 0,
            new_size: 0,
            digest: None,
        }
    }

    fn element_state_offset(&self) -> u32 {
        self.section_offset + SECTION_PREAMBLE_SIZE as u32
    }

    fn invalidate(&mut self) {
        self.element_state_size = 0;
        self.crc_valid = false;
    }
}

impl StateStorageInterface for SimpleState {
    fn section_type(&self) -> SectionType {
        SectionType::ElementState
    }

    fn size_value(&self) -> u16 {
        0
    }

    fn init_section_preamble(&mut self, offset: u32, section: &SectionPreamble) {
        self.section_offset = offset;
        self.element_state_size = section.size;
        self.element_state_crc = section.crc1;
        self.crc_valid = section.is_consistent();
    }

    fn write_section_preamble<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error> {
        let section = SectionPreamble::new(
            SectionType::ElementState,
            self.element_state_size,
            self.element_state_crc,
        );
        update_storage(hal, self.section_offset, &section.to_bytes())?;
        Ok(())
    }

    fn init_from_storage<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error> {
        if !self.crc_valid {
            warn!("simple state: interrupted section preamble write");
            return Ok(());
        }

        // nothing was ever saved into an empty section, a zero crc is what init wrote
        if self.element_state_size == 0 {
            self.crc_valid = self.element_state_crc == 0;
            return Ok(());
        }

        let mut digest = crc16_digest();
        let mut buf = [0u8; READ_CHUNK_SIZE];
        let mut offset = self.element_state_offset();
        let mut remaining = self.element_state_size as usize;
        while remaining > 0 {
            let n = remaining.min(READ_CHUNK_SIZE);
            hal.read(offset, &mut buf[..n])?;
            digest.update(&buf[..n]);
            offset += n as u32;
            remaining -= n;
        }

        let crc = digest.finalize();
        self.crc_valid = crc == self.element_state_crc;
        if self.crc_valid {
            debug!(
                "simple state: {} bytes, crc {:#x}",
                self.element_state_size, crc
            );
        } else {
            warn!(
                "simple state: invalid crc {:#x}, stored {:#x}",
                crc, self.element_state_crc
            );
        }
        Ok(())
    }

    fn delete_all(&mut self) {
        self.invalidate();
        self.element_state_crc = 0;
        self.phase = Phase::Idle;
    }

    fn prepare_save_state(&mut self) -> Result<(), Error> {
        self.phase = Phase::Save;
        self.new_size = 0;
        self.current_offset = self.element_state_offset();
        self.digest = Some(crc16_digest());
        Ok(())
    }

    fn prepare_size_check(&mut self) -> Result<(), Error> {
        self.phase = Phase::SizeCheck;
        self.new_size = 0;
        Ok(())
    }

    fn prepare_load_state<M: Medium>(&mut self, _hal: &mut M) -> Result<(), Error> {
        if !self.crc_valid || self.element_state_size == 0 {
            return Err(Error::NoValidState);
        }
        self.phase = Phase::Load;
        self.new_size = 0;
        self.current_offset = self.element_state_offset();
        Ok(())
    }

    fn read_state<M: Medium>(&mut self, hal: &mut M, bytes: &mut [u8]) -> Result<(), Error> {
        if self.phase != Phase::Load {
            return Err(Error::InvalidOperation);
        }
        if self.new_size + bytes.len() as u32 > self.element_state_size as u32 {
            warn!("simple state: read beyond stored {} bytes", self.element_state_size);
            return Err(Error::OutOfSection);
        }

        hal.read(self.current_offset, bytes)?;
        self.new_size += bytes.len() as u32;
        self.current_offset += bytes.len() as u32;
        Ok(())
    }

    fn write_state<M: Medium>(&mut self, hal: &mut M, bytes: &[u8]) -> Result<(), Error> {
        match self.phase {
            Phase::SizeCheck => {
                self.new_size += bytes.len() as u32;
                Ok(())
            }
            Phase::Save => {
                let new_size = self.new_size + bytes.len() as u32;
                if new_size > u16::MAX as u32 {
                    return Err(Error::InsufficientSpace);
                }
                if self.element_state_size != 0 && new_size > self.element_state_size as u32 {
                    warn!(
                        "simple state: state grew beyond {} bytes, resetting section",
                        self.element_state_size
                    );
                    self.invalidate();
                    self.phase = Phase::Idle;
                    return Err(Error::SizeMismatch);
                }

                if let Some(digest) = self.digest.as_mut() {
                    digest.update(bytes);
                }
                update_storage(hal, self.current_offset, bytes)?;
                self.new_size = new_size;
                self.current_offset += bytes.len() as u32;
                Ok(())
            }
            _ => Err(Error::InvalidOperation),
        }
    }

    fn finalize_save_state<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error> {
        if self.phase != Phase::Save {
            return Err(Error::InvalidOperation);
        }
        self.phase = Phase::Idle;

        let crc = self
            .digest
            .take()
            .map(|digest| digest.finalize())
            .ok_or(Error::InvalidOperation)?;
        self.element_state_size = self.new_size as u16;
        self.element_state_crc = crc;
        self.write_section_preamble(hal)?;
        hal.commit()?;
        self.crc_valid = true;
        Ok(())
    }

    fn finalize_size_check(&mut self) -> Result<(), Error> {
        if self.phase != Phase::SizeCheck {
            return Err(Error::InvalidOperation);
        }
        self.phase = Phase::Idle;

        if self.new_size != self.element_state_size as u32 {
            info!(
                "simple state: size changed from {} to {}",
                self.element_state_size, self.new_size
            );
            self.invalidate();
            return Err(Error::SizeMismatch);
        }
        Ok(())
    }

    fn finalize_load_state(&mut self) {
        self.phase = Phase::Idle;
    }
}
