//! Persistence of the element state.
//!
//! Every strategy implements [`StateStorageInterface`]. A save is driven as
//! `prepare_save_state` → `write_state`* → `finalize_save_state`, a size check has the same shape
//! but never touches the medium, a load is `prepare_load_state` → `read_state`* →
//! `finalize_load_state`.

mod simple;
mod wl_byte;
mod wl_sector;

pub(crate) use simple::SimpleState;
pub(crate) use wl_byte::StateWearLevelingByte;
pub(crate) use wl_sector::StateWearLevelingSector;

use crate::config::{StorageConfig, WearLevelingMode};
use crate::error::Error;
use crate::platform::Medium;
use crate::raw::{
    PREAMBLE_SIZE, Preamble, SECTION_PREAMBLE_SIZE, STORAGE_VERSION, SectionPreamble, SectionType,
};

const COMPARE_CHUNK_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Save,
    SizeCheck,
    Load,
}

pub(crate) trait StateStorageInterface {
    fn section_type(&self) -> SectionType;

    /// Value of the size field of a freshly created section preamble.
    fn size_value(&self) -> u16;

    /// Takes over the section found at `offset` during the preamble scan.
    fn init_section_preamble(&mut self, offset: u32, section: &SectionPreamble);

    /// Writes the strategy metadata. Unchanged metadata is not written again.
    fn write_section_preamble<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error>;

    /// Locates the current state after the section preamble was found.
    fn init_from_storage<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error>;

    /// Forgets the stored state. The medium is not wiped.
    fn delete_all(&mut self);

    fn prepare_save_state(&mut self) -> Result<(), Error>;

    fn prepare_size_check(&mut self) -> Result<(), Error>;

    fn prepare_load_state<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error>;

    fn read_state<M: Medium>(&mut self, hal: &mut M, bytes: &mut [u8]) -> Result<(), Error>;

    fn write_state<M: Medium>(&mut self, hal: &mut M, bytes: &[u8]) -> Result<(), Error>;

    fn finalize_save_state<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error>;

    /// Reports whether the size of the dry run matches the committed state.
    fn finalize_size_check(&mut self) -> Result<(), Error>;

    fn finalize_load_state(&mut self);

    /// Forces the next save to be written even if the payload did not change.
    fn notify_update(&mut self) {}

    /// Scans the preamble at `storage_offset` and initializes the region if it carries none.
    fn load_preambles<M: Medium>(&mut self, hal: &mut M, storage_offset: u32) -> Result<(), Error>
    where
        Self: Sized,
    {
        let mut buf = [0u8; PREAMBLE_SIZE];
        hal.read(storage_offset, &mut buf)?;
        let preamble = Preamble::from_bytes(&buf);

        if preamble.is_tag_valid() && preamble.sections_count > 0 {
            if preamble.version != STORAGE_VERSION {
                warn!("storage: unsupported version {}", preamble.version);
                return Err(Error::UnsupportedVersion(preamble.version));
            }

            let mut offset = storage_offset + PREAMBLE_SIZE as u32;
            for i in 0..preamble.sections_count {
                let mut buf = [0u8; SECTION_PREAMBLE_SIZE];
                hal.read(offset, &mut buf)?;
                let section = SectionPreamble::from_bytes(&buf);
                if !section.is_consistent() {
                    warn!("storage: section {} has inconsistent crc", i);
                }

                if section.section_type() == Some(self.section_type()) {
                    self.init_section_preamble(offset, &section);
                    return self.init_from_storage(hal);
                }

                debug!("storage: skipping section {} of type {}", i, section.section_type);
                offset += (SECTION_PREAMBLE_SIZE + section.size as usize) as u32;
            }

            warn!("storage: no {} section, reinitializing", self.section_type());
        } else {
            info!("storage: initializing region @{:#x}", storage_offset);
        }

        let section = SectionPreamble::new(self.section_type(), self.size_value(), 0);
        self.init_section_preamble(storage_offset + PREAMBLE_SIZE as u32, &section);
        self.write_section_preamble(hal)?;
        update_storage(hal, storage_offset, &Preamble::new(1).to_bytes())?;
        hal.commit()
    }
}

/// Writes `bytes` only if they differ from the stored content. Returns whether a write
/// happened.
pub(crate) fn update_storage<M: Medium>(
    hal: &mut M,
    offset: u32,
    bytes: &[u8],
) -> Result<bool, Error> {
    let mut buf = [0u8; COMPARE_CHUNK_SIZE];
    let mut chunk_offset = offset;
    let mut changed = false;
    for chunk in bytes.chunks(COMPARE_CHUNK_SIZE) {
        let stored = &mut buf[..chunk.len()];
        hal.read(chunk_offset, stored)?;
        if stored != chunk {
            changed = true;
            break;
        }
        chunk_offset += chunk.len() as u32;
    }

    if changed {
        hal.write(offset, bytes)?;
    }
    Ok(changed)
}

/// Compares two regions of the medium.
pub(crate) fn is_data_different<M: Medium>(
    hal: &mut M,
    first: u32,
    second: u32,
    len: usize,
) -> Result<bool, Error> {
    let mut a = [0u8; COMPARE_CHUNK_SIZE];
    let mut b = [0u8; COMPARE_CHUNK_SIZE];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(COMPARE_CHUNK_SIZE);
        hal.read(first + done as u32, &mut a[..n])?;
        hal.read(second + done as u32, &mut b[..n])?;
        if a[..n] != b[..n] {
            return Ok(true);
        }
        done += n;
    }
    Ok(false)
}

/// The strategy selected by [`WearLevelingMode`].
pub(crate) enum StateStorage {
    Simple(SimpleState),
    WearLevelingByte(StateWearLevelingByte),
    WearLevelingSector(StateWearLevelingSector),
}

impl StateStorage {
    pub(crate) fn new(config: &StorageConfig) -> Self {
        let section_offset = config.starting_offset + PREAMBLE_SIZE as u32;
        match config.wear_leveling {
            WearLevelingMode::Off => Self::Simple(SimpleState::new(section_offset)),
            WearLevelingMode::ByteWriteMode => Self::WearLevelingByte(StateWearLevelingByte::new(
                section_offset,
                config.available_size,
            )),
            WearLevelingMode::SectorWriteMode => {
                Self::WearLevelingSector(StateWearLevelingSector::new(
                    config.starting_offset,
                    config.available_size,
                    config.sector_size,
                ))
            }
        }
    }

    pub(crate) fn load_preambles<M: Medium>(
        &mut self,
        hal: &mut M,
        storage_offset: u32,
    ) -> Result<(), Error> {
        match self {
            Self::Simple(s) => s.load_preambles(hal, storage_offset),
            Self::WearLevelingByte(s) => s.load_preambles(hal, storage_offset),
            Self::WearLevelingSector(s) => s.load_preambles(hal, storage_offset),
        }
    }

    pub(crate) fn delete_all(&mut self) {
        match self {
            Self::Simple(s) => s.delete_all(),
            Self::WearLevelingByte(s) => s.delete_all(),
            Self::WearLevelingSector(s) => s.delete_all(),
        }
    }

    pub(crate) fn prepare_save_state(&mut self) -> Result<(), Error> {
        match self {
            Self::Simple(s) => s.prepare_save_state(),
            Self::WearLevelingByte(s) => s.prepare_save_state(),
            Self::WearLevelingSector(s) => s.prepare_save_state(),
        }
    }

    pub(crate) fn prepare_size_check(&mut self) -> Result<(), Error> {
        match self {
            Self::Simple(s) => s.prepare_size_check(),
            Self::WearLevelingByte(s) => s.prepare_size_check(),
            Self::WearLevelingSector(s) => s.prepare_size_check(),
        }
    }

    pub(crate) fn prepare_load_state<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error> {
        match self {
            Self::Simple(s) => s.prepare_load_state(hal),
            Self::WearLevelingByte(s) => s.prepare_load_state(hal),
            Self::WearLevelingSector(s) => s.prepare_load_state(hal),
        }
    }

    pub(crate) fn read_state<M: Medium>(
        &mut self,
        hal: &mut M,
        bytes: &mut [u8],
    ) -> Result<(), Error> {
        match self {
            Self::Simple(s) => s.read_state(hal, bytes),
            Self::WearLevelingByte(s) => s.read_state(hal, bytes),
            Self::WearLevelingSector(s) => s.read_state(hal, bytes),
        }
    }

    pub(crate) fn write_state<M: Medium>(&mut self, hal: &mut M, bytes: &[u8]) -> Result<(), Error> {
        match self {
            Self::Simple(s) => s.write_state(hal, bytes),
            Self::WearLevelingByte(s) => s.write_state(hal, bytes),
            Self::WearLevelingSector(s) => s.write_state(hal, bytes),
        }
    }

    pub(crate) fn finalize_save_state<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error> {
        match self {
            Self::Simple(s) => s.finalize_save_state(hal),
            Self::WearLevelingByte(s) => s.finalize_save_state(hal),
            Self::WearLevelingSector(s) => s.finalize_save_state(hal),
        }
    }

    pub(crate) fn finalize_size_check(&mut self) -> Result<(), Error> {
        match self {
            Self::Simple(s) => s.finalize_size_check(),
            Self::WearLevelingByte(s) => s.finalize_size_check(),
            Self::WearLevelingSector(s) => s.finalize_size_check(),
        }
    }

    pub(crate) fn finalize_load_state(&mut self) {
        match self {
            Self::Simple(s) => s.finalize_load_state(),
            Self::WearLevelingByte(s) => s.finalize_load_state(),
            Self::WearLevelingSector(s) => s.finalize_load_state(),
        }
    }

    pub(crate) fn notify_update(&mut self) {
        match self {
            Self::Simple(s) => s.notify_update(),
            Self::WearLevelingByte(s) => s.notify_update(),
            Self::WearLevelingSector(s) => s.notify_update(),
        }
    }
}
