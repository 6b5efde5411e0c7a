use super::{Phase, StateStorageInterface};
use crate::error::Error;
use crate::platform::{Medium, WriteSemantics};
use crate::raw::{
    PREAMBLE_SIZE, Preamble, SECTION_PREAMBLE_SIZE, STORAGE_VERSION, SectionPreamble, SectionType,
    StateWlSectorConfig, StateWlSectorHeader, WL_SECTOR_CONFIG_SIZE, WL_SECTOR_HEADER_SIZE,
    bitmap_index, crc16,
};
use alloc::vec;
use alloc::vec::Vec;

const MIN_SECTOR_COUNT: u32 = 4;
const MIRROR_COUNT: u32 = 2;

/// Round robin over the slots of an erase block medium.
///
/// The first two sectors hold identical metadata:
/// `Preamble | SectionPreamble | StateWlSectorConfig | slot index bitmap`. The slots follow in
/// the remaining sectors, each `StateWlSectorHeader | payload`. The index of the current slot is
/// the number of cleared bits in the bitmap, so advancing only clears bits until the slot area
/// wraps around.
pub(crate) struct StateWearLevelingSector {
    storage_offset: u32,
    section_offset: u32,
    available_size: u32,
    sector_size: u32,

    /// `None` until the first save with a known size
    element_state_size: Option<u16>,
    slot_count: u32,
    current_slot: u32,
    /// The next save restarts at slot 0
    restart_pending: bool,

    crc_valid: bool,
    init_done: bool,
    disabled: bool,
    data_changed: bool,

    phase: Phase,
    new_size: u32,
    buffer: Vec<u8>,
}

impl StateWearLevelingSector {
    pub(crate) fn new(storage_offset: u32, available_size: u32, sector_size: u32) -> Self {
        Self {
            storage_offset,
            section_offset: storage_offset + PREAMBLE_SIZE as u32,
            available_size,
            sector_size,
            element_state_size: None,
            slot_count: 0,
            current_slot: 0,
            restart_pending: true,
            crc_valid: false,
            init_done: false,
            disabled: false,
            data_changed: false,
            phase: Phase::Idle,
            new_size: 0,
            buffer: Vec::new(),
        }
    }

    /// Start of the sector holding the main metadata copy.
    fn metadata_sector(&self) -> u32 {
        self.section_offset / self.sector_size * self.sector_size
    }

    fn config_offset(&self) -> u32 {
        self.section_offset + SECTION_PREAMBLE_SIZE as u32
    }

    fn bitmap_offset(&self) -> u32 {
        self.config_offset() + WL_SECTOR_CONFIG_SIZE as u32
    }

    fn bitmap_len(&self) -> u32 {
        (self.metadata_sector() + self.sector_size).saturating_sub(self.bitmap_offset())
    }

    fn first_slot_address(&self) -> u32 {
        self.metadata_sector() + MIRROR_COUNT * self.sector_size
    }

    fn slot_area_end(&self) -> u32 {
        let sectors = self.available_size / self.sector_size;
        self.first_slot_address() + sectors.saturating_sub(MIRROR_COUNT) * self.sector_size
    }

    fn slot_size(&self) -> u32 {
        WL_SECTOR_HEADER_SIZE as u32 + self.element_state_size.unwrap_or(0) as u32
    }

    fn slot_address(&self, index: u32) -> u32 {
        self.first_slot_address() + index * self.slot_size()
    }

    fn next_slot(&self, index: u32) -> u32 {
        if index + 1 >= self.slot_count {
            0
        } else {
            index + 1
        }
    }

    fn end_sector(&self, index: u32) -> u32 {
        (self.slot_address(index) + self.slot_size() - 1) / self.sector_size
    }

    /// Checks the region layout, independent of the state size.
    fn check_layout(&mut self) -> Result<(), Error> {
        if self.sector_size == 0 {
            warn!("wl sector: sector size 0");
            self.disabled = true;
            return Err(Error::InsufficientSpace);
        }
        let sectors = self.available_size / self.sector_size;
        let layout_ok = sectors >= MIN_SECTOR_COUNT
            && self.storage_offset / self.sector_size == self.section_offset / self.sector_size
            && self.bitmap_len() > 0;
        if !layout_ok {
            warn!(
                "wl sector: {} bytes at @{:#x} do not fit the sector layout",
                self.available_size, self.storage_offset
            );
            self.disabled = true;
            return Err(Error::InsufficientSpace);
        }
        Ok(())
    }

    /// Number of slots for a given state size. A slot may span at most half a sector, so the
    /// sector erased for the next slot never holds the current one.
    fn slot_count_for(&self, element_state_size: u16) -> Option<u32> {
        let slot_size = WL_SECTOR_HEADER_SIZE as u32 + element_state_size as u32;
        if slot_size > self.sector_size / 2 {
            return None;
        }
        let count = ((self.slot_area_end() - self.first_slot_address()) / slot_size)
            .min(self.bitmap_len() * 8);
        (count >= 2).then_some(count)
    }

    fn set_element_state_size(&mut self, element_state_size: u32) -> Result<(), Error> {
        let count = u16::try_from(element_state_size)
            .ok()
            .and_then(|size| self.slot_count_for(size).map(|count| (size, count)));
        let Some((size, count)) = count else {
            warn!(
                "wl sector: state of {} bytes does not fit",
                element_state_size
            );
            self.disabled = true;
            return Err(Error::InsufficientSpace);
        };
        self.element_state_size = Some(size);
        self.slot_count = count;
        Ok(())
    }

    /// Starts over at slot 0 with the given state size. Nothing is written until the next save.
    fn reset_baseline(&mut self, element_state_size: u32) -> Result<(), Error> {
        self.crc_valid = false;
        self.restart_pending = true;
        self.set_element_state_size(element_state_size)
    }

    /// Validates one metadata copy and takes over its slot index. A copy of another version is
    /// reported as `UnsupportedVersion`, the caller still tries the other copy.
    fn load_mirror<M: Medium>(&mut self, hal: &mut M, mirror: u32) -> Result<bool, Error> {
        let shift = mirror * self.sector_size;

        let mut buf = [0u8; PREAMBLE_SIZE];
        hal.read(self.storage_offset + shift, &mut buf)?;
        let preamble = Preamble::from_bytes(&buf);
        if !preamble.is_tag_valid() || preamble.sections_count == 0 {
            debug!("wl sector: no preamble in copy {}", mirror);
            return Ok(false);
        }
        if preamble.version != STORAGE_VERSION {
            warn!("wl sector: unsupported version {}", preamble.version);
            return Err(Error::UnsupportedVersion(preamble.version));
        }

        let mut buf = [0u8; SECTION_PREAMBLE_SIZE];
        hal.read(self.section_offset + shift, &mut buf)?;
        let section = SectionPreamble::from_bytes(&buf);
        if section.section_type() != Some(SectionType::ElementStateWearLevelingSector) {
            debug!("wl sector: unexpected section type {} in copy {}", section.section_type, mirror);
            return Ok(false);
        }

        let mut buf = [0u8; WL_SECTOR_CONFIG_SIZE];
        hal.read(self.config_offset() + shift, &mut buf)?;
        let config = StateWlSectorConfig::from_bytes(&buf);
        if !config.is_valid() || (config.state_slot_size as usize) < WL_SECTOR_HEADER_SIZE {
            debug!("wl sector: invalid config in copy {}", mirror);
            return Ok(false);
        }
        let element_state_size = config.state_slot_size - WL_SECTOR_HEADER_SIZE as u16;
        let Some(slot_count) = self.slot_count_for(element_state_size) else {
            warn!("wl sector: stored slot size {} does not fit", config.state_slot_size);
            return Ok(false);
        };

        let mut bitmap = vec![0u8; self.bitmap_len() as usize];
        hal.read(self.bitmap_offset() + shift, &mut bitmap)?;
        let index = bitmap_index(&bitmap) as u32;
        if index >= slot_count {
            warn!("wl sector: slot index {} out of range in copy {}", index, mirror);
            return Ok(false);
        }

        self.element_state_size = Some(element_state_size);
        self.slot_count = slot_count;
        self.current_slot = index;
        self.restart_pending = false;
        self.crc_valid = section.is_consistent();
        Ok(true)
    }

    /// Metadata image from the preamble up to the end of the metadata sector.
    fn metadata_image(&self) -> Vec<u8> {
        let len = (self.metadata_sector() + self.sector_size - self.storage_offset) as usize;
        let mut image = vec![0xFFu8; len];

        image[..PREAMBLE_SIZE].copy_from_slice(&Preamble::new(1).to_bytes());
        let size = self.available_size.min(u16::MAX as u32) as u16;
        let section = SectionPreamble::new(SectionType::ElementStateWearLevelingSector, size, 0);
        let offset = PREAMBLE_SIZE;
        image[offset..offset + SECTION_PREAMBLE_SIZE].copy_from_slice(&section.to_bytes());

        let config = match self.element_state_size {
            Some(size) if self.init_done => {
                StateWlSectorConfig::new(size + WL_SECTOR_HEADER_SIZE as u16)
            }
            _ => StateWlSectorConfig::erased(),
        };
        let offset = offset + SECTION_PREAMBLE_SIZE;
        image[offset..offset + WL_SECTOR_CONFIG_SIZE].copy_from_slice(&config.to_bytes());

        let bitmap = &mut image[offset + WL_SECTOR_CONFIG_SIZE..];
        let index = self.current_slot as usize;
        let full = (index / 8).min(bitmap.len());
        bitmap[..full].fill(0);
        if index % 8 != 0 && full < bitmap.len() {
            bitmap[full] = 0xFF << (index % 8);
        }
        image
    }

    /// Brings one metadata copy to `image`, in place if only bits have to be cleared, otherwise
    /// by erasing its sector. Bytes of the sector in front of the preamble are replayed after an
    /// erase.
    fn write_mirror<M: Medium>(
        &mut self,
        hal: &mut M,
        mirror: u32,
        image: &[u8],
    ) -> Result<(), Error> {
        let image_offset = self.storage_offset + mirror * self.sector_size;
        let mut stored = vec![0u8; image.len()];
        hal.read(image_offset, &mut stored)?;
        if stored == image {
            return Ok(());
        }

        let programmable = hal.write_semantics() == WriteSemantics::Overwrite
            || stored.iter().zip(image).all(|(s, e)| s & e == *e);
        if programmable {
            // preamble last, it marks the copy as complete
            write_changed(hal, image_offset, &stored, image, PREAMBLE_SIZE..image.len())?;
            write_changed(hal, image_offset, &stored, image, 0..PREAMBLE_SIZE)?;
            hal.read(image_offset, &mut stored)?;
            if stored == image {
                return Ok(());
            }
            warn!("wl sector: in place update of copy {} failed", mirror);
        }

        let sector = self.metadata_sector() + mirror * self.sector_size;
        let mut prefix = vec![0xFFu8; (image_offset - sector) as usize];
        if !prefix.is_empty() {
            hal.read(sector, &mut prefix)?;
        }
        debug!("wl sector: erasing metadata sector @{:#x}", sector);
        hal.erase_block(sector, self.sector_size)?;

        let end = image
            .iter()
            .rposition(|&b| b != 0xFF)
            .map_or(PREAMBLE_SIZE, |p| p + 1)
            .max(PREAMBLE_SIZE);
        if end > PREAMBLE_SIZE {
            hal.write(image_offset + PREAMBLE_SIZE as u32, &image[PREAMBLE_SIZE..end])?;
        }
        if prefix.iter().any(|&b| b != 0xFF) {
            hal.write(sector, &prefix)?;
        }
        hal.write(image_offset, &image[..PREAMBLE_SIZE])?;

        hal.read(image_offset, &mut stored)?;
        if stored != image {
            warn!("wl sector: metadata copy {} verification failed", mirror);
            return Err(Error::VerifyFailed);
        }
        Ok(())
    }

    /// Erases the sector a slot ends in, if the previous slot ended in another one.
    fn prepare_slot<M: Medium>(&mut self, hal: &mut M, index: u32) -> Result<(), Error> {
        if index == 0 || self.end_sector(index) != self.end_sector(index - 1) {
            let sector = self.end_sector(index) * self.sector_size;
            trace!("wl sector: erasing data sector @{:#x}", sector);
            hal.erase_block(sector, self.sector_size)?;
        }
        Ok(())
    }

    fn write_slot<M: Medium>(&mut self, hal: &mut M, index: u32) -> Result<bool, Error> {
        self.prepare_slot(hal, index)?;
        let address = self.slot_address(index);
        hal.write(address, &self.buffer)?;

        let mut stored = vec![0u8; self.buffer.len()];
        hal.read(address, &mut stored)?;
        Ok(stored == self.buffer)
    }
}

/// Writes the span of `range` in which `image` differs from `stored`.
fn write_changed<M: Medium>(
    hal: &mut M,
    offset: u32,
    stored: &[u8],
    image: &[u8],
    range: core::ops::Range<usize>,
) -> Result<(), Error> {
    let differs = |i: &usize| stored[*i] != image[*i];
    let first = range.clone().find(differs);
    let last = range.rev().find(differs);
    if let (Some(first), Some(last)) = (first, last) {
        hal.write(offset + first as u32, &image[first..=last])?;
    }
    Ok(())
}

impl StateStorageInterface for StateWearLevelingSector {
    fn section_type(&self) -> SectionType {
        SectionType::ElementStateWearLevelingSector
    }

    fn size_value(&self) -> u16 {
        self.available_size.min(u16::MAX as u32) as u16
    }

    fn init_section_preamble(&mut self, _offset: u32, section: &SectionPreamble) {
        self.crc_valid = section.is_consistent();
    }

    fn write_section_preamble<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error> {
        if self.disabled {
            return Err(Error::StateStorageDisabled);
        }

        if !self.init_done {
            self.current_slot = 0;
            self.restart_pending = true;
            self.crc_valid = false;
        }

        let image = self.metadata_image();
        for mirror in 0..MIRROR_COUNT {
            self.write_mirror(hal, mirror, &image)?;
        }

        if !self.init_done {
            let first = self.first_slot_address();
            hal.erase_block(first, self.sector_size)?;
            self.init_done = true;
        }
        Ok(())
    }

    fn init_from_storage<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error> {
        self.init_done = true;
        if self.element_state_size.is_none() {
            return Ok(());
        }

        let mut slot = vec![0u8; self.slot_size() as usize];
        hal.read(self.slot_address(self.current_slot), &mut slot)?;
        let mut header = [0u8; WL_SECTOR_HEADER_SIZE];
        header.copy_from_slice(&slot[..WL_SECTOR_HEADER_SIZE]);
        let header = StateWlSectorHeader::from_bytes(&header);
        if header.crc != crc16(&slot[WL_SECTOR_HEADER_SIZE..]) {
            warn!("wl sector: invalid crc in slot {}", self.current_slot);
            self.crc_valid = false;
        }

        debug!(
            "wl sector: slot {} of {}, slot size {}",
            self.current_slot,
            self.slot_count,
            self.slot_size()
        );
        Ok(())
    }

    fn load_preambles<M: Medium>(&mut self, hal: &mut M, _storage_offset: u32) -> Result<(), Error>
    where
        Self: Sized,
    {
        self.check_layout()?;

        let mut unsupported = None;
        for mirror in 0..MIRROR_COUNT {
            match self.load_mirror(hal, mirror) {
                Ok(true) => {
                    if mirror > 0 {
                        info!("wl sector: using backup metadata");
                    }
                    return self.init_from_storage(hal);
                }
                Ok(false) => {}
                Err(Error::UnsupportedVersion(version)) => unsupported = Some(version),
                Err(e) => return Err(e),
            }
        }
        if let Some(version) = unsupported {
            self.disabled = true;
            return Err(Error::UnsupportedVersion(version));
        }

        info!("wl sector: initializing region @{:#x}", self.storage_offset);
        self.element_state_size = None;
        self.write_section_preamble(hal)
    }

    fn delete_all(&mut self) {
        self.crc_valid = false;
        self.phase = Phase::Idle;
    }

    fn prepare_save_state(&mut self) -> Result<(), Error> {
        if self.disabled {
            return Err(Error::StateStorageDisabled);
        }
        self.phase = Phase::Save;
        self.new_size = 0;
        self.buffer.clear();
        self.buffer.resize(self.slot_size() as usize, 0xFF);
        Ok(())
    }

    fn prepare_size_check(&mut self) -> Result<(), Error> {
        if self.disabled {
            return Err(Error::StateStorageDisabled);
        }
        self.phase = Phase::SizeCheck;
        self.new_size = 0;
        Ok(())
    }

    fn prepare_load_state<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error> {
        if self.disabled {
            return Err(Error::StateStorageDisabled);
        }
        if self.element_state_size.is_none() || !self.crc_valid || self.restart_pending {
            return Err(Error::NoValidState);
        }

        self.buffer.clear();
        self.buffer.resize(self.slot_size() as usize, 0);
        hal.read(self.slot_address(self.current_slot), &mut self.buffer)?;
        self.phase = Phase::Load;
        self.new_size = 0;
        Ok(())
    }

    fn read_state<M: Medium>(&mut self, _hal: &mut M, bytes: &mut [u8]) -> Result<(), Error> {
        if self.phase != Phase::Load {
            return Err(Error::InvalidOperation);
        }
        let start = WL_SECTOR_HEADER_SIZE + self.new_size as usize;
        let end = start + bytes.len();
        if end > self.buffer.len() {
            return Err(Error::OutOfSection);
        }

        bytes.copy_from_slice(&self.buffer[start..end]);
        self.new_size += bytes.len() as u32;
        Ok(())
    }

    fn write_state<M: Medium>(&mut self, _hal: &mut M, bytes: &[u8]) -> Result<(), Error> {
        match self.phase {
            Phase::SizeCheck => {
                self.new_size += bytes.len() as u32;
                Ok(())
            }
            Phase::Save => {
                let start = WL_SECTOR_HEADER_SIZE + self.new_size as usize;
                let end = start + bytes.len();
                // a grown state does not fit the slot, finalize reports the mismatch
                if end <= self.buffer.len() {
                    self.buffer[start..end].copy_from_slice(bytes);
                }
                self.new_size += bytes.len() as u32;
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

        if self.element_state_size.map(u32::from) != Some(self.new_size) {
            info!("wl sector: state size changed to {}", self.new_size);
            self.reset_baseline(self.new_size)?;
            return Err(Error::SizeMismatch);
        }

        let header = StateWlSectorHeader {
            crc: crc16(&self.buffer[WL_SECTOR_HEADER_SIZE..]),
        };
        self.buffer[..WL_SECTOR_HEADER_SIZE].copy_from_slice(&header.to_bytes());

        if !self.restart_pending && self.crc_valid && !self.data_changed {
            let mut stored = vec![0u8; self.buffer.len()];
            hal.read(self.slot_address(self.current_slot), &mut stored)?;
            if stored == self.buffer {
                trace!("wl sector: state unchanged");
                return Ok(());
            }
        }

        let mut candidate = if self.restart_pending {
            0
        } else {
            self.next_slot(self.current_slot)
        };
        let mut written = self.write_slot(hal, candidate)?;
        if !written {
            warn!("wl sector: verification failed at slot {}, retrying", candidate);
            candidate = self.next_slot(candidate);
            written = self.write_slot(hal, candidate)?;
        }
        if !written {
            warn!("wl sector: verification failed at slot {}", candidate);
            return Err(Error::VerifyFailed);
        }

        self.current_slot = candidate;
        self.restart_pending = false;
        self.crc_valid = true;
        self.data_changed = false;
        self.write_section_preamble(hal)
    }

    fn finalize_size_check(&mut self) -> Result<(), Error> {
        if self.phase != Phase::SizeCheck {
            return Err(Error::InvalidOperation);
        }
        self.phase = Phase::Idle;

        if self.element_state_size.map(u32::from) != Some(self.new_size) {
            info!("wl sector: state size changed to {}", self.new_size);
            self.reset_baseline(self.new_size)?;
            return Err(Error::SizeMismatch);
        }
        Ok(())
    }

    fn finalize_load_state(&mut self) {
        self.phase = Phase::Idle;
        self.buffer.clear();
    }

    fn notify_update(&mut self) {
        self.data_changed = true;
    }
}
