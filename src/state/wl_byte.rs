use super::{Phase, StateStorageInterface, is_data_different, update_storage};
use crate::error::Error;
use crate::platform::Medium;
use crate::raw::{
    PREAMBLE_SIZE, SECTION_PREAMBLE_SIZE, STATE_ENTRY_ADDRESS_SIZE, SectionPreamble, SectionType,
    StateEntryAddress, StateWlByteHeader, WL_BYTE_HEADER_SIZE, crc16, crc16_digest,
};
use alloc::vec;
use crc::Digest;

/// A slot pair plus one slot to rotate into.
const MIN_SLOT_COUNT: u32 = 3;
const RECOMMENDED_SLOT_COUNT: u32 = 20;

/// Round robin over the slots of a random access medium.
///
/// Section layout:
/// `SectionPreamble | StateEntryAddress (main) | StateEntryAddress (backup) | slot 0 | slot 1 ...`
/// with every slot being `StateWlByteHeader | payload`.
///
/// Saves alternate between the current slot (even write count) and its neighbour (odd write
/// count), so an interrupted write always leaves the other slot of the pair intact. After
/// `repeat_before_switch` writes the pair moves on by one slot and the entry address is updated.
pub(crate) struct StateWearLevelingByte {
    section_offset: u32,
    /// Section size including the section preamble
    reserved_size: u32,
    element_state_size: u16,

    current_slot_address: u32,
    write_count: u16,
    repeat_before_switch: u16,
    slot_count: u32,
    /// Slot holding the newest complete state
    latest_slot: Option<u32>,

    storage_ok: bool,
    init_done: bool,
    data_changed: bool,

    phase: Phase,
    current_offset: u32,
    new_size: u32,
    digest: Option<Digest<'static, u16>>,
}

impl StateWearLevelingByte {
    pub(crate) fn new(section_offset: u32, available_size: u32) -> Self {
        Self {
            section_offset,
            reserved_size: available_size.saturating_sub(PREAMBLE_SIZE as u32),
            element_state_size: 0,
            current_slot_address: 0,
            write_count: 0,
            repeat_before_switch: 0,
            slot_count: 0,
            latest_slot: None,
            storage_ok: false,
            init_done: false,
            data_changed: false,
            phase: Phase::Idle,
            current_offset: 0,
            new_size: 0,
            digest: None,
        }
    }

    fn main_entry_offset(&self) -> u32 {
        self.section_offset + SECTION_PREAMBLE_SIZE as u32
    }

    fn backup_entry_offset(&self) -> u32 {
        self.main_entry_offset() + STATE_ENTRY_ADDRESS_SIZE as u32
    }

    fn first_slot_address(&self) -> u32 {
        self.backup_entry_offset() + STATE_ENTRY_ADDRESS_SIZE as u32
    }

    fn section_end(&self) -> u32 {
        self.section_offset + self.reserved_size
    }

    fn slot_size(&self) -> u32 {
        WL_BYTE_HEADER_SIZE as u32 + self.element_state_size as u32
    }

    fn next_slot_address(&self, address: u32) -> u32 {
        let next = address + self.slot_size();
        if next + self.slot_size() > self.section_end() {
            self.first_slot_address()
        } else {
            next
        }
    }

    fn is_slot_address(&self, address: u32) -> bool {
        let first = self.first_slot_address();
        address >= first
            && (address - first).is_multiple_of(self.slot_size())
            && address + self.slot_size() <= self.section_end()
    }

    /// Slot written by the next save.
    fn target_slot_address(&self) -> u32 {
        if self.write_count % 2 == 1 {
            self.next_slot_address(self.current_slot_address)
        } else {
            self.current_slot_address
        }
    }

    fn advance_write_count(&mut self) {
        self.write_count += 1;
        if self.write_count > self.repeat_before_switch {
            self.current_slot_address = self.next_slot_address(self.current_slot_address);
            self.write_count = 1;
            trace!(
                "wl byte: switching to slot @{:#x}",
                self.current_slot_address
            );
        }
    }

    /// Recomputes the slot geometry for the current element state size.
    fn check_space(&mut self) -> Result<(), Error> {
        let slot_area = self
            .reserved_size
            .saturating_sub((SECTION_PREAMBLE_SIZE + 2 * STATE_ENTRY_ADDRESS_SIZE) as u32);
        self.slot_count = slot_area / self.slot_size();

        if self.slot_count < MIN_SLOT_COUNT {
            warn!(
                "wl byte: {} bytes fit only {} slots of {} bytes",
                self.reserved_size,
                self.slot_count,
                self.slot_size()
            );
            self.storage_ok = false;
            return Err(Error::InsufficientSpace);
        }
        if self.slot_count < RECOMMENDED_SLOT_COUNT {
            warn!(
                "wl byte: only {} slots, consider reserving more space",
                self.slot_count
            );
        }

        // odd, so that the pair always ends on its second slot
        self.repeat_before_switch = self.slot_count.min(0x7FFF) as u16 | 1;
        self.storage_ok = true;
        Ok(())
    }

    /// Starts over at the first slot with the given state size. Nothing is written until the
    /// next save.
    fn reset_baseline(&mut self, element_state_size: u32) -> Result<(), Error> {
        self.latest_slot = None;
        self.write_count = 0;
        self.current_slot_address = self.first_slot_address();
        let Ok(size) = u16::try_from(element_state_size) else {
            self.storage_ok = false;
            return Err(Error::InsufficientSpace);
        };
        self.element_state_size = size;
        self.check_space()
    }

    fn update_state_entry_address<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error> {
        let entry = StateEntryAddress::new(self.current_slot_address, self.element_state_size);
        let bytes = entry.to_bytes();
        // backup first: after a crash at most the main copy is stale
        update_storage(hal, self.backup_entry_offset(), &bytes)?;
        update_storage(hal, self.main_entry_offset(), &bytes)?;
        Ok(())
    }

    fn read_entry<M: Medium>(&self, hal: &mut M, offset: u32) -> Result<StateEntryAddress, Error> {
        let mut buf = [0u8; STATE_ENTRY_ADDRESS_SIZE];
        hal.read(offset, &mut buf)?;
        Ok(StateEntryAddress::from_bytes(&buf))
    }

    /// Header of the slot at `address` if its payload matches the crc.
    fn read_valid_header<M: Medium>(
        &self,
        hal: &mut M,
        address: u32,
    ) -> Result<Option<StateWlByteHeader>, Error> {
        let mut buf = vec![0u8; self.slot_size() as usize];
        hal.read(address, &mut buf)?;
        let mut header = [0u8; WL_BYTE_HEADER_SIZE];
        header.copy_from_slice(&buf[..WL_BYTE_HEADER_SIZE]);
        let header = StateWlByteHeader::from_bytes(&header);
        // erased memory has a matching crc for an empty payload, but never a sane write count
        if header.write_count <= self.repeat_before_switch
            && crc16(&buf[WL_BYTE_HEADER_SIZE..]) == header.crc
        {
            Ok(Some(header))
        } else {
            Ok(None)
        }
    }

    fn select_entry<M: Medium>(&mut self, hal: &mut M) -> Result<Option<StateEntryAddress>, Error> {
        let main = self.read_entry(hal, self.main_entry_offset())?;
        let backup = self.read_entry(hal, self.backup_entry_offset())?;

        let entry = match (main.is_valid(), backup.is_valid()) {
            (false, false) => None,
            (true, false) => {
                debug!("wl byte: backup entry address invalid");
                Some(main)
            }
            (false, true) => {
                debug!("wl byte: main entry address invalid");
                Some(backup)
            }
            (true, true) if main == backup => Some(main),
            (true, true) => {
                // a crash between the backup and the main write leaves the backup one slot ahead
                self.element_state_size = main.element_state_size;
                if backup.address == self.next_slot_address(main.address) {
                    info!("wl byte: using backup entry address");
                    Some(backup)
                } else {
                    Some(main)
                }
            }
        };
        Ok(entry)
    }
}

impl StateStorageInterface for StateWearLevelingByte {
    fn section_type(&self) -> SectionType {
        SectionType::ElementStateWearLevelingByte
    }

    fn size_value(&self) -> u16 {
        self.reserved_size.min(u16::MAX as u32) as u16
    }

    fn init_section_preamble(&mut self, offset: u32, section: &SectionPreamble) {
        self.section_offset = offset;
        self.reserved_size = section.size as u32;
    }

    fn write_section_preamble<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error> {
        self.check_space()?;

        let section = SectionPreamble::new(self.section_type(), self.size_value(), 0);
        update_storage(hal, self.section_offset, &section.to_bytes())?;

        if !self.init_done {
            self.write_count = 0;
            self.current_slot_address = self.first_slot_address();
            self.latest_slot = None;
            self.update_state_entry_address(hal)?;
            let header = StateWlByteHeader {
                write_count: 0,
                crc: 0,
            };
            update_storage(hal, self.current_slot_address, &header.to_bytes())?;
            self.init_done = true;
        }
        Ok(())
    }

    fn init_from_storage<M: Medium>(&mut self, hal: &mut M) -> Result<(), Error> {
        self.init_done = true;

        let Some(entry) = self.select_entry(hal)? else {
            warn!("wl byte: no valid entry address, starting over");
            return self.reset_baseline(0);
        };

        if entry.element_state_size == 0 {
            debug!("wl byte: no state saved yet");
            return self.reset_baseline(0);
        }

        self.element_state_size = entry.element_state_size;
        self.check_space()?;
        if !self.is_slot_address(entry.address) {
            warn!("wl byte: entry address @{:#x} outside slot area", entry.address);
            return self.reset_baseline(entry.element_state_size as u32);
        }

        self.current_slot_address = entry.address;
        let next = self.next_slot_address(entry.address);
        let current_header = self.read_valid_header(hal, entry.address)?;
        let next_header = self.read_valid_header(hal, next)?;

        match (current_header, next_header) {
            (Some(current), Some(neighbour)) => {
                // the current slot is only written with even counts within its pair, an odd
                // count is the last write of the previous pair
                if current.write_count % 2 == 1 || neighbour.write_count > current.write_count {
                    self.write_count = neighbour.write_count;
                    self.latest_slot = Some(next);
                } else {
                    self.write_count = current.write_count;
                    self.latest_slot = Some(entry.address);
                }
            }
            (Some(current), None) => {
                self.write_count = current.write_count;
                self.latest_slot = Some(entry.address);
            }
            (None, Some(neighbour)) => {
                self.write_count = neighbour.write_count;
                self.latest_slot = Some(next);
            }
            (None, None) => {
                warn!("wl byte: no valid slot at @{:#x}", entry.address);
                self.write_count = 0;
                self.latest_slot = None;
            }
        }

        self.advance_write_count();
        if self.latest_slot.is_some() && self.latest_slot == Some(self.target_slot_address()) {
            // never stream the next save over the only valid copy
            self.advance_write_count();
        }

        debug!(
            "wl byte: slot @{:#x}, write count {}, {} slots",
            self.current_slot_address, self.write_count, self.slot_count
        );
        Ok(())
    }

    fn delete_all(&mut self) {
        self.latest_slot = None;
        self.phase = Phase::Idle;
    }

    fn prepare_save_state(&mut self) -> Result<(), Error> {
        if !self.storage_ok {
            return Err(Error::StateStorageDisabled);
        }
        self.phase = Phase::Save;
        self.new_size = 0;
        self.current_offset = self.target_slot_address() + WL_BYTE_HEADER_SIZE as u32;
        self.digest = Some(crc16_digest());
        Ok(())
    }

    fn prepare_size_check(&mut self) -> Result<(), Error> {
        if !self.storage_ok {
            return Err(Error::StateStorageDisabled);
        }
        self.phase = Phase::SizeCheck;
        self.new_size = 0;
        Ok(())
    }

    fn prepare_load_state<M: Medium>(&mut self, _hal: &mut M) -> Result<(), Error> {
        if !self.storage_ok {
            return Err(Error::StateStorageDisabled);
        }
        let Some(slot) = self.latest_slot else {
            return Err(Error::NoValidState);
        };
        self.phase = Phase::Load;
        self.new_size = 0;
        self.current_offset = slot + WL_BYTE_HEADER_SIZE as u32;
        Ok(())
    }

    fn read_state<M: Medium>(&mut self, hal: &mut M, bytes: &mut [u8]) -> Result<(), Error> {
        if self.phase != Phase::Load {
            return Err(Error::InvalidOperation);
        }
        if self.new_size + bytes.len() as u32 > self.element_state_size as u32 {
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
                self.new_size += bytes.len() as u32;
                if let Some(digest) = self.digest.as_mut() {
                    digest.update(bytes);
                }
                // a grown state does not fit the slot, finalize reports the mismatch
                if self.new_size <= self.element_state_size as u32 {
                    update_storage(hal, self.current_offset, bytes)?;
                    self.current_offset += bytes.len() as u32;
                }
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

        if self.new_size != self.element_state_size as u32 {
            info!(
                "wl byte: state size changed from {} to {}",
                self.element_state_size, self.new_size
            );
            self.reset_baseline(self.new_size)?;
            return Err(Error::SizeMismatch);
        }

        let target = self.target_slot_address();
        if !self.data_changed {
            if let Some(latest) = self.latest_slot {
                if latest != target
                    && !is_data_different(
                        hal,
                        target + WL_BYTE_HEADER_SIZE as u32,
                        latest + WL_BYTE_HEADER_SIZE as u32,
                        self.element_state_size as usize,
                    )?
                {
                    trace!("wl byte: state unchanged");
                    return Ok(());
                }
            }
        }

        let header = StateWlByteHeader {
            write_count: self.write_count,
            crc,
        };
        update_storage(hal, target, &header.to_bytes())?;
        hal.commit()?;
        self.latest_slot = Some(target);
        self.data_changed = false;

        if self.write_count == 0 {
            // the neighbour may still hold a valid slot of an older layout
            let erased = [0xFFu8; WL_BYTE_HEADER_SIZE];
            update_storage(hal, self.next_slot_address(target), &erased)?;
        }

        // first write into a new pair (or a new baseline)
        if self.write_count <= 1 {
            self.update_state_entry_address(hal)?;
            hal.commit()?;
        }

        self.advance_write_count();
        Ok(())
    }

    fn finalize_size_check(&mut self) -> Result<(), Error> {
        if self.phase != Phase::SizeCheck {
            return Err(Error::InvalidOperation);
        }
        self.phase = Phase::Idle;

        if self.new_size != self.element_state_size as u32 {
            info!(
                "wl byte: state size changed from {} to {}",
                self.element_state_size, self.new_size
            );
            self.reset_baseline(self.new_size)?;
            return Err(Error::SizeMismatch);
        }
        Ok(())
    }

    fn finalize_load_state(&mut self) {
        self.phase = Phase::Idle;
    }

    fn notify_update(&mut self) {
        self.data_changed = true;
    }
}
