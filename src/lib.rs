#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

#[macro_use]
mod fmt;

pub mod config;
mod element;
pub mod error;
pub mod platform;
pub mod raw;
pub mod schedule;
mod section;
mod state;

pub use config::{StorageConfig, WearLevelingMode};
pub use element::{StateElement, StateIo};
pub use error::Error;
pub use section::SpecialSection;

extern crate alloc;

use crate::platform::{Medium, WriteSemantics};
use crate::raw::PREAMBLE_SIZE;
use crate::schedule::{Clock, SaveScheduler};
use crate::section::SpecialSections;
use crate::state::{StateStorage, update_storage};

/// Channel byte stored for elements without a channel when channel tagging is enabled.
const NO_CHANNEL: u8 = u8::MAX;

/// Entry point of the storage engine. Owns the medium for its whole lifetime; construct one at
/// boot and pass it by reference to whoever needs to persist something.
pub struct Storage<M: Medium> {
    pub(crate) hal: M,
    pub(crate) config: StorageConfig,
    pub(crate) init_done: bool,

    // set after calling self.init
    pub(crate) state: Option<StateStorage>,
    pub(crate) sections: SpecialSections,
    pub(crate) scheduler: SaveScheduler,
}

impl<M: Medium> Storage<M> {
    pub fn new(hal: M, config: StorageConfig) -> Self {
        let scheduler = SaveScheduler::new(config.save_state_period_ms);
        Self {
            hal,
            config,
            init_done: false,
            state: None,
            sections: SpecialSections::default(),
            scheduler,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn medium(&self) -> &M {
        &self.hal
    }

    pub fn medium_mut(&mut self) -> &mut M {
        &mut self.hal
    }

    /// Releases the medium, e.g. to simulate a reboot.
    pub fn into_medium(self) -> M {
        self.hal
    }

    /// Scans the storage region and initializes it if it carries no valid preamble. Calling it
    /// again after a successful init does nothing.
    ///
    /// Errors other than medium errors disable the state storage until the next boot, special
    /// sections stay usable.
    pub fn init(&mut self) -> Result<(), Error> {
        if self.init_done {
            return Ok(());
        }

        if self.hal.write_semantics() == WriteSemantics::ClearBitsOnly
            && self.config.wear_leveling != WearLevelingMode::SectorWriteMode
        {
            warn!("storage: medium can only clear bits, sector write mode recommended");
        }

        let mut state = StateStorage::new(&self.config);
        match state.load_preambles(&mut self.hal, self.config.starting_offset) {
            Ok(()) => {
                self.state = Some(state);
                self.init_done = true;
                Ok(())
            }
            Err(Error::MediumError) => {
                warn!("storage: medium error during init");
                Err(Error::MediumError)
            }
            Err(e) => {
                warn!("storage: state storage disabled: {}", e);
                self.init_done = true;
                Err(e)
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.init_done
    }

    fn state_and_medium(&mut self) -> Result<(&mut StateStorage, &mut M), Error> {
        let unavailable = if self.init_done {
            Error::StateStorageDisabled
        } else {
            Error::NotInitialized
        };
        let state = self.state.as_mut().ok_or(unavailable)?;
        Ok((state, &mut self.hal))
    }

    fn write_channel_number(&mut self, element: &dyn StateElement) -> Result<(), Error> {
        if self.config.channel_numbers_in_state {
            let channel = element.channel_number().unwrap_or(NO_CHANNEL);
            self.write_state(&[channel])?;
        }
        Ok(())
    }

    fn save_elements(&mut self, elements: &[&dyn StateElement]) -> Result<(), Error> {
        for element in elements {
            self.write_channel_number(*element)?;
            element.on_save_state(self)?;
        }
        Ok(())
    }

    fn load_elements(&mut self, elements: &mut [&mut dyn StateElement]) -> Result<(), Error> {
        for element in elements.iter_mut() {
            if self.config.channel_numbers_in_state {
                let expected = element.channel_number().unwrap_or(NO_CHANNEL);
                let mut found = [0u8; 1];
                self.read_state(&mut found)?;
                if found[0] != expected {
                    warn!(
                        "storage: expected channel {}, found {}",
                        expected, found[0]
                    );
                    return Err(Error::ChannelMismatch {
                        expected,
                        found: found[0],
                    });
                }
            }
            element.on_load_state(self)?;
        }
        Ok(())
    }

    /// Restores the state of all elements, in the order they were saved.
    ///
    /// Fails if no complete state is stored. Elements processed before a failure may already
    /// carry restored values.
    pub fn load_state_storage(
        &mut self,
        elements: &mut [&mut dyn StateElement],
    ) -> Result<(), Error> {
        let (state, hal) = self.state_and_medium()?;
        state.prepare_load_state(hal)?;

        let result = self.load_elements(elements);
        if let Some(state) = self.state.as_mut() {
            state.finalize_load_state();
        }
        result
    }

    /// Saves the state of all elements. A failed save leaves the previously saved state intact
    /// and is simply retried with the next scheduled save.
    pub fn write_state_storage(&mut self, elements: &[&dyn StateElement]) -> Result<(), Error> {
        let (state, _) = self.state_and_medium()?;
        state.prepare_save_state()?;

        self.save_elements(elements)?;

        let (state, hal) = self.state_and_medium()?;
        state.finalize_save_state(hal)
    }

    /// Dry run of a save comparing the length of the element state with the stored one. On a
    /// mismatch the stored state is dropped and the next save starts a new baseline.
    pub fn is_state_storage_valid(&mut self, elements: &[&dyn StateElement]) -> bool {
        match self.check_state_size(elements) {
            Ok(()) => true,
            Err(e) => {
                debug!("storage: state storage not valid: {}", e);
                false
            }
        }
    }

    fn check_state_size(&mut self, elements: &[&dyn StateElement]) -> Result<(), Error> {
        let (state, _) = self.state_and_medium()?;
        state.prepare_size_check()?;

        self.save_elements(elements)?;

        let (state, _) = self.state_and_medium()?;
        state.finalize_size_check()
    }

    /// Forces the next save to be written even if the element state did not change.
    pub fn notify_update(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.notify_update();
        }
    }

    /// Factory reset: invalidates the preamble of the region, so the next boot starts with an
    /// empty state storage. Special sections are not touched.
    ///
    /// The storage returns to the uninitialized state: state access fails with `NotInitialized`
    /// until `init` is called again, which builds a fresh region.
    pub fn delete_all(&mut self) -> Result<(), Error> {
        if let Some(state) = self.state.as_mut() {
            state.delete_all();
        }

        let invalid = [0u8; PREAMBLE_SIZE];
        if self.config.wear_leveling == WearLevelingMode::SectorWriteMode
            && self.config.sector_size > 0
            && self.config.available_size >= self.config.sector_size.saturating_mul(2)
        {
            let mirror = self.config.starting_offset.saturating_add(self.config.sector_size);
            update_storage(&mut self.hal, mirror, &invalid)?;
        }
        update_storage(&mut self.hal, self.config.starting_offset, &invalid)?;
        self.hal.commit()?;

        info!("storage: state storage deleted");
        self.state = None;
        self.init_done = false;
        Ok(())
    }

    pub fn set_state_save_period(&mut self, period_ms: u64) {
        self.scheduler.set_period(period_ms);
    }

    /// Polled by the firmware, returns true when the next periodic save is due.
    pub fn save_state_allowed(&mut self, clock: &impl Clock) -> bool {
        self.scheduler.save_state_allowed(clock.now_ms())
    }

    /// Requests a save within `delay_ms`, e.g. after a relay changed its state.
    pub fn schedule_save(&mut self, clock: &impl Clock, delay_ms: u64) {
        self.scheduler.schedule_save(clock.now_ms(), delay_ms);
    }

    /// Registers a special section. `add_backup_copy` requires `add_crc`.
    pub fn register_section(
        &mut self,
        id: u16,
        offset: u32,
        size: u16,
        add_crc: bool,
        add_backup_copy: bool,
    ) -> Result<(), Error> {
        self.sections.register(SpecialSection {
            id,
            offset,
            size,
            add_crc,
            add_backup_copy,
        })
    }

    /// Reads a special section, falling back to its backup copy if the main copy is corrupted.
    pub fn read_section(&mut self, id: u16, data: &mut [u8]) -> Result<(), Error> {
        let section = *self.sections.get(id).ok_or(Error::SectionNotRegistered)?;
        section.read(&mut self.hal, data)
    }

    pub fn write_section(&mut self, id: u16, data: &[u8]) -> Result<(), Error> {
        let section = *self.sections.get(id).ok_or(Error::SectionNotRegistered)?;
        section.write(&mut self.hal, data)
    }

    pub fn delete_section(&mut self, id: u16) -> Result<(), Error> {
        let section = *self.sections.get(id).ok_or(Error::SectionNotRegistered)?;
        section.delete(&mut self.hal)
    }
}

impl<M: Medium> StateIo for Storage<M> {
    fn write_state(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let (state, hal) = self.state_and_medium()?;
        state.write_state(hal, bytes)
    }

    fn read_state(&mut self, bytes: &mut [u8]) -> Result<(), Error> {
        let (state, hal) = self.state_and_medium()?;
        state.read_state(hal, bytes)
    }
}
