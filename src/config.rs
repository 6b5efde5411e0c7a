use crate::schedule::DEFAULT_SAVE_STATE_PERIOD_MS;

pub const DEFAULT_SECTOR_SIZE: u32 = 4096;

/// Strategy used to persist the element state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WearLevelingMode {
    /// One slot, rewritten in place
    #[default]
    Off,
    /// Ping-pong round robin for random access media
    ByteWriteMode,
    /// Round robin over erase blocks with mirrored metadata
    SectorWriteMode,
}

/// Placement and behaviour of the state storage region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Absolute offset of the region on the medium
    pub starting_offset: u32,
    /// Size of the region. Ignored with [`WearLevelingMode::Off`], which only uses what the state
    /// needs.
    pub available_size: u32,
    pub wear_leveling: WearLevelingMode,
    /// Erase block size of the medium, used by [`WearLevelingMode::SectorWriteMode`]
    pub sector_size: u32,
    pub save_state_period_ms: u64,
    /// Prefix every element state with its channel number
    pub channel_numbers_in_state: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            starting_offset: 0,
            available_size: 0,
            wear_leveling: WearLevelingMode::Off,
            sector_size: DEFAULT_SECTOR_SIZE,
            save_state_period_ms: DEFAULT_SAVE_STATE_PERIOD_MS,
            channel_numbers_in_state: false,
        }
    }
}

impl StorageConfig {
    pub fn with_starting_offset(mut self, starting_offset: u32) -> Self {
        self.starting_offset = starting_offset;
        self
    }

    pub fn with_available_size(mut self, available_size: u32) -> Self {
        self.available_size = available_size;
        self
    }

    pub fn with_wear_leveling(mut self, wear_leveling: WearLevelingMode) -> Self {
        self.wear_leveling = wear_leveling;
        self
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn with_save_state_period_ms(mut self, period_ms: u64) -> Self {
        self.save_state_period_ms = period_ms;
        self
    }

    pub fn with_channel_numbers_in_state(mut self, enabled: bool) -> Self {
        self.channel_numbers_in_state = enabled;
        self
    }
}
