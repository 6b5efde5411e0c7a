use thiserror::Error;

/// Errors reported by the storage engine. None of them is fatal for the firmware: a failed load
/// means there is no prior state to restore, a failed save is retried with the next scheduled save.
#[derive(Error, Debug, PartialEq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The internal error value is returned from the underlying flash or eeprom driver
    #[error("internal medium error")]
    MediumError,

    /// Access beyond the capacity of the medium or not aligned to its erase size
    #[error("address out of bounds")]
    OutOfBounds,

    /// `Storage::init` was not called or did not succeed
    #[error("storage not initialized")]
    NotInitialized,

    /// The storage region carries a preamble of a version this crate does not understand
    #[error("unsupported storage version: {0}")]
    UnsupportedVersion(u16),

    /// The reserved region is too small for the minimum slot count of the selected strategy
    #[error("insufficient space for state storage")]
    InsufficientSpace,

    /// State storage was disabled during init, see the logs for the reason
    #[error("state storage disabled")]
    StateStorageDisabled,

    /// No complete state record is stored, e.g. after the first boot or after a size change
    #[error("no valid state stored")]
    NoValidState,

    /// The element state has a different length than the committed one. The baseline was reset,
    /// the next save will succeed.
    #[error("element state size mismatch")]
    SizeMismatch,

    /// An element tried to read more bytes than stored
    #[error("read beyond stored state")]
    OutOfSection,

    /// `read_state`/`write_state` called without the matching prepare step
    #[error("no state operation in progress")]
    InvalidOperation,

    /// Two consecutive slots failed to read back what was written
    #[error("write verification failed")]
    VerifyFailed,

    /// The stored channel number does not match the element being loaded
    #[error("channel number mismatch: expected {expected}, found {found}")]
    ChannelMismatch { expected: u8, found: u8 },

    #[error("section already registered")]
    SectionAlreadyRegistered,

    #[error("section not registered")]
    SectionNotRegistered,

    /// A backup copy can only be selected if the section is protected by a CRC
    #[error("backup copy requires crc")]
    BackupRequiresCrc,

    /// The provided buffer does not match the registered section size
    #[error("section size mismatch")]
    SectionSizeMismatch,

    /// Neither the main nor the backup copy of a special section passed the CRC check
    #[error("invalid crc")]
    InvalidCrc,
}
