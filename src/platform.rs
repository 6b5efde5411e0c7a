use crate::error::Error;
use alloc::vec;
use embedded_storage::nor_flash::NorFlash;
use embedded_storage::{ReadStorage, Storage};

/// How a write changes already programmed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteSemantics {
    /// Random access memory like EEPROM or FRAM, every write replaces the old content
    Overwrite,
    /// NOR flash, a write can only clear bits. Setting them requires erasing the whole block.
    ClearBitsOnly,
}

/// Byte addressable persistent memory the storage region lives in.
///
/// Offsets are absolute. Implementations take care of any alignment requirements of the
/// underlying driver.
pub trait Medium {
    fn write_semantics(&self) -> WriteSemantics;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error>;

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error>;

    /// Resets `size` bytes starting at `offset` to `0xFF`.
    fn erase_block(&mut self, offset: u32, size: u32) -> Result<(), Error>;

    /// Flushes buffered writes, if the medium buffers them.
    fn commit(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<T: Medium> Medium for &mut T {
    fn write_semantics(&self) -> WriteSemantics {
        T::write_semantics(self)
    }

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        T::read(self, offset, bytes)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        T::write(self, offset, bytes)
    }

    fn erase_block(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        T::erase_block(self, offset, size)
    }

    fn commit(&mut self) -> Result<(), Error> {
        T::commit(self)
    }
}

fn check_bounds(offset: u32, len: usize, capacity: usize) -> Result<(), Error> {
    match (offset as usize).checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(Error::OutOfBounds),
    }
}

pub trait AlignedOps: NorFlash {
    fn align_read_ceil(size: usize) -> usize {
        align_ceil(size, Self::READ_SIZE)
    }

    fn align_read_floor(size: usize) -> usize {
        align_floor(size, Self::READ_SIZE)
    }

    fn align_write_ceil(size: usize) -> usize {
        align_ceil(size, Self::WRITE_SIZE)
    }

    fn align_write_floor(size: usize) -> usize {
        align_floor(size, Self::WRITE_SIZE)
    }
}

#[inline(always)]
const fn align_ceil(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size.saturating_add(alignment - 1) & !(alignment - 1)
    } else {
        size.saturating_add(alignment - 1) / alignment * alignment
    }
}

#[inline(always)]
const fn align_floor(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size & !(alignment - 1)
    } else {
        size / alignment * alignment
    }
}

impl<T: NorFlash> AlignedOps for T {}

/// Adapts a NOR flash driver to [`Medium`].
///
/// Unaligned writes are padded with `0xFF` on both ends. Programming ones leaves the flash
/// untouched, so neighbouring bytes keep their content.
pub struct NorFlashMedium<F: NorFlash> {
    flash: F,
}

impl<F: NorFlash> NorFlashMedium<F> {
    pub fn new(flash: F) -> Self {
        Self { flash }
    }

    pub fn get_ref(&self) -> &F {
        &self.flash
    }

    pub fn get_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }
}

impl<F: NorFlash> Medium for NorFlashMedium<F> {
    fn write_semantics(&self) -> WriteSemantics {
        WriteSemantics::ClearBitsOnly
    }

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        check_bounds(offset, bytes.len(), self.flash.capacity())?;
        if bytes.is_empty() {
            return Ok(());
        }

        let start = F::align_read_floor(offset as usize);
        let end = F::align_read_ceil(offset as usize + bytes.len());
        if start == offset as usize && end == start + bytes.len() {
            return self
                .flash
                .read(offset, bytes)
                .map_err(|_| Error::MediumError);
        }

        trace!("unaligned read @{:#x}: [{}]", offset, bytes.len());
        let mut buf = vec![0u8; end - start];
        self.flash
            .read(start as u32, &mut buf)
            .map_err(|_| Error::MediumError)?;
        let skip = offset as usize - start;
        bytes.copy_from_slice(&buf[skip..skip + bytes.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        check_bounds(offset, bytes.len(), self.flash.capacity())?;
        if bytes.is_empty() {
            return Ok(());
        }

        let start = F::align_write_floor(offset as usize);
        let end = F::align_write_ceil(offset as usize + bytes.len());
        if start == offset as usize && end == start + bytes.len() {
            return self
                .flash
                .write(offset, bytes)
                .map_err(|_| Error::MediumError);
        }

        trace!("unaligned write @{:#x}: [{}]", offset, bytes.len());
        let mut buf = vec![0xFFu8; end - start];
        let skip = offset as usize - start;
        buf[skip..skip + bytes.len()].copy_from_slice(bytes);
        self.flash
            .write(start as u32, &buf)
            .map_err(|_| Error::MediumError)
    }

    fn erase_block(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        check_bounds(offset, size as usize, self.flash.capacity())?;
        if !(offset as usize).is_multiple_of(F::ERASE_SIZE)
            || !(size as usize).is_multiple_of(F::ERASE_SIZE)
        {
            return Err(Error::OutOfBounds);
        }

        self.flash
            .erase(offset, offset + size)
            .map_err(|_| Error::MediumError)
    }
}

/// Adapts a random access storage driver (EEPROM, FRAM, emulated EEPROM) to [`Medium`].
pub struct EepromMedium<S: Storage> {
    storage: S,
}

impl<S: Storage> EepromMedium<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn get_ref(&self) -> &S {
        &self.storage
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_inner(self) -> S {
        self.storage
    }
}

impl<S: Storage> Medium for EepromMedium<S> {
    fn write_semantics(&self) -> WriteSemantics {
        WriteSemantics::Overwrite
    }

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        check_bounds(offset, bytes.len(), self.storage.capacity())?;
        ReadStorage::read(&mut self.storage, offset, bytes).map_err(|_| Error::MediumError)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        check_bounds(offset, bytes.len(), self.storage.capacity())?;
        Storage::write(&mut self.storage, offset, bytes).map_err(|_| Error::MediumError)
    }

    fn erase_block(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        check_bounds(offset, size as usize, self.storage.capacity())?;
        let ones = vec![0xFFu8; size as usize];
        Storage::write(&mut self.storage, offset, &ones).map_err(|_| Error::MediumError)
    }
}

#[cfg(any(
    feature = "esp32",
    feature = "esp32s2",
    feature = "esp32s3",
    feature = "esp32c2",
    feature = "esp32c3",
    feature = "esp32c6",
    feature = "esp32h2",
))]
mod chip {
    use super::NorFlashMedium;
    use crate::schedule::Clock;
    use esp_storage::FlashStorage;

    /// The internal SPI flash of the chip.
    pub type EspFlashMedium<'d> = NorFlashMedium<FlashStorage<'d>>;

    /// Milliseconds since boot from the system timer.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct EspClock;

    impl Clock for EspClock {
        fn now_ms(&self) -> u64 {
            esp_hal::time::Instant::now()
                .duration_since_epoch()
                .as_millis()
        }
    }
}

#[cfg(any(
    feature = "esp32",
    feature = "esp32s2",
    feature = "esp32s3",
    feature = "esp32c2",
    feature = "esp32c3",
    feature = "esp32c6",
    feature = "esp32h2",
))]
pub use chip::*;
