#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use core::ops::Range;
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use embedded_storage::{ReadStorage, Storage as RandomAccessStorage};
use supla_storage::error::Error;
use supla_storage::platform::Medium;
use supla_storage::schedule::Clock;
use supla_storage::{StateElement, StateIo, Storage};

pub const FLASH_SECTOR_SIZE: usize = 4096;
// Taken from https://github.com/esp-rs/esp-hal/blob/main/esp-storage/src/stub.rs
pub const WORD_SIZE: usize = 4;

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

fn count_modifications(operations: &[Operation]) -> usize {
    operations
        .iter()
        .filter(|op| matches!(op, Operation::Write { .. } | Operation::Erase { .. }))
        .count()
}

/// NOR flash: writes can only clear bits, erase works on whole sectors.
#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
    /// Power is lost right after this many further erases
    pub power_cut_after_erases: Option<usize>,
    /// Cells in this range never get programmed
    pub stuck_at_ones: Option<Range<u32>>,
}

impl Flash {
    pub fn new(sectors: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * sectors],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
        self.power_cut_after_erases = None;
        self.stuck_at_ones = None;
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn modifications(&self) -> usize {
        count_modifications(&self.operations)
    }

    fn fault(&self) -> bool {
        self.operations.len() >= self.fail_after_operation
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = WORD_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::READ_SIZE));

        if self.fault() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = WORD_SIZE;

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        if self.fault() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }

        if let Some(remaining) = self.power_cut_after_erases.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.fail_after_operation = self.operations.len();
            }
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE));
        assert!(!bytes.is_empty());

        if self.fault() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        for (i, &val) in bytes.iter().enumerate() {
            let addr = offset + i as u32;
            if self
                .stuck_at_ones
                .as_ref()
                .is_some_and(|stuck| stuck.contains(&addr))
            {
                continue;
            }
            // flash can only flip bits from 1 to 0
            self.buf[addr as usize] &= val;
        }
        Ok(())
    }
}

/// Byte addressable EEPROM, writes replace the content.
#[derive(Default)]
pub struct Eeprom {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
    /// Power is lost on the first write touching this address
    pub fail_on_write_to: Option<u32>,
}

impl Eeprom {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0xffu8; size],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
        self.fail_on_write_to = None;
    }

    pub fn modifications(&self) -> usize {
        count_modifications(&self.operations)
    }

    /// Number of writes starting at `offset`.
    pub fn writes_at(&self, offset: u32) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { offset: o, .. } if *o == offset))
            .count()
    }

    fn fault(&self) -> bool {
        self.operations.len() >= self.fail_after_operation
    }
}

impl ReadStorage for Eeprom {
    type Error = FlashError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if self.fault() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl RandomAccessStorage for Eeprom {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let range = offset..offset + bytes.len() as u32;
        if self
            .fail_on_write_to
            .is_some_and(|addr| range.contains(&addr))
        {
            self.fail_after_operation = self.operations.len();
        }
        if self.fault() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// Element with a single `i32` of state.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TestElement {
    pub value: i32,
    pub channel: Option<u8>,
}

impl TestElement {
    pub fn new(value: i32) -> Self {
        Self {
            value,
            channel: None,
        }
    }

    pub fn with_channel(value: i32, channel: u8) -> Self {
        Self {
            value,
            channel: Some(channel),
        }
    }
}

impl StateElement for TestElement {
    fn channel_number(&self) -> Option<u8> {
        self.channel
    }

    fn on_save_state(&self, io: &mut dyn StateIo) -> Result<(), Error> {
        io.write_state(&self.value.to_le_bytes())
    }

    fn on_load_state(&mut self, io: &mut dyn StateIo) -> Result<(), Error> {
        let mut buf = [0u8; 4];
        io.read_state(&mut buf)?;
        self.value = i32::from_le_bytes(buf);
        Ok(())
    }
}

pub struct ManualClock(pub u64);

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0
    }
}

/// Saves the way the firmware does it: a size check first, then the save itself.
pub fn save<M: Medium>(
    storage: &mut Storage<M>,
    elements: &[&dyn StateElement],
) -> Result<(), Error> {
    storage.is_state_storage_valid(elements);
    storage.write_state_storage(elements)
}
