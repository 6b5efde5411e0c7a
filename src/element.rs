use crate::error::Error;

/// Sequential access to the element state inside an active load or save.
pub trait StateIo {
    /// Appends `bytes` to the element state being saved.
    fn write_state(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Fills `bytes` with the next part of the element state being loaded.
    fn read_state(&mut self, bytes: &mut [u8]) -> Result<(), Error>;
}

/// A firmware element (relay, counter, thermostat, ...) with runtime state that survives a
/// reboot.
///
/// Elements must save and load exactly the same number of bytes in the same order. The total
/// length of all elements is verified by [`Storage::is_state_storage_valid`](crate::Storage).
pub trait StateElement {
    /// Channel number prefixed to the element state when channel tagging is enabled.
    fn channel_number(&self) -> Option<u8> {
        None
    }

    fn on_save_state(&self, io: &mut dyn StateIo) -> Result<(), Error>;

    fn on_load_state(&mut self, io: &mut dyn StateIo) -> Result<(), Error>;
}
