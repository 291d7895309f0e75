use log::{info, warn};

use crate::{
    devices::{DeviceModel, DeviceState},
    error::StorageError,
};

/// High nibble of the schema byte; the low nibble carries the layout version.
pub const SCHEMA_MARKER: u8 = 0xA0;
/// Schema byte plus device-kind tag.
pub const HEADER_LEN: usize = 2;

/// Byte-addressed non-volatile memory with an explicit commit, like the
/// emulated EEPROM on the ESP parts.
pub trait NvStore {
    fn capacity(&self) -> usize;
    fn read_byte(&self, offset: usize) -> u8;
    fn write_byte(&mut self, offset: usize, byte: u8);
    fn commit(&mut self) -> Result<(), StorageError>;
}

pub fn schema_byte(layout_version: u8) -> u8 {
    SCHEMA_MARKER | (layout_version & 0x0F)
}

#[derive(Debug)]
pub struct StatePersistence<S> {
    store: S,
}

impl<S: NvStore> StatePersistence<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Reads the record written by [`persist`](Self::persist). Blank memory,
    /// an older layout or another device type's record all yield defaults.
    pub fn restore<M: DeviceModel>(&self) -> M {
        let needed = HEADER_LEN + M::RECORD_LEN;
        if needed > self.store.capacity() {
            warn!(
                "{} record needs {needed} bytes, store holds {}; using defaults",
                M::KIND,
                self.store.capacity()
            );
            return M::default();
        }

        let schema = self.store.read_byte(0);
        let tag = self.store.read_byte(1);
        if schema != schema_byte(M::LAYOUT_VERSION) || tag != M::KIND.storage_tag() {
            warn!(
                "no valid {} record (schema {schema:#04x}, tag {tag:#04x}); using defaults",
                M::KIND
            );
            return M::default();
        }

        let record: Vec<u8> = (HEADER_LEN..needed)
            .map(|offset| self.store.read_byte(offset))
            .collect();
        let model = M::decode(&record);
        info!("restored {} state: {model:?}", M::KIND);
        model
    }

    /// Writes header and record, then commits. Bytes that already hold the
    /// right value are not rewritten. Clears the dirty flag only once the
    /// commit succeeds.
    pub fn persist<M: DeviceModel>(&mut self, state: &mut DeviceState<M>) -> Result<(), StorageError> {
        let needed = HEADER_LEN + M::RECORD_LEN;
        let capacity = self.store.capacity();
        if needed > capacity {
            return Err(StorageError::OutOfRange { needed, capacity });
        }

        let mut image = vec![0_u8; needed];
        image[0] = schema_byte(M::LAYOUT_VERSION);
        image[1] = M::KIND.storage_tag();
        state.model().encode(&mut image[HEADER_LEN..]);

        for (offset, byte) in image.into_iter().enumerate() {
            if self.store.read_byte(offset) != byte {
                self.store.write_byte(offset, byte);
            }
        }
        self.store.commit()?;
        state.clear_dirty();
        Ok(())
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}
