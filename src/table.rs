//! Keyed descriptor tables with a mutable RAM list and a frozen flash list.
//!
//! Lookups probe the RAM list first so late-loaded entries shadow flashed
//! ones, then binary-search the frozen list. Freezing serializes every RAM
//! entry in insertion order into flash and moves it to the frozen list;
//! frozen entries are immutable.

use crate::error::EngineFault;
use crate::flash::{FlashError, FlashMemoryManager, FlashStorage, ImageReader};

use itertools::Itertools;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// An entry that can live in a [`SortedTable`] and be frozen to flash.
pub trait TableEntry: Sized {
    /// Whether the frozen list must be strictly key-ascending. Clause
    /// tables carry several entries per method and relax this to
    /// non-strict ordering.
    const UNIQUE_KEYS: bool = true;

    /// The lookup key.
    fn key(&self) -> u32;

    /// Serialize this entry for the flash image.
    fn write_to(&self, out: &mut Vec<u8>);

    /// Decode one entry from the flash image.
    fn read_from(reader: &mut ImageReader<'_>) -> Result<Self, EngineFault>;
}

impl<T: TableEntry> TableEntry for Arc<T> {
    const UNIQUE_KEYS: bool = T::UNIQUE_KEYS;

    fn key(&self) -> u32 {
        self.as_ref().key()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.as_ref().write_to(out)
    }

    fn read_from(reader: &mut ImageReader<'_>) -> Result<Self, EngineFault> {
        T::read_from(reader).map(Arc::new)
    }
}

/// Freeze failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FreezeError {
    /// The flash allocation or write failed.
    #[error(transparent)]
    Flash(#[from] FlashError),
    /// The entries are not key-sorted, which would break binary search.
    #[error("table entries out of order")]
    OutOfOrder,
}

/// A keyed container with a RAM list and a frozen flash list.
#[derive(Debug)]
pub struct SortedTable<T> {
    ram: Vec<T>,
    frozen: Vec<T>,
}

impl<T> Default for SortedTable<T> {
    fn default() -> Self {
        Self {
            ram: Vec::new(),
            frozen: Vec::new(),
        }
    }
}

impl<T: TableEntry> SortedTable<T> {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries across both lists.
    pub fn len(&self) -> usize {
        self.ram.len() + self.frozen.len()
    }

    /// True when both lists are empty.
    pub fn is_empty(&self) -> bool {
        self.ram.is_empty() && self.frozen.is_empty()
    }

    /// Append an entry to the RAM list.
    pub fn insert(&mut self, entry: T) {
        self.ram.push(entry);
    }

    /// Find the entry for `key`: linear probe of the RAM list, then binary
    /// search of the frozen list.
    pub fn get_by_key(&self, key: u32) -> Option<&T> {
        if let Some(entry) = self.ram.iter().find(|e| e.key() == key) {
            return Some(entry);
        }
        let idx = self.frozen.partition_point(|e| e.key() < key);
        self.frozen.get(idx).filter(|e| e.key() == key)
    }

    /// Mutable access to a RAM entry. Frozen entries are immutable.
    pub fn get_mut_by_key(&mut self, key: u32) -> Option<&mut T> {
        self.ram.iter_mut().find(|e| e.key() == key)
    }

    /// All entries for `key`, RAM first, preserving insertion order. Used
    /// by tables that allow several entries per key.
    pub fn entries_for_key(&self, key: u32) -> impl Iterator<Item = &T> {
        let start = self.frozen.partition_point(|e| e.key() < key);
        let frozen = self.frozen[start..]
            .iter()
            .take_while(move |e| e.key() == key);
        self.ram.iter().filter(move |e| e.key() == key).chain(frozen)
    }

    /// Iterate every entry, RAM first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.ram.iter().chain(self.frozen.iter())
    }

    /// Drop the RAM list, and the frozen list as well when
    /// `including_flash` is set (the caller is responsible for erasing the
    /// flash partition itself).
    pub fn clear(&mut self, including_flash: bool) {
        self.ram.clear();
        if including_flash {
            self.frozen.clear();
        }
    }

    /// Drop the frozen mirror only, as an `EraseFlash` does; RAM entries
    /// stay loadable for a subsequent freeze.
    pub fn clear_frozen(&mut self) {
        self.frozen.clear();
    }

    /// Check the frozen-list ordering invariant that binary search relies
    /// on.
    pub fn validate_order(&self) -> Result<(), FreezeError> {
        let ordered = self
            .frozen
            .iter()
            .tuple_windows()
            .all(|(a, b)| if T::UNIQUE_KEYS { a.key() < b.key() } else { a.key() <= b.key() });
        if ordered {
            Ok(())
        } else {
            Err(FreezeError::OutOfOrder)
        }
    }

    /// Freeze every RAM entry in insertion order. Afterwards the RAM list
    /// is empty and the entries are reachable only through the frozen list,
    /// whose serialized form is committed at the returned flash offset.
    pub fn copy_to_flash<F: FlashStorage>(
        &mut self,
        flash: &mut FlashMemoryManager<F>,
        usage: &'static str,
    ) -> Result<u32, FreezeError> {
        self.frozen.append(&mut self.ram);
        self.validate_order()?;

        let mut staging = Vec::new();
        staging.extend_from_slice(&(self.frozen.len() as u32).to_le_bytes());
        for entry in &self.frozen {
            entry.write_to(&mut staging);
        }

        let offset = flash.flash_alloc(staging.len())?;
        flash.copy_to_flash(&staging, offset, usage)?;
        debug!(usage, entries = self.frozen.len(), offset, "table frozen");
        Ok(offset)
    }

    /// Rebuild the frozen list from a flash image region.
    pub fn load_from_flash(&mut self, mut reader: ImageReader<'_>) -> Result<(), EngineFault> {
        let count = reader.read_u32()? as usize;
        let mut frozen = Vec::with_capacity(count);
        for _ in 0..count {
            frozen.push(T::read_from(&mut reader)?);
        }
        self.frozen = frozen;
        self.validate_order()
            .map_err(|_| EngineFault::FlashCorruption("frozen table out of order"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::SimFlashStorage;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Entry {
        key: u32,
        payload: u32,
    }

    impl TableEntry for Entry {
        fn key(&self) -> u32 {
            self.key
        }

        fn write_to(&self, out: &mut Vec<u8>) {
            out.extend_from_slice(&self.key.to_le_bytes());
            out.extend_from_slice(&self.payload.to_le_bytes());
        }

        fn read_from(reader: &mut ImageReader<'_>) -> Result<Self, EngineFault> {
            Ok(Self {
                key: reader.read_u32()?,
                payload: reader.read_u32()?,
            })
        }
    }

    fn flash() -> FlashMemoryManager<SimFlashStorage> {
        let mut flash = FlashMemoryManager::new(SimFlashStorage::new(16 * 1024, 512));
        flash.clear().unwrap();
        flash
    }

    #[test]
    fn ram_lookup_before_and_after_freeze() {
        let mut table = SortedTable::new();
        for key in [1u32, 5, 9] {
            table.insert(Entry { key, payload: key * 10 });
        }
        assert_eq!(table.get_by_key(5).unwrap().payload, 50);
        assert!(table.get_by_key(4).is_none());

        let mut flash = flash();
        table.copy_to_flash(&mut flash, "test").unwrap();
        assert_eq!(table.ram.len(), 0);
        assert_eq!(table.get_by_key(5).unwrap().payload, 50);
        assert_eq!(table.get_by_key(9).unwrap().payload, 90);
        assert!(table.get_by_key(2).is_none());
    }

    #[test]
    fn frozen_entries_round_trip_byte_equal() {
        let mut table = SortedTable::new();
        let originals: Vec<_> = (0..8u32).map(|k| Entry { key: k * 2, payload: k + 100 }).collect();
        for e in &originals {
            table.insert(e.clone());
        }
        let mut flash = flash();
        let root = table.copy_to_flash(&mut flash, "test").unwrap();

        let mut reloaded = SortedTable::<Entry>::new();
        reloaded.load_from_flash(flash.reader_at(root)).unwrap();
        for e in &originals {
            assert_eq!(reloaded.get_by_key(e.key), Some(e));
        }
    }

    #[test]
    fn out_of_order_freeze_is_rejected() {
        let mut table = SortedTable::new();
        table.insert(Entry { key: 5, payload: 0 });
        table.insert(Entry { key: 3, payload: 0 });
        let mut flash = flash();
        assert_eq!(
            table.copy_to_flash(&mut flash, "test"),
            Err(FreezeError::OutOfOrder)
        );
    }

    #[test]
    fn late_inserts_shadow_frozen_entries() {
        let mut table = SortedTable::new();
        table.insert(Entry { key: 7, payload: 1 });
        let mut flash = flash();
        table.copy_to_flash(&mut flash, "test").unwrap();
        table.insert(Entry { key: 7, payload: 2 });
        assert_eq!(table.get_by_key(7).unwrap().payload, 2);
    }

    #[derive(Debug, Clone)]
    struct MultiEntry(u32, u32);

    impl TableEntry for MultiEntry {
        const UNIQUE_KEYS: bool = false;

        fn key(&self) -> u32 {
            self.0
        }

        fn write_to(&self, out: &mut Vec<u8>) {
            out.extend_from_slice(&self.0.to_le_bytes());
            out.extend_from_slice(&self.1.to_le_bytes());
        }

        fn read_from(reader: &mut ImageReader<'_>) -> Result<Self, EngineFault> {
            Ok(Self(reader.read_u32()?, reader.read_u32()?))
        }
    }

    #[test]
    fn duplicate_keys_enumerate_in_order() {
        let mut table = SortedTable::new();
        table.insert(MultiEntry(4, 0));
        table.insert(MultiEntry(4, 1));
        table.insert(MultiEntry(9, 2));
        let mut flash = flash();
        table.copy_to_flash(&mut flash, "test").unwrap();
        table.insert(MultiEntry(4, 3));

        let seen: Vec<u32> = table.entries_for_key(4).map(|e| e.1).collect();
        assert_eq!(seen, vec![3, 0, 1]);
    }
}
