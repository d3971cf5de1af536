//! Device Registry
//!
//! Ordered collection of devices keyed by serial number. Discovery lists are
//! ranked by descending RSSI; connected lists keep arrival order.

use crate::infrastructure::bluetooth::transport::PeripheralId;

/// RSSI reported when the radio could not measure it.
pub const UNKNOWN_RSSI: i16 = 127;

/// Something the registry can hold
pub trait RegistryEntry {
    fn serial(&self) -> &str;
    fn peripheral_id(&self) -> &PeripheralId;
    fn rssi(&self) -> i16;
}

#[derive(Debug)]
pub struct DeviceRegistry<T> {
    items: Vec<T>,
    sort_by_rssi: bool,
}

impl<T: RegistryEntry> DeviceRegistry<T> {
    pub fn new(sort_by_rssi: bool) -> Self {
        Self {
            items: Vec::new(),
            sort_by_rssi,
        }
    }

    /// Add `item`, replacing an entry with the same serial.
    ///
    /// A replacement whose RSSI changed is re-ranked; otherwise it keeps its
    /// position. Returns the resulting index.
    pub fn upsert(&mut self, item: T) -> usize {
        if let Some(index) = self.index_of(item.serial()) {
            if self.items[index].rssi() == item.rssi() {
                self.items[index] = item;
                return index;
            }
            self.items.remove(index);
        }
        self.insert_ranked(item)
    }

    fn insert_ranked(&mut self, item: T) -> usize {
        if self.sort_by_rssi && item.rssi() != UNKNOWN_RSSI {
            let rssi = item.rssi();
            let position = self
                .items
                .iter()
                .position(|existing| existing.rssi() == UNKNOWN_RSSI || rssi > existing.rssi());
            if let Some(index) = position {
                self.items.insert(index, item);
                return index;
            }
        }
        self.items.push(item);
        self.items.len() - 1
    }

    /// Case-insensitive serial lookup.
    pub fn index_of(&self, serial: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.serial().eq_ignore_ascii_case(serial))
    }

    pub fn get(&self, serial: &str) -> Option<&T> {
        self.index_of(serial).map(|index| &self.items[index])
    }

    pub fn get_mut(&mut self, serial: &str) -> Option<&mut T> {
        self.index_of(serial).map(|index| &mut self.items[index])
    }

    pub fn get_by_peripheral(&self, id: &PeripheralId) -> Option<&T> {
        self.items.iter().find(|item| item.peripheral_id() == id)
    }

    pub fn get_by_peripheral_mut(&mut self, id: &PeripheralId) -> Option<&mut T> {
        self.items.iter_mut().find(|item| item.peripheral_id() == id)
    }

    pub fn remove(&mut self, serial: &str) -> Option<(usize, T)> {
        let index = self.index_of(serial)?;
        Some((index, self.items.remove(index)))
    }

    pub fn remove_by_peripheral(&mut self, id: &PeripheralId) -> Option<T> {
        let index = self.items.iter().position(|item| item.peripheral_id() == id)?;
        Some(self.items.remove(index))
    }

    /// Out-of-range indices are ignored.
    pub fn remove_at(&mut self, index: usize) -> Option<T> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }
}

impl<T: RegistryEntry> Default for DeviceRegistry<T> {
    fn default() -> Self {
        Self::new(true)
    }
}

impl<'a, T: RegistryEntry> IntoIterator for &'a DeviceRegistry<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
