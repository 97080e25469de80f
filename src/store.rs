//! Persisted device state
//!
//! One byte per key in a small non-volatile store. Erased cells read as
//! `0xFF` and are reported as unset.

use embedded_storage::Storage;

/// Values kept across power cycles
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub enum StoreKey {
    /// Emulation mode selected at the last boot
    Mode,
    /// Head position of a nibble drive at the last eject
    Track(u8),
}

impl StoreKey {
    pub const fn offset(&self) -> u32 {
        match self {
            StoreKey::Mode => 1,
            StoreKey::Track(d) => 2 + *d as u32,
        }
    }
}

const ERASED: u8 = 0xFF;

/// Key/value store loaded at boot and written back at well-defined points
pub trait PersistentStore {
    fn load(&mut self, key: StoreKey) -> Option<u8>;

    fn store(&mut self, key: StoreKey, value: u8);
}

/// [`PersistentStore`] over any `embedded-storage` device
pub struct NvStore<S> {
    storage: S,
}

impl <S: Storage> NvStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn into_inner(self) -> S {
        self.storage
    }
}

impl <S: Storage> PersistentStore for NvStore<S> {
    fn load(&mut self, key: StoreKey) -> Option<u8> {
        let mut b = [ERASED];
        if self.storage.read(key.offset(), &mut b).is_err() {
            crate::warn!("Store read of {:?} failed", key);
            return None;
        }
        match b[0] {
            ERASED => None,
            v => Some(v),
        }
    }

    fn store(&mut self, key: StoreKey, value: u8) {
        // Skip the write when nothing changed
        if self.load(key) == Some(value) {
            return;
        }
        if self.storage.write(key.offset(), &[value]).is_err() {
            crate::warn!("Store write of {:?} failed", key);
        }
    }
}
