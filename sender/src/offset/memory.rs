use super::{Store, ZERO};
use crate::Error;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

/// In-memory offset store.
///
/// Clones share the same records, so a test (or another node) can observe and
/// overwrite the offsets a sender consumes.
#[derive(Clone, Default)]
pub struct Memory {
    records: Arc<Mutex<BTreeMap<u32, String>>>,
}

impl Memory {
    /// Overwrite the record for node `id` with `raw`.
    pub fn write(&self, id: u32, raw: impl Into<String>) {
        self.records.lock().unwrap().insert(id, raw.into());
    }

    /// Returns the record for node `id`, if any.
    pub fn get(&self, id: u32) -> Option<String> {
        self.records.lock().unwrap().get(&id).cloned()
    }
}

impl Store for Memory {
    fn read(&mut self, id: u32) -> Result<Option<String>, Error> {
        Ok(self.get(id))
    }

    fn init(&mut self, id: u32) -> Result<(), Error> {
        self.write(id, ZERO);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_record() {
        let mut store = Memory::default();
        assert_eq!(store.read(1).unwrap(), None);
    }

    #[test]
    fn test_init_overwrites() {
        let mut store = Memory::default();
        store.write(1, "5");
        assert_eq!(store.read(1).unwrap().as_deref(), Some("5"));
        store.init(1).unwrap();
        assert_eq!(store.read(1).unwrap().as_deref(), Some(ZERO));
    }

    #[test]
    fn test_clones_share_records() {
        let mut store = Memory::default();
        let observer = store.clone();
        store.init(2).unwrap();
        observer.write(3, "7");
        assert_eq!(observer.get(2).as_deref(), Some(ZERO));
        assert_eq!(store.read(3).unwrap().as_deref(), Some("7"));
        assert_eq!(store.read(4).unwrap(), None);
    }
}
