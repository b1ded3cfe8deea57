//! Device name → entity lookup table.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Owns exactly one entity per device name.
///
/// `resolve` holds the shard lock across lookup and insert, so concurrent
/// callers racing on a new name see a single creation between them.
pub struct EntityDirectory<E> {
    entries: DashMap<String, Arc<E>>,
}

impl<E> EntityDirectory<E> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Existing entity for `device_name`, or a new one built by `factory`.
    /// The flag is true only for the call that created it.
    pub fn resolve<F>(&self, device_name: &str, factory: F) -> (Arc<E>, bool)
    where
        F: FnOnce(&str) -> E,
    {
        match self.entries.entry(device_name.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let entity = Arc::new(factory(device_name));
                entry.insert(entity.clone());
                (entity, true)
            }
        }
    }

    pub fn get(&self, device_name: &str) -> Option<Arc<E>> {
        self.entries.get(device_name).map(|e| e.value().clone())
    }

    /// Known device names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl<E> Default for EntityDirectory<E> {
    fn default() -> Self {
        Self::new()
    }
}
