//! Persisting an observable through its change hook.
//!
//! [`ObservableBuilder::persisted`] seeds the initial value from a [`KeyValueStore`] and
//! saves every subsequent write back to it. Storage is best effort: a value that cannot
//! be loaded or decoded falls back to the builder's initial value, and a write that
//! cannot be encoded or saved is logged and skipped. Neither ever reaches the caller
//! of `set`/`update`/`mutate`.

use parking_lot::Mutex;
use parking_lot::lock_api::RawMutex;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    error::{PersistError, StoreError},
    observable::{ChangeHook, ObservableBuilder},
};

pub trait KeyValueStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn save(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> { (**self).load(key) }
    fn save(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> { (**self).save(key, bytes) }
}

/// In-process store, mostly for tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, key: impl Into<String>, bytes: Vec<u8>) { self.entries.lock().insert(key.into(), bytes); }

    pub fn bytes(&self, key: &str) -> Option<Vec<u8>> { self.entries.lock().get(key).cloned() }

    pub fn len(&self) -> usize { self.entries.lock().len() }

    pub fn is_empty(&self) -> bool { self.entries.lock().is_empty() }
}

impl KeyValueStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> { Ok(self.bytes(key)) }

    fn save(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.insert(key, bytes);
        Ok(())
    }
}

/// Read and decode the value stored under `key`
pub fn load<T, S>(store: &S, key: &str) -> Result<Option<T>, PersistError>
where
    T: DeserializeOwned,
    S: KeyValueStore + ?Sized,
{
    match store.load(key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(PersistError::Decode)?)),
        None => Ok(None),
    }
}

/// Encode and store `value` under `key`
pub fn save<T, S>(store: &S, key: &str, value: &T) -> Result<(), PersistError>
where
    T: Serialize,
    S: KeyValueStore + ?Sized,
{
    let bytes = bincode::serialize(value).map_err(PersistError::Encode)?;
    store.save(key, bytes)?;
    Ok(())
}

struct PersistHook<S> {
    store: S,
    key: String,
}

impl<T: Serialize, S: KeyValueStore> ChangeHook<T> for PersistHook<S> {
    fn changed(&self, value: &T) {
        if let Err(e) = save(&self.store, &self.key, value) {
            warn!("failed to persist {}: {}", self.key, e);
        }
    }
}

impl<T, R> ObservableBuilder<T, R>
where
    T: Serialize + DeserializeOwned + 'static,
    R: RawMutex,
{
    /// Start from the value stored under `key`, if there is a readable one, and save
    /// every change back to `store`
    pub fn persisted<S: KeyValueStore + 'static>(mut self, store: S, key: impl Into<String>) -> Self {
        let key = key.into();
        match load::<T, _>(&store, &key) {
            Ok(Some(value)) => {
                debug!("loaded persisted value for {}", key);
                *self.initial_mut() = value;
            }
            Ok(None) => debug!("no persisted value for {}; using initial", key),
            Err(e) => warn!("could not load persisted value for {}; using initial: {}", key, e),
        }
        self.on_change(PersistHook { store, key })
    }
}
