//! Process-wide handle registry.
//!
//! Maps a canonical key (connection identity, `db::table`) to one shared
//! handle. Creation is guarded per key so concurrent first uses build the
//! handle exactly once; a failed build leaves the slot empty for the next
//! caller to retry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

use crate::error::Result;

pub struct Registry<V> {
    slots: Mutex<HashMap<String, Arc<OnceCell<V>>>>,
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> Registry<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<OnceCell<V>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Return the handle for `key`, building it with `init` on first use.
    pub async fn get_or_try_init<F, Fut>(&self, key: &str, init: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let slot = self.slot(key);
        slot.get_or_try_init(init).await.cloned()
    }

    /// Synchronous variant for handles that are cheap to construct.
    pub fn get_or_insert_with(&self, key: &str, init: impl FnOnce() -> V) -> V {
        let slot = self.slot(key);
        if let Some(value) = slot.get() {
            return value.clone();
        }
        let value = init();
        match slot.set(value.clone()) {
            Ok(()) => value,
            // Lost the race: hand out the winner's handle.
            Err(_) => slot.get().cloned().unwrap_or(value),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).and_then(|slot| slot.get().cloned())
    }

    /// Initialized handles.
    pub fn values(&self) -> Vec<V> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter_map(|slot| slot.get().cloned()).collect()
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(key).and_then(|slot| slot.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
