//! In-process [`KvStore`] for single-node use and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use keelctl_core::{Error, Result};
use tokio::time::Instant;

use crate::store::KvStore;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Expiring string map. Time follows the tokio clock, so paused-time tests
/// see keys expire.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    failures: AtomicU32,
    lost_replies: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with a connectivity error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` `set_nx_px` writes, then answer each with a
    /// connectivity error as if the reply was lost on the wire.
    pub fn lose_next_replies(&self, n: u32) {
        self.lost_replies.store(n, Ordering::SeqCst);
    }

    /// Overwrite `key` regardless of its current owner.
    pub fn force_set(&self, key: &str, value: &str, ttl: Duration) {
        self.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Remaining TTL of a live key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.expires_at - now)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_fault(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(Error::connectivity("connection reset by peer")),
            Err(_) => Ok(()),
        }
    }

    fn check_lost_reply(&self) -> Result<()> {
        let lost = self
            .lost_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match lost {
            Ok(_) => Err(Error::connectivity("read ECONNRESET")),
            Err(_) => Ok(()),
        }
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        let now = Instant::now();
        match entries.get(key) {
            Some(e) if e.expires_at > now => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_fault()?;
        let mut entries = self.lock();
        if Self::live_value(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        drop(entries);
        self.check_lost_reply()?;
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.check_fault()?;
        let mut entries = self.lock();
        if Self::live_value(&mut entries, key).as_deref() == Some(expected) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn compare_and_pexpire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.check_fault()?;
        let mut entries = self.lock();
        if Self::live_value(&mut entries, key).as_deref() != Some(expected) {
            return Ok(false);
        }
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Instant::now() + ttl;
        }
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_fault()?;
        Ok(Self::live_value(&mut self.lock(), key))
    }

    async fn ping(&self) -> Result<()> {
        self.check_fault()
    }
}
