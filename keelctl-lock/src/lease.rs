//! Lease lock: owner-tagged, TTL-bounded keys with background renewal.
//!
//! Acquisition is a single `SET NX PX`; contention is a normal outcome, not
//! an error. Release and renewal only act while the stored value is still
//! ours. A lease whose renewal fails three times in a row is considered lost
//! and stops renewing, but the task holding it keeps running.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use keelctl_core::{Error, LockSettings, Operation, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::owner::OwnerId;
use crate::store::KvStore;

pub const MIN_TTL: Duration = Duration::from_secs(5);
pub const MAX_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);
pub const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);
/// Consecutive renewal failures after which a lease is given up.
pub const MAX_RENEW_FAILURES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseOptions {
    pub ttl: Duration,
    pub auto_renew: bool,
    /// Fraction of the TTL between renewals.
    pub renew_ratio: f64,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            auto_renew: true,
            renew_ratio: 0.5,
        }
    }
}

impl LeaseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &LockSettings) -> Self {
        Self {
            ttl: Duration::from_millis(settings.ttl_ms),
            auto_renew: settings.auto_renew,
            renew_ratio: settings.renew_ratio,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn auto_renew(mut self, enabled: bool) -> Self {
        self.auto_renew = enabled;
        self
    }

    pub fn renew_ratio(mut self, ratio: f64) -> Self {
        self.renew_ratio = ratio;
        self
    }

    /// TTL clamped to 5s..=600s.
    pub fn effective_ttl(&self) -> Duration {
        self.ttl.clamp(MIN_TTL, MAX_TTL)
    }

    /// `max(1s, ttl * ratio)`, with the ratio kept inside (0, 1).
    pub fn renew_interval(&self) -> Duration {
        let ratio = if self.renew_ratio.is_finite() {
            self.renew_ratio.clamp(0.05, 0.95)
        } else {
            0.5
        };
        self.effective_ttl()
            .mul_f64(ratio)
            .max(MIN_RENEW_INTERVAL)
    }
}

/// A held lease. Cloning shares the lost flag.
#[derive(Debug, Clone)]
pub struct Lease {
    key: String,
    store_key: String,
    value: String,
    ttl: Duration,
    acquired_at: DateTime<Utc>,
    lost: Arc<AtomicBool>,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Key as stored in the cache, prefix included.
    pub fn store_key(&self) -> &str {
        &self.store_key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// True once renewal has given up on this lease.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

/// Outcome of [`LeaseLock::safe_run`].
#[derive(Debug, PartialEq, Eq)]
pub enum Acquired<T> {
    Ran(T),
    NotAcquired,
}

impl<T> Acquired<T> {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Acquired::Ran(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Acquired::Ran(value) => Some(value),
            Acquired::NotAcquired => None,
        }
    }
}

struct Tracked {
    value: String,
    store_key: String,
    renewal: Option<JoinHandle<()>>,
}

impl Tracked {
    fn stop_renewal(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

type LeaseMap = Arc<Mutex<HashMap<String, Tracked>>>;

fn leases(map: &LeaseMap) -> std::sync::MutexGuard<'_, HashMap<String, Tracked>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Distributed mutex over a [`KvStore`].
pub struct LeaseLock {
    store: Arc<dyn KvStore>,
    owner: OwnerId,
    key_prefix: String,
    defaults: LeaseOptions,
    leases: LeaseMap,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_settings(store, &LockSettings::default())
    }

    pub fn with_settings(store: Arc<dyn KvStore>, settings: &LockSettings) -> Self {
        Self {
            store,
            owner: OwnerId::generate(),
            key_prefix: settings.key_prefix.clone(),
            defaults: LeaseOptions::from_settings(settings),
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Default options for this lock, as configured.
    pub fn defaults(&self) -> &LeaseOptions {
        &self.defaults
    }

    /// Number of leases this instance currently tracks.
    pub fn tracked(&self) -> usize {
        leases(&self.leases).len()
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// One non-blocking acquisition attempt. `None` means another owner
    /// holds the key.
    pub async fn try_acquire(&self, key: &str, options: &LeaseOptions) -> Result<Option<Lease>> {
        let store_key = self.store_key(key);
        let value = self.owner.lease_value();
        let ttl = options.effective_ttl();

        let acquired = self
            .store
            .set_nx_px(&store_key, &value, ttl)
            .await
            .map_err(|e| e.at(Operation::Acquire, &store_key))?;
        if !acquired {
            debug!(key = %store_key, "lock contended");
            return Ok(None);
        }

        let lease = Lease {
            key: key.to_string(),
            store_key: store_key.clone(),
            value: value.clone(),
            ttl,
            acquired_at: Utc::now(),
            lost: Arc::new(AtomicBool::new(false)),
        };
        let renewal = options
            .auto_renew
            .then(|| self.spawn_renewal(&lease, options.renew_interval()));

        let previous = leases(&self.leases).insert(
            store_key.clone(),
            Tracked {
                value,
                store_key: store_key.clone(),
                renewal,
            },
        );
        if let Some(mut stale) = previous {
            stale.stop_renewal();
        }

        info!(key = %store_key, ttl_ms = ttl.as_millis() as u64, "lease acquired");
        Ok(Some(lease))
    }

    fn spawn_renewal(&self, lease: &Lease, every: Duration) -> JoinHandle<()> {
        let store = self.store.clone();
        let map = self.leases.clone();
        let key = lease.store_key.clone();
        let value = lease.value.clone();
        let ttl = lease.ttl;
        let lost = lease.lost.clone();

        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                tokio::time::sleep(every).await;
                match store.compare_and_pexpire(&key, &value, ttl).await {
                    Ok(true) => {
                        failures = 0;
                        debug!(key = %key, "lease renewed");
                    }
                    Ok(false) => {
                        failures += 1;
                        warn!(key = %key, failures, "lease renewal refused, key no longer ours");
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(key = %key, failures, error = %e, "lease renewal failed");
                    }
                }
                if failures >= MAX_RENEW_FAILURES {
                    lost.store(true, Ordering::SeqCst);
                    let mut map = leases(&map);
                    if map.get(&key).is_some_and(|t| t.value == value) {
                        map.remove(&key);
                    }
                    warn!(key = %key, "lease lost, renewal stopped");
                    return;
                }
            }
        })
    }

    /// Stop renewing and delete the key if it still holds our value.
    /// Returns whether the key was deleted.
    pub async fn release(&self, lease: &Lease) -> Result<bool> {
        {
            let mut map = leases(&self.leases);
            if map
                .get(&lease.store_key)
                .is_some_and(|t| t.value == lease.value)
            {
                if let Some(mut tracked) = map.remove(&lease.store_key) {
                    tracked.stop_renewal();
                }
            }
        }

        let deleted = self
            .store
            .compare_and_delete(&lease.store_key, &lease.value)
            .await
            .map_err(|e| e.at(Operation::Release, &lease.store_key))?;
        if deleted {
            info!(key = %lease.store_key, "lease released");
        } else {
            warn!(key = %lease.store_key, "lease already expired or taken over");
        }
        Ok(deleted)
    }

    /// True if this instance tracks `key` and the cache still holds our value.
    pub async fn is_held(&self, key: &str) -> Result<bool> {
        let store_key = self.store_key(key);
        let expected = match leases(&self.leases).get(&store_key) {
            Some(tracked) => tracked.value.clone(),
            None => return Ok(false),
        };
        let current = self
            .store
            .get(&store_key)
            .await
            .map_err(|e| e.at(Operation::Get, &store_key))?;
        Ok(current.as_deref() == Some(expected.as_str()))
    }

    /// Run `task` under `key` with the configured defaults.
    pub async fn run<T, E, F, Fut>(&self, key: &str, task: F) -> std::result::Result<Acquired<T>, E>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let options = self.defaults.clone();
        self.safe_run(key, &options, task).await
    }

    /// Acquire `key`, run `task`, then always stop renewal and release.
    ///
    /// Returns [`Acquired::NotAcquired`] without running `task` when the key
    /// is held elsewhere. A task error is returned after cleanup. A release
    /// failure is logged and does not replace the task's outcome; the key
    /// then expires on its own.
    pub async fn safe_run<T, E, F, Fut>(
        &self,
        key: &str,
        options: &LeaseOptions,
        task: F,
    ) -> std::result::Result<Acquired<T>, E>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let lease = match self.try_acquire(key, options).await? {
            Some(lease) => lease,
            None => return Ok(Acquired::NotAcquired),
        };

        let outcome = task(lease.clone()).await;

        if let Err(e) = self.release(&lease).await {
            warn!(key = %lease.store_key, error = %e, "release after task failed");
        }
        outcome.map(Acquired::Ran)
    }

    /// Force-release every tracked lease. Returns how many were deleted.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<Tracked> = leases(&self.leases).drain().map(|(_, t)| t).collect();
        if drained.is_empty() {
            return 0;
        }
        info!(count = drained.len(), "releasing leases on shutdown");

        let mut released = 0;
        for mut tracked in drained {
            tracked.stop_renewal();
            match self
                .store
                .compare_and_delete(&tracked.store_key, &tracked.value)
                .await
            {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %tracked.store_key, error = %e, "shutdown release failed"),
            }
        }
        released
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        for tracked in leases(&self.leases).values_mut() {
            tracked.stop_renewal();
        }
    }
}
