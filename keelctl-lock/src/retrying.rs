//! Retry decorator for any [`KvStore`].

use std::time::Duration;

use async_trait::async_trait;
use keelctl_core::{Operation, Result, RetryPolicy};

use crate::store::KvStore;

/// Forwards every call through a [`RetryPolicy`]. Repeated connectivity
/// failures trigger [`KvStore::reconnect`] on the inner store.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: KvStore> RetryingStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_policy(inner, RetryPolicy::default())
    }

    pub fn with_policy(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: KvStore> KvStore for RetryingStore<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let inner = &self.inner;
        self.policy
            .run(
                key,
                |attempt| async move {
                    if inner.set_nx_px(key, value, ttl).await? {
                        return Ok(true);
                    }
                    if attempt == 1 {
                        return Ok(false);
                    }
                    // An earlier attempt may have landed before its reply was lost.
                    Ok(inner.get(key).await?.as_deref() == Some(value))
                },
                || self.inner.reconnect(),
            )
            .await
            .map_err(|e| e.at(Operation::Acquire, key))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.policy
            .run(
                key,
                |_| self.inner.compare_and_delete(key, expected),
                || self.inner.reconnect(),
            )
            .await
            .map_err(|e| e.at(Operation::Release, key))
    }

    async fn compare_and_pexpire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.policy
            .run(
                key,
                |_| self.inner.compare_and_pexpire(key, expected, ttl),
                || self.inner.reconnect(),
            )
            .await
            .map_err(|e| e.at(Operation::Renew, key))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.policy
            .run(key, |_| self.inner.get(key), || self.inner.reconnect())
            .await
            .map_err(|e| e.at(Operation::Get, key))
    }

    async fn ping(&self) -> Result<()> {
        let name = self.inner.name();
        self.policy
            .run(name, |_| self.inner.ping(), || self.inner.reconnect())
            .await
            .map_err(|e| e.at(Operation::Ping, name))
    }

    async fn reconnect(&self) -> Result<()> {
        self.inner.reconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use keelctl_core::Error;

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_absorbed() {
        let store = RetryingStore::new(MemoryStore::new());
        store.inner().fail_next(2);
        let set = store
            .set_nx_px("lock:a", "v", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(set);
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_set_reply_still_reports_the_key_as_ours() {
        let store = RetryingStore::new(MemoryStore::new());
        store.inner().lose_next_replies(1);
        let set = store
            .set_nx_px("lock:a", "mine", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(set);
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("mine"));
    }

    #[tokio::test(start_paused = true)]
    async fn retried_set_does_not_claim_a_foreign_key() {
        let store = RetryingStore::new(MemoryStore::new());
        store.inner().force_set("lock:a", "theirs", Duration::from_secs(30));
        store.inner().fail_next(1);
        let set = store
            .set_nx_px("lock:a", "mine", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!set);
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("theirs"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_name_the_operation_and_key() {
        let store = RetryingStore::new(MemoryStore::new());
        store.inner().fail_next(3);
        let err = store.compare_and_delete("lock:a", "v").await.unwrap_err();
        match err {
            Error::Connectivity {
                operation, target, ..
            } => {
                assert_eq!(operation, Operation::Release);
                assert_eq!(target, "lock:a");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
