//! Shared cache handles keyed by connection identity.

use std::sync::Arc;

use keelctl_core::{CoreConfig, Registry, Result};

use crate::lease::LeaseLock;
use crate::redis_store::RedisStore;
use crate::retrying::RetryingStore;
use crate::store::KvStore;

/// Resolves cache names to one retrying redis store per identity.
pub struct Caches {
    config: CoreConfig,
    handles: Registry<Arc<dyn KvStore>>,
}

impl Caches {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            handles: Registry::new(),
        }
    }

    /// Store for a logical cache name (case-insensitive). Connects on first use.
    pub async fn store(&self, name: &str) -> Result<Arc<dyn KvStore>> {
        let resolved = self.config.resolve_cache(name)?;
        let identity = resolved.identity();
        self.handles
            .get_or_try_init(&identity, || async move {
                let store = RedisStore::connect(&resolved).await?;
                Ok(Arc::new(RetryingStore::new(store)) as Arc<dyn KvStore>)
            })
            .await
    }

    /// Lease lock over the cache named in `[lock]`.
    pub async fn lease_lock(&self) -> Result<LeaseLock> {
        let settings = &self.config.lock;
        let store = self.store(&settings.cache).await?;
        Ok(LeaseLock::with_settings(store, settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelctl_core::Error;

    #[tokio::test]
    async fn unknown_cache_is_a_config_error() {
        let caches = Caches::new(CoreConfig::default());
        let err = caches.store("sessions").await.err().unwrap();
        assert!(matches!(err, Error::Config { .. }));
    }
}
