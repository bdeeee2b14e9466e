//! Redis-backed [`KvStore`] over a multiplexed `ConnectionManager`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keelctl_core::{CacheEndpoint, Error, ResolvedCache, Result};
use once_cell::sync::Lazy;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{
    Client, ConnectionAddr, ConnectionInfo, IntoConnectionInfo, ProtocolVersion,
    RedisConnectionInfo, RedisError, Script,
};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::KvStore;

static COMPARE_AND_DELETE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#,
    )
});

static COMPARE_AND_PEXPIRE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#,
    )
});

/// Map a redis error onto the core taxonomy.
pub(crate) fn classify(err: RedisError) -> Error {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        Error::connectivity(err.to_string())
    } else {
        Error::cache(err.to_string())
    }
}

fn connection_info(endpoint: &CacheEndpoint) -> Result<ConnectionInfo> {
    match endpoint {
        CacheEndpoint::Url(url) => url
            .as_str()
            .into_connection_info()
            .map_err(|e| Error::config(format!("invalid cache url: {e}"))),
        CacheEndpoint::Fields {
            host,
            port,
            username,
            password,
            db,
        } => Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(host.clone(), *port),
            redis: RedisConnectionInfo {
                db: *db,
                username: username.clone(),
                password: password.clone(),
                protocol: ProtocolVersion::RESP2,
            },
        }),
    }
}

/// Current value plus a generation bumped on every replacement. Replacement
/// is single-flight: callers that queued behind one that already replaced
/// the value return without building another.
struct Slot<T> {
    current: RwLock<T>,
    generation: AtomicU64,
    gate: Mutex<()>,
}

impl<T: Clone> Slot<T> {
    fn new(value: T) -> Self {
        Self {
            current: RwLock::new(value),
            generation: AtomicU64::new(0),
            gate: Mutex::new(()),
        }
    }

    async fn get(&self) -> T {
        self.current.read().await.clone()
    }

    /// Returns false when another caller replaced the value while this one
    /// waited for the gate.
    async fn replace<F, Fut>(&self, build: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let seen = self.generation.load(Ordering::SeqCst);
        let _guard = self.gate.lock().await;
        if self.generation.load(Ordering::SeqCst) != seen {
            return Ok(false);
        }
        let fresh = build().await?;
        *self.current.write().await = fresh;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Cache handle: one connection manager plus an optional health-check task.
pub struct RedisStore {
    name: String,
    client: Client,
    manager_config: ConnectionManagerConfig,
    manager: Arc<Slot<ConnectionManager>>,
    health_check: Option<JoinHandle<()>>,
}

impl RedisStore {
    /// Connect to a resolved cache and start its health check, if configured.
    pub async fn connect(config: &ResolvedCache) -> Result<Self> {
        let client = Client::open(connection_info(&config.endpoint)?)
            .map_err(|e| Error::config(format!("cache '{}': {e}", config.name)))?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(config.connect_timeout)
            .set_response_timeout(config.response_timeout);

        let manager = ConnectionManager::new_with_config(client.clone(), manager_config.clone())
            .await
            .map_err(classify)?;
        info!(cache = %config.name, "cache connected");

        let manager = Arc::new(Slot::new(manager));
        let health_check = config
            .health_check_interval
            .map(|every| spawn_health_check(config.name.clone(), manager.clone(), every));

        Ok(Self {
            name: config.name.clone(),
            client,
            manager_config,
            manager,
            health_check,
        })
    }

    async fn conn(&self) -> ConnectionManager {
        self.manager.get().await
    }
}

fn spawn_health_check(
    name: String,
    manager: Arc<Slot<ConnectionManager>>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut conn = manager.get().await;
            let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            match pong {
                Ok(_) => debug!(cache = %name, "health check ok"),
                Err(e) => warn!(cache = %name, error = %e, "health check failed"),
            }
        }
    })
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        if let Some(handle) = self.health_check.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn().await;
        let removed: i64 = COMPARE_AND_DELETE
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(removed == 1)
    }

    async fn compare_and_pexpire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn().await;
        let extended: i64 = COMPARE_AND_PEXPIRE
            .key(key)
            .arg(expected)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(extended == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(classify)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        let replaced = self
            .manager
            .replace(|| async {
                ConnectionManager::new_with_config(self.client.clone(), self.manager_config.clone())
                    .await
                    .map_err(classify)
            })
            .await?;
        if replaced {
            warn!(cache = %self.name, "cache connection replaced");
        } else {
            debug!(cache = %self.name, "cache connection already replaced");
        }
        Ok(())
    }
}
