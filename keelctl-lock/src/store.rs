//! Key/value primitives the lease lock needs from a cache.

use std::time::Duration;

use async_trait::async_trait;
use keelctl_core::Result;

/// Atomic cache operations used by [`crate::LeaseLock`].
///
/// The compare-and-* operations must be atomic on the server: they compare
/// the stored value to `expected` and act only on a match.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Short name for logs and error context.
    fn name(&self) -> &str;

    /// Set `key` to `value` with a TTL if it does not exist. Returns true if
    /// the key was set.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Reset the TTL of `key` if it currently holds `expected`.
    async fn compare_and_pexpire(&self, key: &str, expected: &str, ttl: Duration)
        -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn ping(&self) -> Result<()>;

    /// Drop and re-establish the underlying connection.
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }
}
