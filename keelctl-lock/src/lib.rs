//! Distributed lease lock for keelctl.
//!
//! A [`LeaseLock`] runs work under a named key in a shared cache. The cache
//! is reached through [`KvStore`]; [`RedisStore`] is the production backend
//! and [`MemoryStore`] serves single-process use and tests.

pub mod lease;
pub mod memory;
pub mod owner;
pub mod redis_store;
pub mod registry;
pub mod retrying;
pub mod store;

pub use lease::{Acquired, Lease, LeaseLock, LeaseOptions};
pub use memory::MemoryStore;
pub use owner::OwnerId;
pub use redis_store::RedisStore;
pub use registry::Caches;
pub use retrying::RetryingStore;
pub use store::KvStore;
