//! Command implementations for the keelctl CLI

pub mod compile;
pub mod lock;
pub mod ping;

pub use compile::run_compile;
pub use lock::run_lock;
pub use ping::run_ping;
