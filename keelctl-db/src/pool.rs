//! Pool construction and sqlx error classification shared by both backends.
//!
//! Pools are created lazily: building one performs no I/O, so a rebuild is
//! cheap and the first statement is what surfaces connection failures.

use std::io;

use keelctl_core::{Error, PoolSettings};
use sqlx::pool::PoolOptions;

/// Pool options from per-database settings.
pub(crate) fn pool_options<DB: sqlx::Database>(settings: &PoolSettings) -> PoolOptions<DB> {
    PoolOptions::<DB>::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections.min(settings.max_connections))
        .acquire_timeout(settings.acquire_timeout())
        .idle_timeout(settings.idle_timeout())
        .max_lifetime(settings.max_lifetime())
        .test_before_acquire(settings.keepalive)
}

fn is_transport_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::AddrNotAvailable
    ) || keelctl_core::is_connection_message(&err.to_string())
}

/// Map a sqlx error onto the core taxonomy.
///
/// Transport failures, pool timeouts and a closed pool are connectivity
/// errors (retryable); server-reported errors are database errors unless
/// their message carries a transport signature.
pub(crate) fn classify(err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::Io(io_err) if is_transport_io(io_err) => Error::connectivity(err.to_string()),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Error::connectivity(err.to_string()),
        sqlx::Error::Configuration(_) => Error::config(err.to_string()),
        sqlx::Error::Database(db) => Error::from_driver_message(db.message()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            Error::decode("row", err.to_string())
        }
        _ => Error::from_driver_message(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_and_pool_errors_are_retryable() {
        let refused = sqlx::Error::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connect ECONNREFUSED",
        ));
        assert!(classify(refused).is_retryable());
        assert!(classify(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(classify(sqlx::Error::PoolClosed).is_retryable());
    }

    #[test]
    fn protocol_errors_are_classified_by_message() {
        assert!(classify(sqlx::Error::Protocol("Lost connection to MySQL server".into()))
            .is_retryable());
        assert!(!classify(sqlx::Error::Protocol("unexpected packet".into())).is_retryable());
        assert!(!classify(sqlx::Error::RowNotFound).is_retryable());
    }

    #[test]
    fn configuration_errors_are_config() {
        let err = classify(sqlx::Error::Configuration("bad url".into()));
        assert!(matches!(err, Error::Config { .. }));
    }
}
