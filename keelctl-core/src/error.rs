/// Structured error types for keelctl.
///
/// Uses `thiserror` so the driver, repository facade and lease lock share one
/// taxonomy. The binary (keelctl-cli) wraps these in `anyhow` for reporting.
use std::fmt;

use thiserror::Error;

/// What the core was doing when an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Count,
    Exists,
    Upsert,
    Query,
    Execute,
    Begin,
    Commit,
    Rollback,
    Connect,
    Ping,
    Acquire,
    Renew,
    Release,
    Get,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Select => "select",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Count => "count",
            Operation::Exists => "exists",
            Operation::Upsert => "upsert",
            Operation::Query => "query",
            Operation::Execute => "execute",
            Operation::Begin => "begin",
            Operation::Commit => "commit",
            Operation::Rollback => "rollback",
            Operation::Connect => "connect",
            Operation::Ping => "ping",
            Operation::Acquire => "acquire",
            Operation::Renew => "renew",
            Operation::Release => "release",
            Operation::Get => "get",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for keelctl operations
#[derive(Error, Debug)]
pub enum Error {
    /// Operator argument has the wrong shape (non-array range, bad arity)
    #[error("Malformed operator '{operator}' on field '{field}': {reason}")]
    MalformedOperator {
        field: String,
        operator: String,
        reason: String,
    },

    /// Descriptor could not be interpreted at all
    #[error("Invalid descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    /// INSERT with no records
    #[error("Empty insert batch for table '{table}'")]
    EmptyInsert { table: String },

    /// UPDATE where every field was absent
    #[error("No resolvable assignments for update on table '{table}'")]
    NoAssignments { table: String },

    /// JOIN missing ON/USING, or of an unknown type
    #[error("Invalid {kind} join on '{table}': {reason}")]
    InvalidJoin {
        kind: String,
        table: String,
        reason: String,
    },

    /// Batch insert records declare different field sets
    #[error(
        "Batch insert into '{table}': record {index} fields differ from record 0 (missing: {missing:?}, extra: {extra:?})"
    )]
    FieldMismatch {
        table: String,
        index: usize,
        missing: Vec<String>,
        extra: Vec<String>,
    },

    /// Outcome contradicts what was requested (row-count shortfall, bad key set)
    #[error("Integrity error during {operation} on '{target}': {reason}")]
    Integrity {
        operation: Operation,
        target: String,
        reason: String,
    },

    /// Database kind or URL scheme is not recognised
    #[error("Unknown dialect '{name}'")]
    UnknownDialect { name: String },

    /// Dialect cannot express the requested statement
    #[error("{operation} is not supported by the {dialect} dialect")]
    UnsupportedOperation {
        operation: Operation,
        dialect: &'static str,
    },

    /// Transient transport failure (refused, reset, timed out, lost)
    #[error("Connection error during {operation} on '{target}': {message}")]
    Connectivity {
        operation: Operation,
        target: String,
        message: String,
    },

    /// Non-transport database failure (constraint, syntax, deadlock)
    #[error("Database error during {operation} on '{target}': {message}")]
    Database {
        operation: Operation,
        target: String,
        message: String,
    },

    /// Non-transport cache failure
    #[error("Cache error during {operation} on '{target}': {message}")]
    Cache {
        operation: Operation,
        target: String,
        message: String,
    },

    /// Row could not be converted into the requested type
    #[error("Failed to decode row from '{target}': {message}")]
    Decode { target: String, message: String },

    /// `begin()` while a connection is already pinned
    #[error("Transaction already active on '{target}'")]
    TransactionAlreadyActive { target: String },

    /// `commit()`/`rollback()` with nothing pinned
    #[error("No active transaction on '{target}'")]
    NoActiveTransaction { target: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Config { reason: String },
}

/// Result type alias for keelctl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport-level failure signatures, matched case-insensitively.
const CONNECTION_SIGNATURES: &[&str] = &[
    "econnrefused",
    "econnreset",
    "etimedout",
    "ehostunreach",
    "enetunreach",
    "epipe",
    "connection refused",
    "connection reset",
    "connection aborted",
    "connection lost",
    "connection closed",
    "lost connection",
    "server has gone away",
    "broken pipe",
    "timed out",
    "host is unreachable",
    "network is unreachable",
];

/// Returns true if a driver/transport message describes a connectivity failure.
pub fn is_connection_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    CONNECTION_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

impl Error {
    pub fn malformed_operator(
        field: impl Into<String>,
        operator: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedOperator {
            field: field.into(),
            operator: operator.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_descriptor(reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            reason: reason.into(),
        }
    }

    pub fn invalid_join(
        kind: impl Into<String>,
        table: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidJoin {
            kind: kind.into(),
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub fn integrity(
        operation: Operation,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Integrity {
            operation,
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a connectivity error; context is filled in by [`Error::at`].
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity {
            operation: Operation::Query,
            target: String::new(),
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            operation: Operation::Query,
            target: String::new(),
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            operation: Operation::Get,
            target: String::new(),
            message: message.into(),
        }
    }

    /// Classify a raw driver message: connectivity if it carries a transport
    /// signature, otherwise a plain database error.
    pub fn from_driver_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_connection_message(&message) {
            Self::connectivity(message)
        } else {
            Self::database(message)
        }
    }

    pub fn decode(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Attach operation and target to I/O-originated errors.
    ///
    /// Errors raised by the compiler or by usage checks already carry their
    /// context and are returned unchanged.
    pub fn at(mut self, op: Operation, tgt: &str) -> Self {
        match &mut self {
            Error::Connectivity {
                operation, target, ..
            }
            | Error::Database {
                operation, target, ..
            }
            | Error::Cache {
                operation, target, ..
            } => {
                *operation = op;
                *target = tgt.to_string();
            }
            _ => {}
        }
        self
    }

    /// Returns true if retrying might succeed (transport failures only)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connectivity { .. })
    }

    /// Returns true for descriptor problems caught before any I/O
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedOperator { .. }
                | Error::InvalidDescriptor { .. }
                | Error::EmptyInsert { .. }
                | Error::NoAssignments { .. }
                | Error::InvalidJoin { .. }
                | Error::FieldMismatch { .. }
        )
    }

    /// Returns true for programmer-facing API misuse
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::TransactionAlreadyActive { .. } | Error::NoActiveTransaction { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_messages_are_recognised() {
        assert!(is_connection_message("read ECONNRESET"));
        assert!(is_connection_message("Connection lost: The server closed the connection."));
        assert!(is_connection_message("MySQL server has gone away"));
        assert!(is_connection_message("error communicating with database: Broken pipe"));
        assert!(!is_connection_message("Duplicate entry 'a' for key 'PRIMARY'"));
        assert!(!is_connection_message("Deadlock found when trying to get lock"));
    }

    #[test]
    fn driver_messages_are_classified() {
        assert!(Error::from_driver_message("connect ECONNREFUSED 127.0.0.1:3306").is_retryable());
        assert!(!Error::from_driver_message("You have an error in your SQL syntax").is_retryable());
    }

    #[test]
    fn at_fills_context_for_io_errors() {
        let err = Error::connectivity("read ECONNRESET").at(Operation::Insert, "users");
        assert_eq!(
            err.to_string(),
            "Connection error during insert on 'users': read ECONNRESET"
        );
    }

    #[test]
    fn at_leaves_compile_errors_alone() {
        let err = Error::EmptyInsert {
            table: "users".into(),
        }
        .at(Operation::Select, "other");
        assert_eq!(err.to_string(), "Empty insert batch for table 'users'");
        assert!(err.is_compile_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn field_mismatch_names_the_index() {
        let err = Error::FieldMismatch {
            table: "users".into(),
            index: 2,
            missing: vec!["age".into()],
            extra: vec![],
        };
        assert!(err.to_string().contains("record 2"));
        assert!(err.to_string().contains("age"));
    }
}
