//! Error types for record-pool.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Every pool and adapter failure is its own variant so callers can apply a distinct
//! retry policy per kind instead of matching on message text.

use std::time::Duration;
use thiserror::Error;

/// MySQL/MariaDB error numbers that map onto dedicated variants.
mod mysql_codes {
    pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
    pub const ER_LOCK_DEADLOCK: u16 = 1213;
    pub const ER_QUERY_INTERRUPTED: u16 = 1317;
    pub const ER_STATEMENT_TIMEOUT: u16 = 1969;
    pub const ER_QUERY_TIMEOUT: u16 = 3024;
}

#[derive(Error, Debug)]
pub enum DbError {
    /// Transient network failure talking to the server.
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error(
        "Could not obtain a connection from the pool within {waited_ms}ms (pool size: {size}, busy: {busy})"
    )]
    ConnectionTimeout {
        waited_ms: u64,
        size: usize,
        busy: usize,
    },

    #[error(
        "Could not gain exclusive ownership of all {connections} connections within {timeout_ms}ms ({outstanding} still leased)"
    )]
    ExclusiveConnectionTimeout {
        timeout_ms: u64,
        connections: usize,
        outstanding: usize,
    },

    #[error("No connection established: {message}")]
    ConnectionNotEstablished { message: String },

    #[error("Connection {connection_id} is closed")]
    ConnectionClosed { connection_id: u64 },

    #[error("Connection pool has been discarded")]
    PoolDiscarded,

    #[error("Deadlock found when trying to get lock: {message}")]
    Deadlocked {
        message: String,
        sql_state: Option<String>,
    },

    #[error("Lock wait timeout exceeded: {message}")]
    LockWaitTimeout {
        message: String,
        sql_state: Option<String>,
    },

    #[error("Statement timeout: {message}")]
    StatementTimeout {
        message: String,
        sql_state: Option<String>,
    },

    #[error("Query canceled: {message}")]
    QueryCanceled {
        message: String,
        sql_state: Option<String>,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42S02" for unknown table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a checkout timeout error.
    pub fn connection_timeout(waited: Duration, size: usize, busy: usize) -> Self {
        Self::ConnectionTimeout {
            waited_ms: waited.as_millis() as u64,
            size,
            busy,
        }
    }

    /// Create an exclusive acquisition timeout error.
    pub fn exclusive_connection_timeout(
        timeout: Duration,
        connections: usize,
        outstanding: usize,
    ) -> Self {
        Self::ExclusiveConnectionTimeout {
            timeout_ms: timeout.as_millis() as u64,
            connections,
            outstanding,
        }
    }

    pub fn connection_not_established(message: impl Into<String>) -> Self {
        Self::ConnectionNotEstablished {
            message: message.into(),
        }
    }

    pub fn connection_closed(connection_id: u64) -> Self {
        Self::ConnectionClosed { connection_id }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify a server error by its MySQL error number.
    pub fn from_mysql_error(number: u16, message: impl Into<String>, sql_state: Option<String>) -> Self {
        let message = message.into();
        match number {
            mysql_codes::ER_LOCK_DEADLOCK => Self::Deadlocked { message, sql_state },
            mysql_codes::ER_LOCK_WAIT_TIMEOUT => Self::LockWaitTimeout { message, sql_state },
            mysql_codes::ER_QUERY_TIMEOUT | mysql_codes::ER_STATEMENT_TIMEOUT => {
                Self::StatementTimeout { message, sql_state }
            }
            mysql_codes::ER_QUERY_INTERRUPTED => Self::QueryCanceled { message, sql_state },
            _ => Self::database(
                message,
                sql_state,
                "Check the SQL syntax and referenced objects",
            ),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::ConnectionTimeout { .. } => {
                Some("Increase the pool size or checkout_timeout, or release connections sooner")
            }
            Self::ExclusiveConnectionTimeout { .. } => {
                Some("Some connections are still leased; retry with raise_on_acquisition_timeout = false to force")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::Deadlocked { .. }
                | Self::LockWaitTimeout { .. }
        )
    }

    /// Statement timeouts and cancellations both abort the running query.
    pub fn is_query_aborted(&self) -> bool {
        matches!(self, Self::StatementTimeout { .. } | Self::QueryCanceled { .. })
    }

    /// Errors after which a connection must not be returned to the idle set.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection settings and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let sql_state = db_err.code().map(|c| c.to_string());
                match db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
                    Some(mysql_err) => {
                        DbError::from_mysql_error(mysql_err.number(), db_err.message(), sql_state)
                    }
                    None => DbError::database(
                        db_err.message(),
                        sql_state,
                        "Check the SQL syntax and referenced objects",
                    ),
                }
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => {
                DbError::connection_not_established("driver pool timed out")
            }
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::schema(
                format!("Type not found: {}", type_name),
                type_name.to_string(),
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col.to_string())
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => {
                DbError::connection("Database worker crashed", "Reconnect to the database")
            }
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for pool and adapter operations.
pub type DbResult<T> = Result<T, DbError>;
