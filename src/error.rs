//! Crate-wide error type and retryability classification.
//!
//! Every component returns the first non-recovered error to its scope
//! parent. Cancellation is modelled as its own variant so that scope roots
//! can filter it from real failures.

use thiserror::Error;

/// Errors surfaced by the replication engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Database driver or pool error.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Stream store (Redis) error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stream payload or config value failed to decode into an entity.
    #[error("can't decode {kind}: {message}")]
    Decode {
        kind: &'static str,
        message: String,
    },

    /// Invalid or unusable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The ambient scope was cancelled. Not a failure.
    #[error("operation cancelled")]
    Cancelled,

    /// The retry deadline elapsed before the operation succeeded.
    #[error("retry deadline exceeded after {attempts} attempts: {source}")]
    DeadlineExceeded {
        attempts: u64,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Decode failure constructor.
    pub fn decode(kind: &'static str, message: impl Into<String>) -> Self {
        Error::Decode {
            kind,
            message: message.into(),
        }
    }

    /// Whether this error was caused by scope cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether the operation may succeed if repeated.
    ///
    /// Network trouble, timeouts and deadlock-like conflicts are transient;
    /// everything else (schema mismatch, decode failure, cancellation) is
    /// final.
    pub fn retryable(&self) -> bool {
        match self {
            Error::Redis(e) => redis_retryable(e),
            Error::Db(e) => db_retryable(e),
            Error::DeadlineExceeded { .. }
            | Error::Decode { .. }
            | Error::Config(_)
            | Error::Cancelled => false,
        }
    }
}

fn redis_retryable(err: &redis::RedisError) -> bool {
    use redis::ErrorKind;

    err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_cluster_error()
        || matches!(
            err.kind(),
            ErrorKind::TryAgain | ErrorKind::BusyLoadingError | ErrorKind::MasterDown
        )
}

fn db_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            // MySQL: 1205 lock wait timeout, 1213 deadlock.
            // PostgreSQL: 40001 serialization failure, 40P01 deadlock,
            // 55P03 lock not available.
            matches!(
                db.code().as_deref(),
                Some("1205" | "1213" | "40001" | "40P01" | "55P03")
            )
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_not_retryable() {
        assert!(!Error::Cancelled.retryable());
        assert!(Error::Cancelled.is_cancelled());
    }

    #[test]
    fn decode_errors_are_fatal() {
        let err = Error::decode("host", "missing field id");
        assert!(!err.retryable());
        assert_eq!(err.to_string(), "can't decode host: missing field id");
    }

    #[test]
    fn io_database_errors_are_retryable() {
        let err = Error::Db(sqlx::Error::PoolTimedOut);
        assert!(err.retryable());
    }

    #[test]
    fn redis_io_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::Redis(redis::RedisError::from(io));
        assert!(err.retryable());
    }
}
