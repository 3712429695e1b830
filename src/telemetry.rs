//! Connection health counters.
//!
//! The only genuinely process-wide state in the engine. Handed around as an
//! `Arc` and fed from the retry hooks, never read or written through module
//! statics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Per-backend connection state.
#[derive(Default)]
struct ConnState {
    failures: AtomicU64,
    current_error: Mutex<Option<String>>,
}

impl ConnState {
    fn set_error(&self, message: Option<String>) {
        if message.is_some() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        *self.current_error.lock().expect("telemetry lock poisoned") = message;
    }

    fn current(&self) -> Option<String> {
        self.current_error
            .lock()
            .expect("telemetry lock poisoned")
            .clone()
    }
}

/// Observer for connection errors, passed by handle into retry settings.
#[derive(Default)]
pub struct Telemetry {
    db: ConnState,
    redis: ConnState,
}

impl Telemetry {
    /// Record the current database connection error, or clear it on success.
    pub fn set_db_error(&self, message: Option<String>) {
        self.db.set_error(message);
    }

    /// Record the current stream-store connection error, or clear it.
    pub fn set_redis_error(&self, message: Option<String>) {
        self.redis.set_error(message);
    }

    pub fn current_db_error(&self) -> Option<String> {
        self.db.current()
    }

    pub fn current_redis_error(&self) -> Option<String> {
        self.redis.current()
    }

    /// Cumulative database connection failures since process start.
    pub fn db_failures(&self) -> u64 {
        self.db.failures.load(Ordering::Relaxed)
    }

    /// Cumulative stream-store connection failures since process start.
    pub fn redis_failures(&self) -> u64 {
        self.redis.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_failures_and_clears_on_success() {
        let t = Telemetry::default();
        assert_eq!(t.db_failures(), 0);
        assert!(t.current_db_error().is_none());

        t.set_db_error(Some("connection refused".into()));
        t.set_db_error(Some("connection refused".into()));
        assert_eq!(t.db_failures(), 2);
        assert_eq!(t.current_db_error().as_deref(), Some("connection refused"));

        t.set_db_error(None);
        assert_eq!(t.db_failures(), 2);
        assert!(t.current_db_error().is_none());
    }

    #[test]
    fn backends_are_independent() {
        let t = Telemetry::default();
        t.set_redis_error(Some("timed out".into()));
        assert_eq!(t.redis_failures(), 1);
        assert_eq!(t.db_failures(), 0);
    }
}
