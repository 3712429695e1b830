//! Stream store access.
//!
//! One `ConnectionManager` shared by clone across all readers; each caller
//! issues its own command pipeline. Every operation runs under retry with
//! the connection-error telemetry hooks attached, and honors scope
//! cancellation between attempts.

pub mod dump;
pub mod heartbeat;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RedisConfig;
use crate::db::connection_settings;
use crate::error::Error;
use crate::retry;
use crate::telemetry::Telemetry;
use crate::Result;

pub use redis::streams::{StreamId, StreamKey};

/// Liveness/metadata stream written by the producer.
pub const STATS_STREAM: &str = "icinga:stats";
/// Dump-state hash written by the producer.
pub const DUMP_KEY: &str = "icinga:dump";
/// Runtime change feed.
pub const RUNTIME_STREAM: &str = "icinga:runtime";

/// Full config state hash for one entity kind.
pub fn config_key(kind: &str) -> String {
    format!("icinga:config:{kind}")
}

/// Append-only history stream for one event category.
pub fn history_stream(category: &str) -> String {
    format!("icinga:history:stream:{category}")
}

/// Shared stream-store handle.
#[derive(Clone)]
pub struct RedisClient {
    conn: ConnectionManager,
    telemetry: Arc<Telemetry>,
}

impl RedisClient {
    /// Open the connection, retrying transient failures.
    pub async fn connect(
        token: &CancellationToken,
        config: &RedisConfig,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(Error::Redis)?;

        let conn = retry::with_backoff(
            token,
            || async {
                let conn = ConnectionManager::new(client.clone()).await?;
                Ok(conn)
            },
            Error::retryable,
            retry::default_backoff(),
            connection_settings(&telemetry, "redis"),
        )
        .await?;

        info!(url = %config.url, "Connected to stream store");

        Ok(RedisClient { conn, telemetry })
    }

    fn retry_settings(&self) -> retry::Settings {
        connection_settings(&self.telemetry, "redis")
    }

    /// Blocking stream read. Returns an empty reply on block timeout.
    pub async fn xread(
        &self,
        token: &CancellationToken,
        streams: &[&str],
        ids: &[String],
        block: Duration,
        count: usize,
    ) -> Result<StreamReadReply> {
        let options = StreamReadOptions::default()
            .block(block.as_millis() as usize)
            .count(count);

        retry::with_backoff(
            token,
            || async {
                let mut conn = self.conn.clone();
                // A block timeout answers nil, not an empty reply.
                let reply: Option<StreamReadReply> =
                    conn.xread_options(streams, ids, &options).await?;
                Ok(reply.unwrap_or_default())
            },
            Error::retryable,
            retry::default_backoff(),
            self.retry_settings(),
        )
        .await
    }

    /// Id of the newest message in a stream, `"0-0"` when empty.
    pub async fn stream_last_id(&self, token: &CancellationToken, stream: &str) -> Result<String> {
        retry::with_backoff(
            token,
            || async {
                let mut conn = self.conn.clone();
                let reply: redis::streams::StreamRangeReply =
                    conn.xrevrange_count(stream, "+", "-", 1).await?;
                Ok(reply
                    .ids
                    .first()
                    .map(|entry| entry.id.clone())
                    .unwrap_or_else(|| "0-0".to_string()))
            },
            Error::retryable,
            retry::default_backoff(),
            self.retry_settings(),
        )
        .await
    }

    /// Scan a complete hash into field/value pairs.
    pub async fn hscan_all(
        &self,
        token: &CancellationToken,
        key: &str,
    ) -> Result<Vec<(String, String)>> {
        retry::with_backoff(
            token,
            || async {
                let mut conn = self.conn.clone();
                let mut entries = Vec::new();
                let mut cursor: u64 = 0;
                loop {
                    let (next, chunk): (u64, Vec<String>) = redis::cmd("HSCAN")
                        .arg(key)
                        .arg(cursor)
                        .arg("COUNT")
                        .arg(1000)
                        .query_async(&mut conn)
                        .await?;

                    for pair in chunk.chunks_exact(2) {
                        entries.push((pair[0].clone(), pair[1].clone()));
                    }

                    cursor = next;
                    if cursor == 0 {
                        break;
                    }
                }
                Ok(entries)
            },
            Error::retryable,
            retry::default_backoff(),
            self.retry_settings(),
        )
        .await
    }

    /// Read a complete hash at once. Used for small keys such as the dump
    /// state.
    pub async fn hgetall(
        &self,
        token: &CancellationToken,
        key: &str,
    ) -> Result<HashMap<String, String>> {
        retry::with_backoff(
            token,
            || async {
                let mut conn = self.conn.clone();
                let map: HashMap<String, String> = conn.hgetall(key).await?;
                Ok(map)
            },
            Error::retryable,
            retry::default_backoff(),
            self.retry_settings(),
        )
        .await
    }

    /// Acknowledge applied stream messages by deleting them producer-side.
    pub async fn xdel(
        &self,
        token: &CancellationToken,
        stream: &str,
        ids: &[String],
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        retry::with_backoff(
            token,
            || async {
                let mut conn = self.conn.clone();
                let deleted: u64 = conn.xdel(stream, ids).await?;
                Ok(deleted)
            },
            Error::retryable,
            retry::default_backoff(),
            self.retry_settings(),
        )
        .await
    }
}

/// Extract a stream entry's field pairs as strings.
pub fn entry_fields(entry: &StreamId) -> Result<Vec<(String, String)>> {
    let mut fields = Vec::with_capacity(entry.map.len());
    for (key, value) in &entry.map {
        let value: String = redis::from_redis_value(value).map_err(Error::Redis)?;
        fields.push((key.clone(), value));
    }
    Ok(fields)
}
