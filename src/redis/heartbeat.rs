//! Producer liveness watcher.
//!
//! Follows the `icinga:stats` stream and publishes a channel of heartbeat
//! events. Producer wall-clock time rides along on every event; the only
//! use of the replica's own clock is detecting that messages stopped
//! arriving.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{entry_fields, RedisClient, STATS_STREAM};
use crate::entity::Fields;
use crate::types::{Binary, UnixMilli};
use crate::Result;

/// How long the producer may stay silent before it is considered dead.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(60);

/// Read block length; bounds cancellation latency.
const BLOCK: Duration = Duration::from_secs(1);

/// Decoded `icinga:stats` payload.
#[derive(Debug, Clone)]
pub struct Stats {
    /// Tenancy identifier scoping all replication.
    pub environment: Binary,
    /// Producer wall clock at publish time.
    pub time: UnixMilli,
    pub boot_time: Option<UnixMilli>,
    pub version: Option<String>,
}

impl Stats {
    fn parse(pairs: Vec<(String, String)>) -> Result<Self> {
        let fields = Fields::from_pairs("stats", pairs);
        Ok(Stats {
            environment: fields.req_binary("environment")?,
            time: fields.req_millis("time")?,
            boot_time: fields.opt_millis("boot_time")?,
            version: fields.opt_str("version")?,
        })
    }
}

/// One producer liveness observation.
#[derive(Debug, Clone)]
pub enum HeartbeatEvent {
    Alive(Stats),
    /// Emitted once when the liveness window lapses without a message.
    Dead,
}

/// Start the watcher. Events arrive on the returned channel until the scope
/// is cancelled; the handle yields the first non-recovered error.
pub fn listen(
    client: RedisClient,
    token: CancellationToken,
) -> (mpsc::Receiver<HeartbeatEvent>, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(1);

    let handle = tokio::spawn(async move {
        let result = run(&client, &token, &tx).await;
        match &result {
            Err(err) if !err.is_cancelled() => {
                warn!(error = %err, "Heartbeat watcher failed");
            }
            _ => {}
        }
        result
    });

    (rx, handle)
}

async fn run(
    client: &RedisClient,
    token: &CancellationToken,
    tx: &mpsc::Sender<HeartbeatEvent>,
) -> Result<()> {
    let mut last_id = "$".to_string();
    let mut last_seen = Instant::now();
    let mut alive = false;

    loop {
        if token.is_cancelled() {
            return Ok(());
        }

        let reply = client
            .xread(token, &[STATS_STREAM], &[last_id.clone()], BLOCK, 10)
            .await?;

        let entry = reply
            .keys
            .iter()
            .find(|k| k.key == STATS_STREAM)
            .and_then(|k| k.ids.last().cloned());

        match entry {
            Some(entry) => {
                last_id = entry.id.clone();
                last_seen = Instant::now();
                let stats = Stats::parse(entry_fields(&entry)?)?;
                debug!(time = stats.time.as_millis(), "Producer heartbeat");
                alive = true;
                if tx.send(HeartbeatEvent::Alive(stats)).await.is_err() {
                    return Ok(());
                }
            }
            None => {
                if alive && last_seen.elapsed() > LIVENESS_WINDOW {
                    warn!("Lost producer heartbeat");
                    alive = false;
                    if tx.send(HeartbeatEvent::Dead).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_pairs() -> Vec<(String, String)> {
        vec![
            ("environment".into(), "ab".repeat(20)),
            ("time".into(), "1700000000000".into()),
            ("boot_time".into(), "1699999000000".into()),
            ("version".into(), "2.14.0".into()),
        ]
    }

    #[test]
    fn stats_parse_full_payload() {
        let stats = Stats::parse(stats_pairs()).unwrap();
        assert_eq!(stats.environment.len(), 20);
        assert_eq!(stats.time, UnixMilli(1_700_000_000_000));
        assert_eq!(stats.boot_time, Some(UnixMilli(1_699_999_000_000)));
        assert_eq!(stats.version.as_deref(), Some("2.14.0"));
    }

    #[test]
    fn stats_requires_environment_and_time() {
        let missing_env: Vec<(String, String)> =
            vec![("time".into(), "1700000000000".into())];
        assert!(Stats::parse(missing_env).is_err());

        let missing_time: Vec<(String, String)> =
            vec![("environment".into(), "ab".repeat(20))];
        assert!(Stats::parse(missing_time).is_err());
    }

    #[test]
    fn stats_tolerates_missing_optional_fields() {
        let minimal = vec![
            ("environment".into(), "cd".repeat(20)),
            ("time".into(), "1700000000500".into()),
        ];
        let stats = Stats::parse(minimal).unwrap();
        assert!(stats.boot_time.is_none());
        assert!(stats.version.is_none());
    }
}
