//! History event synchronisation.
//!
//! Each append-only producer stream gets its own bounded pipeline: a reader
//! consuming messages in order, a router mapping every message to its typed
//! upsert targets, and an applier writing batches and acknowledging applied
//! messages by deleting them producer-side. Messages survive in the stream
//! until acknowledged, so a crash at any point replays idempotent upserts.

pub mod retention;
pub mod sla;

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{Db, BATCH_SIZE};
use crate::entity::kinds::{
    ACKNOWLEDGEMENT_HISTORY, COMMENT_HISTORY, DOWNTIME_HISTORY, FLAPPING_HISTORY,
    NOTIFICATION_HISTORY,
};
use crate::entity::{EntityKind, EntityRow, Fields};
use crate::error::Error;
use crate::redis::{entry_fields, history_stream, RedisClient};
use crate::types::Binary;
use crate::Result;

/// Read block length; bounds cancellation latency.
const BLOCK: Duration = Duration::from_secs(1);

/// Messages per read.
const READ_COUNT: usize = 1000;

/// Router: map one event's fields to zero or more upsert targets.
pub type Route = fn(&Fields) -> Result<Vec<(&'static EntityKind, EntityRow)>>;

/// Static descriptor of one history stream.
pub struct HistoryStream {
    /// Stream name suffix and retention category.
    pub category: &'static str,
    /// Whether decode failures are logged and skipped instead of fatal.
    pub tolerant: bool,
    pub route: Route,
}

fn route_notification(f: &Fields) -> Result<Vec<(&'static EntityKind, EntityRow)>> {
    Ok(vec![(
        &NOTIFICATION_HISTORY,
        NOTIFICATION_HISTORY.decode_row(f)?,
    )])
}

fn route_downtime(f: &Fields) -> Result<Vec<(&'static EntityKind, EntityRow)>> {
    Ok(vec![(&DOWNTIME_HISTORY, DOWNTIME_HISTORY.decode_row(f)?)])
}

fn route_comment(f: &Fields) -> Result<Vec<(&'static EntityKind, EntityRow)>> {
    Ok(vec![(&COMMENT_HISTORY, COMMENT_HISTORY.decode_row(f)?)])
}

fn route_flapping(f: &Fields) -> Result<Vec<(&'static EntityKind, EntityRow)>> {
    Ok(vec![(&FLAPPING_HISTORY, FLAPPING_HISTORY.decode_row(f)?)])
}

fn route_acknowledgement(f: &Fields) -> Result<Vec<(&'static EntityKind, EntityRow)>> {
    Ok(vec![(
        &ACKNOWLEDGEMENT_HISTORY,
        ACKNOWLEDGEMENT_HISTORY.decode_row(f)?,
    )])
}

/// The producer's history streams. Default decode policy is strict.
pub static HISTORY_STREAMS: &[HistoryStream] = &[
    HistoryStream {
        category: "notification",
        tolerant: false,
        route: route_notification,
    },
    HistoryStream {
        category: "state",
        tolerant: false,
        route: sla::route_state,
    },
    HistoryStream {
        category: "downtime",
        tolerant: false,
        route: route_downtime,
    },
    HistoryStream {
        category: "comment",
        tolerant: false,
        route: route_comment,
    },
    HistoryStream {
        category: "flapping",
        tolerant: false,
        route: route_flapping,
    },
    HistoryStream {
        category: "acknowledgement",
        tolerant: false,
        route: route_acknowledgement,
    },
];

/// One read's worth of routed events, with the message ids to acknowledge
/// once every target row is applied.
struct Chunk {
    ids: Vec<String>,
    rows: Vec<(&'static EntityKind, EntityRow)>,
}

/// Decode and route one read. Tolerant streams log and skip bad messages
/// but still acknowledge them, advancing the cursor.
fn route_chunk(
    stream: &HistoryStream,
    entries: Vec<(String, Vec<(String, String)>)>,
) -> Result<Chunk> {
    let mut chunk = Chunk {
        ids: Vec::with_capacity(entries.len()),
        rows: Vec::new(),
    };

    for (id, pairs) in entries {
        let fields = Fields::from_pairs("history", pairs);
        match (stream.route)(&fields) {
            Ok(targets) => chunk.rows.extend(targets),
            Err(err) if stream.tolerant && !err.is_cancelled() => {
                warn!(
                    stream = stream.category,
                    message = %id,
                    error = %err,
                    "Skipping undecodable history event"
                );
            }
            Err(err) => return Err(err),
        }
        chunk.ids.push(id);
    }

    Ok(chunk)
}

/// Multiplexes every history stream into its typed pipeline.
pub struct HistorySync {
    db: Db,
    redis: RedisClient,
}

impl HistorySync {
    pub fn new(db: Db, redis: RedisClient) -> Self {
        HistorySync { db, redis }
    }

    /// Run all stream pipelines until the scope is cancelled.
    pub async fn run(&self, token: &CancellationToken, env: &Binary) -> Result<()> {
        info!(streams = HISTORY_STREAMS.len(), "Syncing history");

        let pipelines = HISTORY_STREAMS.iter().map(|stream| {
            pipeline(
                self.db.clone(),
                self.redis.clone(),
                token.clone(),
                env.clone(),
                stream,
            )
        });
        try_join_all(pipelines).await?;
        Ok(())
    }
}

/// One stream's reader/applier pair, joined by a single-chunk channel so
/// the reader can fetch the next read while the previous one applies, but
/// never further ahead than that.
async fn pipeline(
    db: Db,
    redis: RedisClient,
    token: CancellationToken,
    env: Binary,
    stream: &'static HistoryStream,
) -> Result<()> {
    let key = Arc::new(history_stream(stream.category));
    let (tx, mut rx) = mpsc::channel::<Chunk>(1);

    let reader = {
        let redis = redis.clone();
        let token = token.clone();
        let key = key.clone();
        async move {
            // Applied messages were deleted, so the stream starts at the
            // oldest unacknowledged event.
            let mut last_id = "0-0".to_string();
            loop {
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let reply = redis
                    .xread(
                        &token,
                        &[key.as_str()],
                        std::slice::from_ref(&last_id),
                        BLOCK,
                        READ_COUNT,
                    )
                    .await?;

                let Some(entries) = reply
                    .keys
                    .into_iter()
                    .find(|k| k.key == *key.as_str())
                    .map(|k| k.ids)
                else {
                    continue;
                };
                if entries.is_empty() {
                    continue;
                }

                last_id = entries.last().map(|e| e.id.clone()).unwrap_or_default();

                let mut decoded = Vec::with_capacity(entries.len());
                for entry in &entries {
                    decoded.push((entry.id.clone(), entry_fields(entry)?));
                }
                let chunk = route_chunk(stream, decoded)?;

                if tx.send(chunk).await.is_err() {
                    return Ok(());
                }
            }
        }
    };

    let applier = async move {
        while let Some(chunk) = rx.recv().await {
            // Group rows per target, preserving first-seen target order so
            // the primary history row applies before its projections.
            let mut per_target: Vec<(&'static EntityKind, Vec<EntityRow>)> = Vec::new();
            for (kind, row) in chunk.rows {
                match per_target.iter_mut().find(|(k, _)| k.name == kind.name) {
                    Some((_, rows)) => rows.push(row),
                    None => per_target.push((kind, vec![row])),
                }
            }

            for (kind, rows) in &per_target {
                for batch in rows.chunks(BATCH_SIZE) {
                    db.upsert_batch(&token, &env, kind, batch).await?;
                }
            }

            // Acknowledge only after every target committed.
            redis.xdel(&token, &key, &chunk.ids).await?;
            debug!(
                stream = stream.category,
                messages = chunk.ids.len(),
                "Applied history chunk"
            );
        }
        Ok(())
    };

    tokio::try_join!(reader, applier)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn comment_pairs(id_byte: &str) -> Vec<(String, String)> {
        vec![
            ("id".into(), id_byte.repeat(20)),
            ("comment_id".into(), "10".repeat(20)),
            ("host_id".into(), "aa".repeat(20)),
            ("entry_time".into(), "1700000000000".into()),
            ("author".into(), "icingaadmin".into()),
        ]
    }

    #[test]
    fn stream_set_covers_all_categories() {
        let categories: Vec<_> = HISTORY_STREAMS.iter().map(|s| s.category).collect();
        assert_eq!(
            categories,
            vec![
                "notification",
                "state",
                "downtime",
                "comment",
                "flapping",
                "acknowledgement"
            ]
        );
    }

    #[test]
    fn route_chunk_keeps_ids_in_producer_order() {
        let stream = &HISTORY_STREAMS[3]; // comment
        let entries = vec![
            ("1-1".to_string(), comment_pairs("01")),
            ("1-2".to_string(), comment_pairs("02")),
            ("2-1".to_string(), comment_pairs("03")),
        ];

        let chunk = route_chunk(stream, entries).unwrap();
        assert_eq!(chunk.ids, vec!["1-1", "1-2", "2-1"]);
        assert_eq!(chunk.rows.len(), 3);
    }

    #[test]
    fn strict_stream_fails_on_bad_event() {
        let stream = &HISTORY_STREAMS[3];
        let entries = vec![("1-1".to_string(), vec![("author".into(), "x".into())])];
        assert!(route_chunk(stream, entries).is_err());
    }

    #[test]
    fn tolerant_stream_skips_but_acknowledges() {
        let tolerant = HistoryStream {
            category: "comment",
            tolerant: true,
            route: |f| {
                Ok(vec![(
                    &COMMENT_HISTORY,
                    COMMENT_HISTORY.decode_row(f)?,
                )])
            },
        };

        let entries = vec![
            ("1-1".to_string(), vec![("author".into(), "x".into())]),
            ("1-2".to_string(), comment_pairs("02")),
        ];

        let chunk = route_chunk(&tolerant, entries).unwrap();
        // The broken message is skipped but still acknowledged.
        assert_eq!(chunk.ids, vec!["1-1", "1-2"]);
        assert_eq!(chunk.rows.len(), 1);
    }

    #[test]
    fn state_events_route_through_the_sla_projection() {
        let stream = HISTORY_STREAMS.iter().find(|s| s.category == "state").unwrap();
        let raw = json!({
            "id": "01".repeat(20),
            "host_id": "aa".repeat(20),
            "event_time": "1700000000000",
            "state_type": 1,
            "hard_state": 2
        });
        let pairs: Vec<(String, String)> = match raw {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| {
                    let s = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, s)
                })
                .collect(),
            _ => unreachable!(),
        };

        let chunk = route_chunk(stream, vec![("5-0".into(), pairs)]).unwrap();
        assert_eq!(chunk.rows.len(), 2);
        let tables: Vec<_> = chunk.rows.iter().map(|(k, _)| k.table).collect();
        assert_eq!(tables, vec!["state_history", "sla_history_state"]);
    }
}
