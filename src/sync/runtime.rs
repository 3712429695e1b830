//! Runtime update consumer.
//!
//! Follows the producer's change feed from the stream id captured just
//! before the initial-sync snapshot, so nothing published during the
//! snapshot is lost. Messages batch per kind and apply with the same
//! dependency discipline as initial sync: deletes before upserts, stages
//! backwards then forwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::db::{Db, BATCH_SIZE};
use crate::entity::{EntityKind, EntityRow, Fields, Registry};
use crate::error::Error;
use crate::redis::{entry_fields, RedisClient, RUNTIME_STREAM};
use crate::types::Binary;
use crate::Result;

/// Read block length; bounds cancellation latency.
const BLOCK: Duration = Duration::from_secs(1);

/// Messages per read.
const READ_COUNT: usize = 1000;

/// Batched operations decoded from one read.
#[derive(Default, Debug)]
struct Batch {
    upserts: HashMap<&'static str, Vec<EntityRow>>,
    deletes: HashMap<&'static str, Vec<Binary>>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Decode one change-feed message into the batch. Unknown kinds and
/// operations are fatal: config kinds are always strict.
fn decode_into(registry: &Registry, batch: &mut Batch, pairs: Vec<(String, String)>) -> Result<()> {
    let fields = Fields::from_pairs("runtime", pairs);
    let object_type = fields.req_str("object_type")?;
    let kind = registry
        .get(&object_type)
        .ok_or_else(|| Error::decode("runtime", format!("unknown object type {object_type:?}")))?;

    match fields.req_str("runtime_type")?.as_str() {
        "upsert" => {
            let row = kind.decode_row(&fields)?;
            batch.upserts.entry(kind.name).or_default().push(row);
        }
        "delete" => {
            let id = fields.req_binary("id")?;
            batch.deletes.entry(kind.name).or_default().push(id);
        }
        other => {
            return Err(Error::decode(
                "runtime",
                format!("unknown runtime operation {other:?}"),
            ));
        }
    }
    Ok(())
}

/// Continuous change-feed consumer.
pub struct RuntimeUpdates {
    db: Db,
    redis: RedisClient,
    registry: Arc<Registry>,
}

impl RuntimeUpdates {
    pub fn new(db: Db, redis: RedisClient, registry: Arc<Registry>) -> Self {
        RuntimeUpdates {
            db,
            redis,
            registry,
        }
    }

    /// Consume from `from_id` until the scope is cancelled. The cursor only
    /// advances past messages whose batch applied successfully; it is not
    /// persisted, the next takeover captures a fresh one.
    pub async fn run(
        &self,
        token: &CancellationToken,
        env: &Binary,
        from_id: String,
    ) -> Result<()> {
        info!(from = %from_id, "Consuming runtime updates");
        let mut last_id = from_id;

        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let reply = self
                .redis
                .xread(
                    token,
                    &[RUNTIME_STREAM],
                    std::slice::from_ref(&last_id),
                    BLOCK,
                    READ_COUNT,
                )
                .await?;

            let Some(stream) = reply.keys.into_iter().find(|k| k.key == RUNTIME_STREAM) else {
                continue;
            };
            if stream.ids.is_empty() {
                continue;
            }

            let next_id = stream.ids.last().map(|e| e.id.clone()).unwrap_or_default();
            let mut batch = Batch::default();
            for entry in &stream.ids {
                decode_into(&self.registry, &mut batch, entry_fields(entry)?)?;
            }

            if !batch.is_empty() {
                self.apply(token, env, batch).await?;
            }
            last_id = next_id;
        }
    }

    /// Apply one decoded batch: deletes down the DAG, upserts up.
    async fn apply(&self, token: &CancellationToken, env: &Binary, batch: Batch) -> Result<()> {
        let stages = self.registry.stages();

        for stage in stages.iter().rev() {
            let work = stage.iter().filter_map(|kind| {
                let kind: &'static EntityKind = *kind;
                let ids = batch.deletes.get(kind.name)?.clone();
                let db = self.db.clone();
                let token = token.clone();
                Some(async move {
                    for chunk in ids.chunks(BATCH_SIZE) {
                        db.delete_batch(&token, kind, chunk).await?;
                    }
                    Ok::<_, Error>(())
                })
            });
            try_join_all(work).await?;
        }

        for stage in stages.iter() {
            let work = stage.iter().filter_map(|kind| {
                let kind: &'static EntityKind = *kind;
                let rows = batch.upserts.get(kind.name)?.clone();
                let db = self.db.clone();
                let token = token.clone();
                let env = env.clone();
                Some(async move {
                    for chunk in rows.chunks(BATCH_SIZE) {
                        db.upsert_batch(&token, &env, kind, chunk).await?;
                    }
                    Ok::<_, Error>(())
                })
            });
            try_join_all(work).await?;
        }

        debug!(
            upserts = batch.upserts.values().map(Vec::len).sum::<usize>(),
            deletes = batch.deletes.values().map(Vec::len).sum::<usize>(),
            "Applied runtime batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(pairs: Vec<Vec<(String, String)>>) -> Result<Batch> {
        let registry = Registry::config();
        let mut batch = Batch::default();
        for p in pairs {
            decode_into(&registry, &mut batch, p)?;
        }
        Ok(batch)
    }

    fn host_upsert() -> Vec<(String, String)> {
        vec![
            ("object_type".into(), "host".into()),
            ("runtime_type".into(), "upsert".into()),
            ("id".into(), "aa".repeat(20)),
            ("checksum".into(), "bb".repeat(20)),
            ("name".into(), "web-01".into()),
        ]
    }

    fn service_delete() -> Vec<(String, String)> {
        vec![
            ("object_type".into(), "service".into()),
            ("runtime_type".into(), "delete".into()),
            ("id".into(), "cc".repeat(20)),
        ]
    }

    #[test]
    fn groups_upserts_and_deletes_by_kind() {
        let batch = decode_all(vec![host_upsert(), service_delete()]).unwrap();
        assert_eq!(batch.upserts.get("host").map(Vec::len), Some(1));
        assert_eq!(batch.deletes.get("service").map(Vec::len), Some(1));
        assert!(!batch.is_empty());
    }

    #[test]
    fn unknown_object_type_is_fatal() {
        let pairs = vec![vec![
            ("object_type".into(), "zone".into()),
            ("runtime_type".into(), "upsert".into()),
        ]];
        let err = decode_all(pairs).unwrap_err();
        assert!(!err.retryable());
        assert!(err.to_string().contains("zone"));
    }

    #[test]
    fn unknown_runtime_type_is_fatal() {
        let pairs = vec![vec![
            ("object_type".into(), "host".into()),
            ("runtime_type".into(), "replace".into()),
            ("id".into(), "aa".repeat(20)),
        ]];
        assert!(decode_all(pairs).is_err());
    }

    #[test]
    fn delete_needs_only_the_id() {
        let batch = decode_all(vec![service_delete()]).unwrap();
        let ids = batch.deletes.get("service").unwrap();
        assert_eq!(ids[0], Binary::from_hex(&"cc".repeat(20)).unwrap());
    }

    #[test]
    fn upsert_row_carries_checksum_and_columns() {
        let batch = decode_all(vec![host_upsert()]).unwrap();
        let row = &batch.upserts.get("host").unwrap()[0];
        assert!(row.checksum.is_some());
        assert_eq!(row.values.len(), crate::entity::kinds::HOST.columns.len());
    }
}
