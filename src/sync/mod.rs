//! Initial synchronisation.
//!
//! For each entity kind, reconciles the full `(pk, checksum)` set of the
//! streaming store against the durable store, then applies the resulting
//! candidates in dependency order: deletes walk the DAG stages backwards,
//! upserts forwards. Upserts overwrite every mirrored column, so a sync
//! interrupted by a new dump can simply start over.

pub mod delta;
pub mod runtime;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::db::{Db, BATCH_SIZE};
use crate::entity::{EntityKind, EntityRow, Fields, Registry};
use crate::redis::{config_key, RedisClient};
use crate::types::Binary;
use crate::Result;

use delta::{merge, ChecksumPair, Delta};

/// Buffer between the checksum feeders and the merge.
const PAIR_BUFFER: usize = 4096;

/// Per-kind reconciliation result: candidates plus the producer's raw JSON
/// values for the rows that need writing.
struct KindDelta {
    kind: &'static EntityKind,
    delta: Delta,
    values: HashMap<Binary, String>,
}

/// Reconciles all registry kinds once.
pub struct InitialSync {
    db: Db,
    redis: RedisClient,
    registry: Arc<Registry>,
}

impl InitialSync {
    pub fn new(db: Db, redis: RedisClient, registry: Arc<Registry>) -> Self {
        InitialSync {
            db,
            redis,
            registry,
        }
    }

    /// Run one full reconciliation pass for `env`.
    pub async fn run(&self, token: &CancellationToken, env: &Binary) -> Result<()> {
        info!("Starting full state synchronisation");

        // Read-only phase: compute every kind's delta in parallel.
        let scans = self.registry.kinds().iter().map(|kind| {
            let kind: &'static EntityKind = *kind;
            let db = self.db.clone();
            let redis = self.redis.clone();
            let token = token.clone();
            let env = env.clone();
            async move { scan_kind(&db, &redis, &token, &env, kind).await }
        });
        let deltas: Vec<KindDelta> = try_join_all(scans).await?;

        let total: usize = deltas.iter().map(|d| d.delta.len()).sum();
        info!(candidates = total, "State comparison finished");

        let mut by_kind: HashMap<&'static str, KindDelta> = deltas
            .into_iter()
            .map(|d| (d.kind.name, d))
            .collect();

        // Deletes walk the stages backwards so dependents go first.
        let stages = self.registry.stages();
        for stage in stages.iter().rev() {
            let deletes = stage.iter().filter_map(|kind| {
                let kind: &'static EntityKind = *kind;
                let ids = by_kind
                    .get(kind.name)
                    .filter(|d| !d.delta.delete.is_empty())?
                    .delta
                    .delete
                    .clone();
                let db = self.db.clone();
                let token = token.clone();
                Some(async move {
                    for chunk in ids.chunks(BATCH_SIZE) {
                        db.delete_batch(&token, kind, chunk).await?;
                    }
                    debug!(kind = kind.name, rows = ids.len(), "Synced deletes");
                    Ok::<_, crate::Error>(())
                })
            });
            try_join_all(deletes).await?;
        }

        // Upserts walk the stages forwards.
        for stage in stages.iter() {
            let upserts = stage.iter().filter_map(|kind| {
                let kind: &'static EntityKind = *kind;
                let kind_delta = by_kind.remove(kind.name)?;
                let db = self.db.clone();
                let token = token.clone();
                let env = env.clone();
                Some(async move {
                    let rows = decode_candidates(&kind_delta)?;
                    for chunk in rows.chunks(BATCH_SIZE) {
                        db.upsert_batch(&token, &env, kind, chunk).await?;
                    }
                    debug!(kind = kind.name, rows = rows.len(), "Synced upserts");
                    Ok::<_, crate::Error>(())
                })
            });
            try_join_all(upserts).await?;
        }

        info!("Full state synchronisation done");
        Ok(())
    }
}

/// Load both sides of one kind and merge them.
async fn scan_kind(
    db: &Db,
    redis: &RedisClient,
    token: &CancellationToken,
    env: &Binary,
    kind: &'static EntityKind,
) -> Result<KindDelta> {
    // Streaming-store side: one scan of the config hash. The hash is
    // unordered, so pairs are sorted before feeding the merge.
    let entries = redis.hscan_all(token, &config_key(kind.name)).await?;

    let mut values = HashMap::with_capacity(entries.len());
    let mut pairs = Vec::with_capacity(entries.len());
    for (pk_hex, raw) in entries {
        let id = Binary::from_hex(&pk_hex)?;
        let fields = Fields::from_json(kind.name, &raw)?;
        let checksum = fields.req_binary("checksum")?;
        pairs.push(ChecksumPair {
            id: id.clone(),
            checksum,
        });
        values.insert(id, raw);
    }
    pairs.sort_unstable_by(|a, b| a.id.cmp(&b.id));

    let (left_tx, left_rx) = mpsc::channel(PAIR_BUFFER);
    let left_feeder = tokio::spawn(async move {
        for pair in pairs {
            if left_tx.send(pair).await.is_err() {
                break;
            }
        }
    });

    // Durable-store side: keyset pagination, already ordered by id.
    let (right_tx, right_rx) = mpsc::channel(PAIR_BUFFER);
    let right_feeder = {
        let db = db.clone();
        let token = token.clone();
        let env = env.clone();
        tokio::spawn(async move {
            let mut after: Option<Binary> = None;
            loop {
                let page = db.checksum_page(&token, &env, kind, after.as_ref()).await?;
                let Some(last) = page.last() else {
                    return Ok::<_, crate::Error>(());
                };
                after = Some(last.0.clone());
                for (id, checksum) in page {
                    if right_tx.send(ChecksumPair { id, checksum }).await.is_err() {
                        return Ok(());
                    }
                }
            }
        })
    };

    let delta = merge(left_rx, right_rx).await;

    left_feeder.await.map_err(join_panic)?;
    right_feeder.await.map_err(join_panic)??;

    debug!(
        kind = kind.name,
        insert = delta.insert.len(),
        update = delta.update.len(),
        delete = delta.delete.len(),
        "Computed delta"
    );

    Ok(KindDelta {
        kind,
        delta,
        values,
    })
}

/// Decode the producer values for every insert and update candidate.
fn decode_candidates(kind_delta: &KindDelta) -> Result<Vec<EntityRow>> {
    let kind = kind_delta.kind;
    let mut rows =
        Vec::with_capacity(kind_delta.delta.insert.len() + kind_delta.delta.update.len());

    for id in kind_delta
        .delta
        .insert
        .iter()
        .chain(kind_delta.delta.update.iter())
    {
        let raw = kind_delta.values.get(id).ok_or_else(|| {
            crate::Error::decode(kind.name, format!("candidate {id} vanished from scan"))
        })?;
        let fields = Fields::from_json(kind.name, raw)?;
        let checksum = fields.req_binary("checksum")?;
        let values = (kind.decode)(&fields)?;
        rows.push(EntityRow {
            id: id.clone(),
            checksum: Some(checksum),
            values,
        });
    }

    Ok(rows)
}

fn join_panic(err: tokio::task::JoinError) -> crate::Error {
    crate::Error::Config(format!("sync worker panicked: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::kinds::HOSTGROUP;
    use serde_json::json;

    fn kind_delta(ids: Vec<Binary>, values: HashMap<Binary, String>) -> KindDelta {
        KindDelta {
            kind: &HOSTGROUP,
            delta: Delta {
                insert: ids,
                update: vec![],
                delete: vec![],
            },
            values,
        }
    }

    #[test]
    fn decode_candidates_builds_rows_from_scanned_json() {
        let id = Binary::from_hex(&"0a".repeat(20)).unwrap();
        let raw = json!({
            "checksum": "0b".repeat(20),
            "name": "db-servers",
            "display_name": "DB Servers"
        })
        .to_string();

        let mut values = HashMap::new();
        values.insert(id.clone(), raw);

        let rows = decode_candidates(&kind_delta(vec![id.clone()], values)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(
            rows[0].checksum,
            Some(Binary::from_hex(&"0b".repeat(20)).unwrap())
        );
        assert_eq!(rows[0].values.len(), HOSTGROUP.columns.len());
    }

    #[test]
    fn decode_candidates_fails_on_missing_value() {
        let id = Binary::from_hex(&"0a".repeat(20)).unwrap();
        let err = decode_candidates(&kind_delta(vec![id], HashMap::new())).unwrap_err();
        assert!(err.to_string().contains("vanished"));
    }

    #[test]
    fn decode_candidates_propagates_strict_decode_errors() {
        let id = Binary::from_hex(&"0a".repeat(20)).unwrap();
        // name is required for hostgroup
        let raw = json!({"checksum": "0b".repeat(20)}).to_string();
        let mut values = HashMap::new();
        values.insert(id.clone(), raw);

        assert!(decode_candidates(&kind_delta(vec![id], values)).is_err());
    }
}
