//! High-availability arbiter.
//!
//! Peers sharing an Environment coordinate through the
//! `statesink_instance` table. Each heartbeat event drives one arbitration
//! round in a transaction that first seeds this replica's row, then reads
//! every peer row under `FOR UPDATE`; concurrent rounds therefore contend on
//! each other's rows (a cold-start race surfaces as a deadlock, which is
//! retryable) instead of both reading an unlocked empty set. An
//! already-responsible replica keeps responsibility unless a responsible
//! peer with a smaller instance id contends, so a transient
//! double-responsible state collapses to exactly one winner instead of
//! oscillating. All threshold comparisons use producer time carried by the
//! heartbeat, never this replica's clock.

use std::time::Duration;

use sea_query::{Expr, LockType, OnConflict, Query, Value};
use sqlx::Row;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::schema::Instance;
use crate::db::{bind_values, Db};
use crate::error::Error;
use crate::redis::heartbeat::{HeartbeatEvent, Stats};
use crate::retry;
use crate::types::{Binary, UnixMilli};
use crate::Result;

/// How stale a responsible peer's heartbeat may be before takeover.
pub const TAKEOVER_THRESHOLD: Duration = Duration::from_secs(60);

/// Edge-triggered responsibility change. Delivered over a single ordered
/// channel so a handover can never be overtaken by an older takeover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaEvent {
    /// This replica became responsible for the Environment.
    Takeover(Binary),
    /// This replica stopped being responsible.
    Handover,
}

/// One peer row as read during a round.
#[derive(Debug, Clone)]
struct PeerRow {
    id: Binary,
    heartbeat: UnixMilli,
    responsible: bool,
}

/// Outcome of one arbitration round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    Responsible,
    Standby,
}

/// Edge between two responsibility states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    None,
    Takeover,
    Handover,
}

fn transition(was_responsible: bool, is_responsible: bool) -> Transition {
    match (was_responsible, is_responsible) {
        (false, true) => Transition::Takeover,
        (true, false) => Transition::Handover,
        _ => Transition::None,
    }
}

/// Decide this round's responsibility from the locked peer rows.
///
/// A standby replica yields to any responsible peer with a fresh heartbeat.
/// A responsible replica keeps responsibility unless a fresh responsible
/// peer with a smaller id contends; smaller id wins ties deterministically.
fn decide(peers: &[PeerRow], own_id: &Binary, was_responsible: bool, now: UnixMilli) -> Round {
    let mut contenders = peers.iter().filter(|peer| {
        peer.responsible && peer.id != *own_id && now.since(peer.heartbeat) <= TAKEOVER_THRESHOLD
    });

    let yield_to_peer = if was_responsible {
        contenders.any(|peer| peer.id < *own_id)
    } else {
        contenders.next().is_some()
    };

    if yield_to_peer {
        Round::Standby
    } else {
        Round::Responsible
    }
}

/// Start the arbiter. Rounds are driven by heartbeat events; the handle
/// yields the first non-recovered error, which is fatal for the process.
pub fn start(
    db: Db,
    mut heartbeat: mpsc::Receiver<HeartbeatEvent>,
    token: CancellationToken,
) -> (mpsc::Receiver<HaEvent>, JoinHandle<Result<()>>) {
    let (events_tx, events_rx) = mpsc::channel(2);

    let handle = tokio::spawn(async move {
        let mut arbiter = Arbiter {
            db,
            token: token.clone(),
            own_id: Binary::new(uuid::Uuid::new_v4().into_bytes().to_vec()),
            responsible: false,
            environment: None,
        };
        info!(instance = %arbiter.own_id, "HA arbiter started");

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                event = heartbeat.recv() => event,
            };

            let Some(event) = event else {
                // Watcher gone; its own handle reports why.
                return Ok(());
            };

            match event {
                HeartbeatEvent::Alive(stats) => {
                    arbiter.environment = Some(stats.environment.clone());
                    let round = arbiter.realize(&stats).await?;
                    match transition(arbiter.responsible, round == Round::Responsible) {
                        Transition::Takeover => {
                            info!(environment = %stats.environment, "Taking over");
                            arbiter.responsible = true;
                            if events_tx
                                .send(HaEvent::Takeover(stats.environment.clone()))
                                .await
                                .is_err()
                            {
                                return Ok(());
                            }
                        }
                        Transition::Handover => {
                            warn!("Another replica is responsible, handing over");
                            arbiter.responsible = false;
                            if events_tx.send(HaEvent::Handover).await.is_err() {
                                return Ok(());
                            }
                        }
                        Transition::None => {}
                    }
                }
                HeartbeatEvent::Dead => {
                    if arbiter.responsible {
                        warn!("Producer is dead, handing over");
                        arbiter.responsible = false;
                        arbiter.surrender().await;
                        if events_tx.send(HaEvent::Handover).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    });

    (events_rx, handle)
}

struct Arbiter {
    db: Db,
    token: CancellationToken,
    own_id: Binary,
    responsible: bool,
    environment: Option<Binary>,
}

impl Arbiter {
    /// One arbitration round: seed our row, read peers under row locks,
    /// decide, write the outcome, reap expired peers. Retried on transient
    /// database errors including the cold-start lock deadlock.
    async fn realize(&self, stats: &Stats) -> Result<Round> {
        let db = self.db.clone();
        let own_id = self.own_id.clone();
        let was_responsible = self.responsible;
        let stats = stats.clone();

        retry::with_backoff(
            &self.token,
            move || {
                let db = db.clone();
                let own_id = own_id.clone();
                let stats = stats.clone();
                async move { round(&db, &own_id, was_responsible, &stats).await }
            },
            Error::retryable,
            retry::default_backoff(),
            self.db.retry_settings(),
        )
        .await
    }

    /// Flip our own responsibility flag off after a producer death. The row
    /// stays present so peers still see us. Best effort: a failure here only
    /// delays what the stale heartbeat already conveys.
    async fn surrender(&self) {
        let Some(environment) = &self.environment else {
            return;
        };

        let (sql, values) = Query::update()
            .table(Instance::Table)
            .value(Instance::Responsible, "n")
            .and_where(Expr::col(Instance::Id).eq(self.own_id.as_slice().to_vec()))
            .and_where(
                Expr::col(Instance::EnvironmentId).eq(environment.as_slice().to_vec()),
            )
            .build_any(self.db.dialect().query_builder());

        if let Err(err) = self.db.execute_retry(&self.token, &sql, &values).await {
            if !err.is_cancelled() {
                error!(error = %err, "Can't surrender responsibility in instance table");
            }
        }
    }
}

/// The transactional body of one round.
async fn round(db: &Db, own_id: &Binary, was_responsible: bool, stats: &Stats) -> Result<Round> {
    let now = stats.time;
    let env = &stats.environment;

    let mut tx = db.pool().begin().await?;

    // Seed our row first (as standby when new, preserving the flag when
    // present) so the peer read below always has rows to lock; two replicas
    // racing a cold start then deadlock on each other's seed and one round
    // retries instead of both reading an unlocked empty set.
    let (sql, values) = Query::insert()
        .into_table(Instance::Table)
        .columns([
            Instance::Id,
            Instance::EnvironmentId,
            Instance::Heartbeat,
            Instance::Responsible,
            Instance::Icinga2Version,
        ])
        .values([
            Value::Bytes(Some(Box::new(own_id.as_slice().to_vec()))).into(),
            Value::Bytes(Some(Box::new(env.as_slice().to_vec()))).into(),
            Value::BigInt(Some(now.as_millis())).into(),
            Value::String(Some(Box::new("n".to_string()))).into(),
            Value::String(stats.version.clone().map(Box::new)).into(),
        ])
        .map_err(|e| Error::Config(e.to_string()))?
        .on_conflict(
            OnConflict::column(Instance::Id)
                .update_columns([Instance::Heartbeat, Instance::Icinga2Version])
                .to_owned(),
        )
        .build_any(db.dialect().query_builder());

    bind_values(sqlx::query(&sql), &values)
        .execute(&mut *tx)
        .await?;

    let (sql, values) = Query::select()
        .columns([Instance::Id, Instance::Heartbeat, Instance::Responsible])
        .from(Instance::Table)
        .and_where(Expr::col(Instance::EnvironmentId).eq(env.as_slice().to_vec()))
        .lock(LockType::Update)
        .build_any(db.dialect().query_builder());

    let rows = bind_values(sqlx::query(&sql), &values)
        .fetch_all(&mut *tx)
        .await?;

    let mut peers = Vec::with_capacity(rows.len());
    for row in rows {
        let id: Vec<u8> = row.try_get(0)?;
        let heartbeat: i64 = row.try_get(1)?;
        let responsible: String = row.try_get(2)?;
        peers.push(PeerRow {
            id: Binary::new(id),
            heartbeat: UnixMilli(heartbeat),
            responsible: responsible == "y",
        });
    }

    let outcome = decide(&peers, own_id, was_responsible, now);
    let responsible_flag = match outcome {
        Round::Responsible => "y",
        Round::Standby => "n",
    };

    let (sql, values) = Query::update()
        .table(Instance::Table)
        .value(Instance::Responsible, responsible_flag)
        .and_where(Expr::col(Instance::Id).eq(own_id.as_slice().to_vec()))
        .build_any(db.dialect().query_builder());

    bind_values(sqlx::query(&sql), &values)
        .execute(&mut *tx)
        .await?;

    if outcome == Round::Responsible {
        let expiry = now.saturating_sub(TAKEOVER_THRESHOLD);
        let (sql, values) = Query::delete()
            .from_table(Instance::Table)
            .and_where(Expr::col(Instance::EnvironmentId).eq(env.as_slice().to_vec()))
            .and_where(Expr::col(Instance::Heartbeat).lt(expiry.as_millis()))
            .and_where(Expr::col(Instance::Id).ne(own_id.as_slice().to_vec()))
            .build_any(db.dialect().query_builder());

        let reaped = bind_values(sqlx::query(&sql), &values)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if reaped > 0 {
            debug!(rows = reaped, "Reaped expired instance rows");
        }
    }

    tx.commit().await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u8, heartbeat: i64, responsible: bool) -> PeerRow {
        PeerRow {
            id: Binary::new(vec![id; 16]),
            heartbeat: UnixMilli(heartbeat),
            responsible,
        }
    }

    fn own(id: u8) -> Binary {
        Binary::new(vec![id; 16])
    }

    const NOW: UnixMilli = UnixMilli(1_700_000_000_000);

    #[test]
    fn transitions_are_edge_triggered() {
        assert_eq!(transition(false, true), Transition::Takeover);
        assert_eq!(transition(true, false), Transition::Handover);
        assert_eq!(transition(true, true), Transition::None);
        assert_eq!(transition(false, false), Transition::None);
    }

    #[test]
    fn fresh_responsible_peer_blocks_takeover() {
        let peers = vec![peer(2, NOW.as_millis() - 5_000, true)];
        assert_eq!(decide(&peers, &own(1), false, NOW), Round::Standby);
    }

    #[test]
    fn stale_responsible_peer_allows_takeover() {
        let stale = NOW.as_millis() - TAKEOVER_THRESHOLD.as_millis() as i64 - 1;
        let peers = vec![peer(2, stale, true)];
        assert_eq!(decide(&peers, &own(1), false, NOW), Round::Responsible);
    }

    #[test]
    fn own_row_does_not_block_takeover() {
        let peers = vec![PeerRow {
            id: own(1),
            heartbeat: NOW,
            responsible: true,
        }];
        assert_eq!(decide(&peers, &own(1), false, NOW), Round::Responsible);
    }

    #[test]
    fn standby_peers_do_not_block_takeover() {
        let peers = vec![
            peer(2, NOW.as_millis() - 1_000, false),
            peer(3, NOW.as_millis() - 2_000, false),
        ];
        assert_eq!(decide(&peers, &own(1), false, NOW), Round::Responsible);
    }

    #[test]
    fn threshold_boundary_is_inclusive_for_the_holder() {
        let at_threshold = NOW.as_millis() - TAKEOVER_THRESHOLD.as_millis() as i64;
        let peers = vec![peer(2, at_threshold, true)];
        assert_eq!(decide(&peers, &own(1), false, NOW), Round::Standby);
    }

    #[test]
    fn responsible_replica_keeps_against_higher_id_contender() {
        // Both ended up responsible after a cold-start race; the smaller id
        // keeps responsibility rather than both yielding and oscillating.
        let peers = vec![peer(9, NOW.as_millis() - 1_000, true)];
        assert_eq!(decide(&peers, &own(1), true, NOW), Round::Responsible);
    }

    #[test]
    fn responsible_replica_yields_to_lower_id_contender() {
        let peers = vec![peer(1, NOW.as_millis() - 1_000, true)];
        assert_eq!(decide(&peers, &own(9), true, NOW), Round::Standby);
    }

    #[test]
    fn double_responsible_state_collapses_to_one_winner() {
        // Symmetric state: both replicas responsible, both fresh. Exactly
        // one of the two decisions may keep responsibility.
        let a = own(1);
        let b = own(9);
        let rows_seen_by_a = vec![peer(9, NOW.as_millis(), true)];
        let rows_seen_by_b = vec![peer(1, NOW.as_millis(), true)];

        let a_keeps = decide(&rows_seen_by_a, &a, true, NOW) == Round::Responsible;
        let b_keeps = decide(&rows_seen_by_b, &b, true, NOW) == Round::Responsible;
        assert!(a_keeps ^ b_keeps);
    }

    #[test]
    fn standby_still_yields_to_higher_id_holder() {
        // Tie-breaking only applies between responsible contenders; a
        // standby replica never preempts a fresh holder with a larger id.
        let peers = vec![peer(9, NOW.as_millis() - 1_000, true)];
        assert_eq!(decide(&peers, &own(1), false, NOW), Round::Standby);
    }
}
