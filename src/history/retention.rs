//! History retention loop.
//!
//! Periodically trims every history table past its configured horizon in
//! bounded rounds. Categories without a configured horizon are never
//! touched.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RetentionConfig;
use crate::db::cleanup::CleanupStmt;
use crate::db::Db;
use crate::types::{Binary, UnixMilli};
use crate::Result;

/// Cleanup statements per retention category.
pub static STATEMENTS: &[(&str, CleanupStmt)] = &[
    (
        "notification",
        CleanupStmt {
            table: "notification_history",
            pk: "id",
            column: "send_time",
        },
    ),
    (
        "state",
        CleanupStmt {
            table: "state_history",
            pk: "id",
            column: "event_time",
        },
    ),
    (
        "downtime",
        CleanupStmt {
            table: "downtime_history",
            pk: "id",
            column: "entry_time",
        },
    ),
    (
        "comment",
        CleanupStmt {
            table: "comment_history",
            pk: "id",
            column: "entry_time",
        },
    ),
    (
        "flapping",
        CleanupStmt {
            table: "flapping_history",
            pk: "id",
            column: "start_time",
        },
    ),
    (
        "acknowledgement",
        CleanupStmt {
            table: "acknowledgement_history",
            pk: "id",
            column: "set_time",
        },
    ),
    (
        "sla",
        CleanupStmt {
            table: "sla_history_state",
            pk: "id",
            column: "event_time",
        },
    ),
];

/// Periodic cleanup of history tables.
pub struct Retention {
    db: Db,
    config: RetentionConfig,
}

impl Retention {
    pub fn new(db: Db, config: RetentionConfig) -> Self {
        Retention { db, config }
    }

    /// Run cleanup passes until the scope is cancelled. The first pass
    /// starts immediately.
    pub async fn run(&self, token: &CancellationToken, env: &Binary) -> Result<()> {
        let enabled: Vec<_> = STATEMENTS
            .iter()
            .filter_map(|(category, stmt)| {
                self.config.days_for(category).map(|days| (*category, *stmt, days))
            })
            .collect();

        if enabled.is_empty() {
            info!("History retention disabled, nothing to clean up");
            return Ok(());
        }
        info!(tables = enabled.len(), "History retention enabled");

        loop {
            for &(category, stmt, days) in &enabled {
                let horizon =
                    UnixMilli::now().saturating_sub(Duration::from_secs(days * 24 * 60 * 60));

                let deleted = self
                    .db
                    .cleanup_older_than(token, stmt, env, self.config.count, horizon)
                    .await?;

                if deleted > 0 {
                    info!(
                        category,
                        rows = deleted,
                        horizon = horizon.as_millis(),
                        "Removed old history"
                    );
                } else {
                    debug!(category, "No history past the horizon");
                }
            }

            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.interval()) => {}
            }
        }
    }
}
