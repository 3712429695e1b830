//! SLA projection.
//!
//! State-history events fan out to the primary `state_history` row and,
//! for hard state changes only, a derived `sla_history_state` row. Soft
//! states are check-attempt noise and never affect SLA math.

use crate::entity::kinds::{SLA_HISTORY_STATE, STATE_HISTORY};
use crate::entity::{EntityKind, EntityRow, Fields};
use crate::Result;

/// `state_type` value marking a hard state change.
pub const HARD_STATE: i64 = 1;

/// Route one state-history event to its upsert targets.
pub fn route_state(fields: &Fields) -> Result<Vec<(&'static EntityKind, EntityRow)>> {
    let mut targets = vec![(&STATE_HISTORY, STATE_HISTORY.decode_row(fields)?)];

    if fields.req_i64("state_type")? == HARD_STATE {
        targets.push((&SLA_HISTORY_STATE, SLA_HISTORY_STATE.decode_row(fields)?));
    }

    Ok(targets)
}
