//! Entity kind definitions.
//!
//! One block per mirrored table: the column list and the explicit decoder.
//! Config kinds carry a `properties_checksum`; history targets are
//! append-mostly event rows keyed by event id.

use super::{EntityKind, Fields};
use crate::types::SqlValue;
use crate::Result;

// ---------------------------------------------------------------------------
// Config kinds
// ---------------------------------------------------------------------------

pub static HOST: EntityKind = EntityKind {
    name: "host",
    table: "host",
    columns: &[
        "name",
        "display_name",
        "address",
        "address6",
        "checkcommand",
        "max_check_attempts",
        "check_interval",
        "retry_interval",
        "active_checks_enabled",
        "notes",
    ],
    dependencies: &[],
    has_checksum: true,
    decode: decode_host,
};

fn decode_host(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        SqlValue::Text(f.req_str("name")?),
        f.opt_str("display_name")?.into(),
        f.opt_str("address")?.into(),
        f.opt_str("address6")?.into(),
        f.opt_str("checkcommand")?.into(),
        f.opt_i64("max_check_attempts")?.into(),
        f.opt_i64("check_interval")?.into(),
        f.opt_i64("retry_interval")?.into(),
        f.opt_bool("active_checks_enabled")?.into(),
        f.opt_str("notes")?.into(),
    ])
}

pub static HOSTGROUP: EntityKind = EntityKind {
    name: "hostgroup",
    table: "hostgroup",
    columns: &["name", "display_name"],
    dependencies: &[],
    has_checksum: true,
    decode: decode_group,
};

pub static SERVICEGROUP: EntityKind = EntityKind {
    name: "servicegroup",
    table: "servicegroup",
    columns: &["name", "display_name"],
    dependencies: &[],
    has_checksum: true,
    decode: decode_group,
};

fn decode_group(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        SqlValue::Text(f.req_str("name")?),
        f.opt_str("display_name")?.into(),
    ])
}

pub static USER: EntityKind = EntityKind {
    name: "user",
    table: "user",
    columns: &["name", "display_name", "email", "pager", "notifications_enabled"],
    dependencies: &[],
    has_checksum: true,
    decode: decode_user,
};

fn decode_user(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        SqlValue::Text(f.req_str("name")?),
        f.opt_str("display_name")?.into(),
        f.opt_str("email")?.into(),
        f.opt_str("pager")?.into(),
        f.opt_bool("notifications_enabled")?.into(),
    ])
}

pub static SERVICE: EntityKind = EntityKind {
    name: "service",
    table: "service",
    columns: &[
        "name",
        "display_name",
        "host_id",
        "checkcommand",
        "max_check_attempts",
        "check_interval",
        "retry_interval",
        "active_checks_enabled",
        "notes",
    ],
    dependencies: &["host"],
    has_checksum: true,
    decode: decode_service,
};

fn decode_service(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        SqlValue::Text(f.req_str("name")?),
        f.opt_str("display_name")?.into(),
        f.req_binary("host_id")?.into(),
        f.opt_str("checkcommand")?.into(),
        f.opt_i64("max_check_attempts")?.into(),
        f.opt_i64("check_interval")?.into(),
        f.opt_i64("retry_interval")?.into(),
        f.opt_bool("active_checks_enabled")?.into(),
        f.opt_str("notes")?.into(),
    ])
}

pub static COMMENT: EntityKind = EntityKind {
    name: "comment",
    table: "comment",
    columns: &[
        "host_id",
        "service_id",
        "author",
        "text",
        "entry_time",
        "is_persistent",
        "expire_time",
    ],
    dependencies: &["host", "service"],
    has_checksum: true,
    decode: decode_comment,
};

fn decode_comment(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        f.req_binary("host_id")?.into(),
        f.opt_binary("service_id")?.into(),
        SqlValue::Text(f.req_str("author")?),
        SqlValue::Text(f.req_str("text")?),
        f.req_millis("entry_time")?.into(),
        f.opt_bool("is_persistent")?.into(),
        f.opt_millis("expire_time")?.into(),
    ])
}

pub static DOWNTIME: EntityKind = EntityKind {
    name: "downtime",
    table: "downtime",
    columns: &[
        "host_id",
        "service_id",
        "author",
        "comment",
        "entry_time",
        "scheduled_start_time",
        "scheduled_end_time",
        "is_flexible",
        "duration",
    ],
    dependencies: &["host", "service"],
    has_checksum: true,
    decode: decode_downtime,
};

fn decode_downtime(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        f.req_binary("host_id")?.into(),
        f.opt_binary("service_id")?.into(),
        SqlValue::Text(f.req_str("author")?),
        f.opt_str("comment")?.into(),
        f.req_millis("entry_time")?.into(),
        f.opt_millis("scheduled_start_time")?.into(),
        f.opt_millis("scheduled_end_time")?.into(),
        f.opt_bool("is_flexible")?.into(),
        f.opt_i64("duration")?.into(),
    ])
}

pub static NOTIFICATION: EntityKind = EntityKind {
    name: "notification",
    table: "notification",
    columns: &[
        "name",
        "host_id",
        "service_id",
        "user_id",
        "notificationcommand",
        "times_begin",
        "times_end",
    ],
    dependencies: &["host", "service", "user"],
    has_checksum: true,
    decode: decode_notification,
};

fn decode_notification(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        SqlValue::Text(f.req_str("name")?),
        f.req_binary("host_id")?.into(),
        f.opt_binary("service_id")?.into(),
        f.opt_binary("user_id")?.into(),
        f.opt_str("notificationcommand")?.into(),
        f.opt_i64("times_begin")?.into(),
        f.opt_i64("times_end")?.into(),
    ])
}

/// Config kinds in dependency (topological) order.
pub static CONFIG_KINDS: &[&EntityKind] = &[
    &HOST,
    &HOSTGROUP,
    &USER,
    &SERVICEGROUP,
    &SERVICE,
    &COMMENT,
    &DOWNTIME,
    &NOTIFICATION,
];

// ---------------------------------------------------------------------------
// History targets
// ---------------------------------------------------------------------------

pub static STATE_HISTORY: EntityKind = EntityKind {
    name: "state_history",
    table: "state_history",
    columns: &[
        "host_id",
        "service_id",
        "event_time",
        "state_type",
        "soft_state",
        "hard_state",
        "previous_soft_state",
        "previous_hard_state",
        "check_attempt",
        "output",
    ],
    dependencies: &[],
    has_checksum: false,
    decode: decode_state_history,
};

fn decode_state_history(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        f.req_binary("host_id")?.into(),
        f.opt_binary("service_id")?.into(),
        f.req_millis("event_time")?.into(),
        SqlValue::BigInt(f.req_i64("state_type")?),
        f.opt_i64("soft_state")?.into(),
        f.opt_i64("hard_state")?.into(),
        f.opt_i64("previous_soft_state")?.into(),
        f.opt_i64("previous_hard_state")?.into(),
        f.opt_i64("check_attempt")?.into(),
        f.opt_str("output")?.into(),
    ])
}

pub static SLA_HISTORY_STATE: EntityKind = EntityKind {
    name: "sla_history_state",
    table: "sla_history_state",
    columns: &[
        "host_id",
        "service_id",
        "event_time",
        "state_type",
        "hard_state",
        "previous_hard_state",
    ],
    dependencies: &[],
    has_checksum: false,
    decode: decode_sla_history_state,
};

fn decode_sla_history_state(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        f.req_binary("host_id")?.into(),
        f.opt_binary("service_id")?.into(),
        f.req_millis("event_time")?.into(),
        SqlValue::BigInt(f.req_i64("state_type")?),
        f.opt_i64("hard_state")?.into(),
        f.opt_i64("previous_hard_state")?.into(),
    ])
}

pub static NOTIFICATION_HISTORY: EntityKind = EntityKind {
    name: "notification_history",
    table: "notification_history",
    columns: &[
        "host_id",
        "service_id",
        "notification_id",
        "type",
        "send_time",
        "state",
        "text",
    ],
    dependencies: &[],
    has_checksum: false,
    decode: decode_notification_history,
};

fn decode_notification_history(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        f.req_binary("host_id")?.into(),
        f.opt_binary("service_id")?.into(),
        f.opt_binary("notification_id")?.into(),
        f.opt_str("type")?.into(),
        f.req_millis("send_time")?.into(),
        f.opt_i64("state")?.into(),
        f.opt_str("text")?.into(),
    ])
}

pub static DOWNTIME_HISTORY: EntityKind = EntityKind {
    name: "downtime_history",
    table: "downtime_history",
    columns: &[
        "downtime_id",
        "host_id",
        "service_id",
        "entry_time",
        "author",
        "comment",
        "start_time",
        "end_time",
        "has_been_cancelled",
        "cancel_time",
    ],
    dependencies: &[],
    has_checksum: false,
    decode: decode_downtime_history,
};

fn decode_downtime_history(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        f.req_binary("downtime_id")?.into(),
        f.req_binary("host_id")?.into(),
        f.opt_binary("service_id")?.into(),
        f.req_millis("entry_time")?.into(),
        f.opt_str("author")?.into(),
        f.opt_str("comment")?.into(),
        f.opt_millis("start_time")?.into(),
        f.opt_millis("end_time")?.into(),
        f.opt_bool("has_been_cancelled")?.into(),
        f.opt_millis("cancel_time")?.into(),
    ])
}

pub static COMMENT_HISTORY: EntityKind = EntityKind {
    name: "comment_history",
    table: "comment_history",
    columns: &[
        "comment_id",
        "host_id",
        "service_id",
        "entry_time",
        "author",
        "comment",
        "expire_time",
        "remove_time",
        "has_been_removed",
    ],
    dependencies: &[],
    has_checksum: false,
    decode: decode_comment_history,
};

fn decode_comment_history(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        f.req_binary("comment_id")?.into(),
        f.req_binary("host_id")?.into(),
        f.opt_binary("service_id")?.into(),
        f.req_millis("entry_time")?.into(),
        f.opt_str("author")?.into(),
        f.opt_str("comment")?.into(),
        f.opt_millis("expire_time")?.into(),
        f.opt_millis("remove_time")?.into(),
        f.opt_bool("has_been_removed")?.into(),
    ])
}

pub static FLAPPING_HISTORY: EntityKind = EntityKind {
    name: "flapping_history",
    table: "flapping_history",
    columns: &[
        "host_id",
        "service_id",
        "start_time",
        "end_time",
        "percent_state_change_start",
        "percent_state_change_end",
        "flapping_threshold_low",
        "flapping_threshold_high",
    ],
    dependencies: &[],
    has_checksum: false,
    decode: decode_flapping_history,
};

fn decode_flapping_history(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        f.req_binary("host_id")?.into(),
        f.opt_binary("service_id")?.into(),
        f.req_millis("start_time")?.into(),
        f.opt_millis("end_time")?.into(),
        f.opt_f64("percent_state_change_start")?.into(),
        f.opt_f64("percent_state_change_end")?.into(),
        f.opt_f64("flapping_threshold_low")?.into(),
        f.opt_f64("flapping_threshold_high")?.into(),
    ])
}

pub static ACKNOWLEDGEMENT_HISTORY: EntityKind = EntityKind {
    name: "acknowledgement_history",
    table: "acknowledgement_history",
    columns: &[
        "host_id",
        "service_id",
        "set_time",
        "clear_time",
        "author",
        "comment",
        "expire_time",
        "is_sticky",
        "is_persistent",
    ],
    dependencies: &[],
    has_checksum: false,
    decode: decode_acknowledgement_history,
};

fn decode_acknowledgement_history(f: &Fields) -> Result<Vec<SqlValue>> {
    Ok(vec![
        f.req_binary("host_id")?.into(),
        f.opt_binary("service_id")?.into(),
        f.req_millis("set_time")?.into(),
        f.opt_millis("clear_time")?.into(),
        f.opt_str("author")?.into(),
        f.opt_str("comment")?.into(),
        f.opt_millis("expire_time")?.into(),
        f.opt_bool("is_sticky")?.into(),
        f.opt_bool("is_persistent")?.into(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Binary;
    use serde_json::json;

    fn host_fields() -> Fields {
        Fields::from_json(
            "host",
            &json!({
                "id": "aa".repeat(20),
                "checksum": "bb".repeat(20),
                "name": "web-01",
                "display_name": "Web 01",
                "address": "192.0.2.10",
                "address6": null,
                "max_check_attempts": 3,
                "check_interval": 60000,
                "active_checks_enabled": "1"
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn host_decodes_with_nullable_columns() {
        let row = HOST.decode_row(&host_fields()).unwrap();
        assert_eq!(row.id, Binary::from_hex(&"aa".repeat(20)).unwrap());
        assert_eq!(
            row.checksum,
            Some(Binary::from_hex(&"bb".repeat(20)).unwrap())
        );
        assert_eq!(row.values.len(), HOST.columns.len());
        assert_eq!(row.values[0], SqlValue::Text("web-01".into()));
        // address6 was JSON null, checkcommand absent: both land as NULL
        assert_eq!(row.values[3], SqlValue::Null);
        assert_eq!(row.values[4], SqlValue::Null);
        assert_eq!(row.values[8], SqlValue::Bool(true));
    }

    #[test]
    fn service_requires_host_reference() {
        let f = Fields::from_json(
            "service",
            &json!({
                "id": "cc".repeat(20),
                "checksum": "dd".repeat(20),
                "name": "http"
            })
            .to_string(),
        )
        .unwrap();

        let err = SERVICE.decode_row(&f).unwrap_err();
        assert!(err.to_string().contains("host_id"));
    }

    #[test]
    fn config_kind_without_checksum_field_is_rejected() {
        let f = Fields::from_json(
            "host",
            &json!({"id": "aa".repeat(20), "name": "web-01"}).to_string(),
        )
        .unwrap();
        assert!(HOST.decode_row(&f).is_err());
    }

    #[test]
    fn state_history_decodes_without_checksum() {
        let f = Fields::from_json(
            "state_history",
            &json!({
                "id": "01".repeat(20),
                "host_id": "aa".repeat(20),
                "event_time": "1700000000000",
                "state_type": 1,
                "soft_state": 2,
                "hard_state": 2
            })
            .to_string(),
        )
        .unwrap();

        let row = STATE_HISTORY.decode_row(&f).unwrap();
        assert!(row.checksum.is_none());
        assert_eq!(row.values[2], SqlValue::BigInt(1_700_000_000_000));
        assert_eq!(row.values[3], SqlValue::BigInt(1));
    }

    #[test]
    fn every_config_kind_column_count_matches_decoder() {
        // Exercised via decode_row's debug_assert in the other tests; here
        // just pin the registry contents.
        let names: Vec<_> = CONFIG_KINDS.iter().map(|k| k.name).collect();
        assert_eq!(
            names,
            vec![
                "host",
                "hostgroup",
                "user",
                "servicegroup",
                "service",
                "comment",
                "downtime",
                "notification"
            ]
        );
    }
}
