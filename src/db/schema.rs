//! Table and column identifiers for type-safe query building.
//!
//! Only statically-known tables get an enum; entity tables come from the
//! registry and are addressed via `sea_query::Alias`. Schema creation is out
//! of scope — the fixed schema is assumed present.

use sea_query::Iden;

/// Replica coordination table.
#[derive(Iden)]
pub enum Instance {
    #[iden = "statesink_instance"]
    Table,
    #[iden = "id"]
    Id,
    #[iden = "environment_id"]
    EnvironmentId,
    #[iden = "heartbeat"]
    Heartbeat,
    #[iden = "responsible"]
    Responsible,
    #[iden = "icinga2_version"]
    Icinga2Version,
}

/// Columns shared by every mirrored table.
#[derive(Iden)]
pub enum Common {
    #[iden = "id"]
    Id,
    #[iden = "environment_id"]
    EnvironmentId,
    #[iden = "properties_checksum"]
    PropertiesChecksum,
}
