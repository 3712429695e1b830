//! Typed entity registry.
//!
//! The producer serialises every mirrored record as a flat field map. Each
//! entity kind registers an explicit decoder and column list here; the
//! registry is assembled once at startup and is read-only afterwards. Its
//! order is a topological sort of the dependency DAG: inserts walk it
//! forwards, deletes backwards.

pub mod kinds;

use std::collections::HashMap;

use serde_json::Value;

use crate::error::Error;
use crate::types::{Binary, SqlValue, UnixMilli};
use crate::Result;

/// A flat field map as read from the producer: either a decoded JSON config
/// value or the field pairs of a stream message.
pub struct Fields {
    kind: &'static str,
    map: HashMap<String, Value>,
}

impl Fields {
    /// Build from stream-message string pairs.
    pub fn from_pairs(kind: &'static str, pairs: Vec<(String, String)>) -> Self {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        Fields { kind, map }
    }

    /// Parse a JSON object into a field map.
    pub fn from_json(kind: &'static str, raw: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(obj)) => Ok(Fields {
                kind,
                map: obj.into_iter().collect(),
            }),
            Ok(other) => Err(Error::decode(kind, format!("expected object, got {other}"))),
            Err(e) => Err(Error::decode(kind, e.to_string())),
        }
    }

    fn missing(&self, field: &str) -> Error {
        Error::decode(self.kind, format!("missing field {field:?}"))
    }

    fn bad(&self, field: &str, value: &Value) -> Error {
        Error::decode(self.kind, format!("field {field:?} has unusable value {value}"))
    }

    /// JSON null and an absent key are both "not present".
    fn get(&self, field: &str) -> Option<&Value> {
        self.map.get(field).filter(|v| !v.is_null())
    }

    pub fn req_str(&self, field: &str) -> Result<String> {
        match self.get(field) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(v) => Err(self.bad(field, v)),
            None => Err(self.missing(field)),
        }
    }

    pub fn opt_str(&self, field: &str) -> Result<Option<String>> {
        match self.get(field) {
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(v) => Err(self.bad(field, v)),
            None => Ok(None),
        }
    }

    pub fn req_binary(&self, field: &str) -> Result<Binary> {
        match self.get(field) {
            Some(Value::String(s)) => Binary::from_hex(s),
            Some(v) => Err(self.bad(field, v)),
            None => Err(self.missing(field)),
        }
    }

    pub fn opt_binary(&self, field: &str) -> Result<Option<Binary>> {
        match self.get(field) {
            Some(Value::String(s)) => Binary::from_hex(s).map(Some),
            Some(v) => Err(self.bad(field, v)),
            None => Ok(None),
        }
    }

    pub fn opt_i64(&self, field: &str) -> Result<Option<i64>> {
        match self.get(field) {
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| self.bad(field, &Value::Number(n.clone())))
                .map(Some),
            Some(Value::String(s)) => s
                .parse::<i64>()
                .map(Some)
                .map_err(|_| self.bad(field, &Value::String(s.clone()))),
            Some(v) => Err(self.bad(field, v)),
            None => Ok(None),
        }
    }

    pub fn req_i64(&self, field: &str) -> Result<i64> {
        self.opt_i64(field)?.ok_or_else(|| self.missing(field))
    }

    pub fn opt_f64(&self, field: &str) -> Result<Option<f64>> {
        match self.get(field) {
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(Value::String(s)) => s
                .parse::<f64>()
                .map(Some)
                .map_err(|_| self.bad(field, &Value::String(s.clone()))),
            Some(v) => Err(self.bad(field, v)),
            None => Ok(None),
        }
    }

    /// The producer writes booleans as JSON bools or as "0"/"1"/"true"/"false".
    pub fn opt_bool(&self, field: &str) -> Result<Option<bool>> {
        match self.get(field) {
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::Number(n)) => Ok(Some(n.as_i64().unwrap_or(0) != 0)),
            Some(Value::String(s)) => match s.as_str() {
                "1" | "true" => Ok(Some(true)),
                "0" | "false" => Ok(Some(false)),
                _ => Err(self.bad(field, &Value::String(s.clone()))),
            },
            Some(v) => Err(self.bad(field, v)),
            None => Ok(None),
        }
    }

    pub fn opt_millis(&self, field: &str) -> Result<Option<UnixMilli>> {
        match self.get(field) {
            Some(Value::Number(n)) => Ok(n.as_f64().map(|ms| UnixMilli(ms as i64))),
            Some(Value::String(s)) => s.parse::<UnixMilli>().map(Some),
            Some(v) => Err(self.bad(field, v)),
            None => Ok(None),
        }
    }

    pub fn req_millis(&self, field: &str) -> Result<UnixMilli> {
        self.opt_millis(field)?.ok_or_else(|| self.missing(field))
    }
}

/// A decoded row ready for the database layer: primary key, checksum for
/// config kinds, and values aligned with the kind's column list.
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub id: Binary,
    pub checksum: Option<Binary>,
    pub values: Vec<SqlValue>,
}

/// Static descriptor of one entity kind.
pub struct EntityKind {
    /// Kind name as used in producer keys and runtime messages.
    pub name: &'static str,
    /// Mirror table in the durable store.
    pub table: &'static str,
    /// Kind-specific columns; `id`, `environment_id` and (for config kinds)
    /// `properties_checksum` are prepended by the database layer.
    pub columns: &'static [&'static str],
    /// Kinds this one must be written after on insert, before on delete.
    pub dependencies: &'static [&'static str],
    /// Whether rows carry a `properties_checksum` column (config kinds do,
    /// history targets do not).
    pub has_checksum: bool,
    /// Decode the kind-specific column values from a field map.
    pub decode: fn(&Fields) -> Result<Vec<SqlValue>>,
}

impl EntityKind {
    /// Decode a complete row: pk and checksum from the standard fields,
    /// values via the kind decoder.
    pub fn decode_row(&self, fields: &Fields) -> Result<EntityRow> {
        let id = fields.req_binary("id")?;
        let checksum = if self.has_checksum {
            Some(fields.req_binary("checksum")?)
        } else {
            None
        };
        let values = (self.decode)(fields)?;
        debug_assert_eq!(values.len(), self.columns.len());
        Ok(EntityRow {
            id,
            checksum,
            values,
        })
    }
}

impl std::fmt::Debug for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityKind")
            .field("name", &self.name)
            .field("table", &self.table)
            .finish()
    }
}

/// Ordered, read-only set of entity kinds.
pub struct Registry {
    kinds: Vec<&'static EntityKind>,
}

impl Registry {
    /// The config kinds mirrored by initial sync and runtime updates, in
    /// dependency order.
    pub fn config() -> Self {
        Registry {
            kinds: kinds::CONFIG_KINDS.to_vec(),
        }
    }

    pub fn kinds(&self) -> &[&'static EntityKind] {
        &self.kinds
    }

    pub fn get(&self, name: &str) -> Option<&'static EntityKind> {
        self.kinds.iter().copied().find(|k| k.name == name)
    }

    /// Group kinds into dependency stages: stage 0 has no dependencies,
    /// stage n depends only on kinds in earlier stages. Inserts apply stages
    /// forward, deletes backward.
    pub fn stages(&self) -> Vec<Vec<&'static EntityKind>> {
        let mut depth: HashMap<&'static str, usize> = HashMap::new();
        for kind in &self.kinds {
            // Registry order is topological, so every dependency is resolved.
            let d = kind
                .dependencies
                .iter()
                .filter_map(|dep| depth.get(dep).copied())
                .max()
                .map(|d| d + 1)
                .unwrap_or(0);
            depth.insert(kind.name, d);
        }

        let max_depth = depth.values().copied().max().unwrap_or(0);
        let mut stages = vec![Vec::new(); max_depth + 1];
        for kind in &self.kinds {
            stages[depth[kind.name]].push(*kind);
        }
        stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(raw: serde_json::Value) -> Fields {
        Fields::from_json("test", &raw.to_string()).unwrap()
    }

    #[test]
    fn json_null_and_absent_are_equivalent() {
        let f = fields(json!({"a": null}));
        assert_eq!(f.opt_str("a").unwrap(), None);
        assert_eq!(f.opt_str("b").unwrap(), None);
    }

    #[test]
    fn numbers_decode_from_json_and_strings() {
        let f = fields(json!({"n": 5, "s": "7"}));
        assert_eq!(f.opt_i64("n").unwrap(), Some(5));
        assert_eq!(f.opt_i64("s").unwrap(), Some(7));
    }

    #[test]
    fn bools_accept_producer_spellings() {
        let f = fields(json!({"a": true, "b": "1", "c": "false", "d": 0}));
        assert_eq!(f.opt_bool("a").unwrap(), Some(true));
        assert_eq!(f.opt_bool("b").unwrap(), Some(true));
        assert_eq!(f.opt_bool("c").unwrap(), Some(false));
        assert_eq!(f.opt_bool("d").unwrap(), Some(false));
        assert!(f.opt_bool("missing").unwrap().is_none());
    }

    #[test]
    fn missing_required_field_names_the_kind() {
        let f = fields(json!({}));
        let err = f.req_str("name").unwrap_err();
        assert!(err.to_string().contains("test"));
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn registry_order_is_topological() {
        let registry = Registry::config();
        let mut seen = std::collections::HashSet::new();
        for kind in registry.kinds() {
            for dep in kind.dependencies {
                assert!(seen.contains(dep), "{} depends on later {}", kind.name, dep);
            }
            seen.insert(kind.name);
        }
    }

    #[test]
    fn stages_respect_dependencies() {
        let registry = Registry::config();
        let stages = registry.stages();
        let stage_of = |name: &str| {
            stages
                .iter()
                .position(|s| s.iter().any(|k| k.name == name))
                .unwrap()
        };

        assert_eq!(stage_of("host"), 0);
        assert!(stage_of("service") > stage_of("host"));
        assert!(stage_of("comment") > stage_of("service"));
        assert!(stage_of("notification") > stage_of("user"));
    }

    #[test]
    fn stream_pairs_decode_like_json() {
        let f = Fields::from_pairs(
            "test",
            vec![
                ("id".into(), "00aa".into()),
                ("checksum".into(), "bb11".into()),
                ("count".into(), "3".into()),
            ],
        );
        assert_eq!(f.req_binary("id").unwrap().to_string(), "00aa");
        assert_eq!(f.opt_i64("count").unwrap(), Some(3));
    }
}
