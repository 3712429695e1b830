//! Value types shared across the replication engine.
//!
//! The producer exchanges identifiers as lowercase hex strings and
//! timestamps as millisecond epoch values; the durable store sees binary
//! columns and `BIGINT` columns. `Binary` and `UnixMilli` bridge the two,
//! and `SqlValue` is the dynamic value an entity row carries per column.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Opaque fixed-width binary identifier (primary keys, checksums, the
/// environment id). Ordered bytewise, which matches the producer's
/// lexicographic hex ordering.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Binary(Vec<u8>);

impl Binary {
    pub fn new(bytes: Vec<u8>) -> Self {
        Binary(bytes)
    }

    /// Parse from the producer's lowercase hex representation.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        hex::decode(s)
            .map(Binary)
            .map_err(|e| Error::decode("binary id", format!("invalid hex {s:?}: {e}")))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<u8>> for Binary {
    fn from(bytes: Vec<u8>) -> Self {
        Binary(bytes)
    }
}

impl fmt::Display for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Binary({})", hex::encode(&self.0))
    }
}

impl Serialize for Binary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Binary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map(Binary)
            .map_err(|e| D::Error::custom(format!("invalid hex {s:?}: {e}")))
    }
}

/// Milliseconds since the Unix epoch, as carried by the producer and stored
/// in `BIGINT` columns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixMilli(pub i64);

impl UnixMilli {
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        UnixMilli(ms)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// The duration elapsed since `earlier`, zero if `earlier` is later.
    pub fn since(self, earlier: UnixMilli) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        UnixMilli(self.0.saturating_sub(d.as_millis() as i64))
    }
}

impl FromStr for UnixMilli {
    type Err = Error;

    /// Parses the producer's textual timestamps. Integral values are taken
    /// as-is; fractional values are truncated to whole milliseconds.
    fn from_str(s: &str) -> Result<Self, Error> {
        if let Ok(ms) = s.parse::<i64>() {
            return Ok(UnixMilli(ms));
        }
        s.parse::<f64>()
            .map(|ms| UnixMilli(ms as i64))
            .map_err(|e| Error::decode("timestamp", format!("{s:?}: {e}")))
    }
}

/// Dynamic column value of a mirrored row.
///
/// JSON `null` and absent keys both map to `Null`, which the database layer
/// binds as SQL NULL.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    BigInt(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<SqlValue> for sea_query::Value {
    fn from(v: SqlValue) -> sea_query::Value {
        match v {
            // NULL needs a concrete type tag for the builder; text is
            // accepted by every backend for untyped NULL placeholders.
            SqlValue::Null => sea_query::Value::String(None),
            SqlValue::Bool(b) => sea_query::Value::Bool(Some(b)),
            SqlValue::BigInt(i) => sea_query::Value::BigInt(Some(i)),
            SqlValue::Double(d) => sea_query::Value::Double(Some(d)),
            SqlValue::Text(s) => sea_query::Value::String(Some(Box::new(s))),
            SqlValue::Blob(b) => sea_query::Value::Bytes(Some(Box::new(b))),
        }
    }
}

impl From<Option<String>> for SqlValue {
    fn from(v: Option<String>) -> Self {
        v.map(SqlValue::Text).unwrap_or(SqlValue::Null)
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(v: Option<i64>) -> Self {
        v.map(SqlValue::BigInt).unwrap_or(SqlValue::Null)
    }
}

impl From<Option<bool>> for SqlValue {
    fn from(v: Option<bool>) -> Self {
        v.map(SqlValue::Bool).unwrap_or(SqlValue::Null)
    }
}

impl From<Option<f64>> for SqlValue {
    fn from(v: Option<f64>) -> Self {
        v.map(SqlValue::Double).unwrap_or(SqlValue::Null)
    }
}

impl From<Binary> for SqlValue {
    fn from(v: Binary) -> Self {
        SqlValue::Blob(v.into_vec())
    }
}

impl From<Option<Binary>> for SqlValue {
    fn from(v: Option<Binary>) -> Self {
        v.map(|b| SqlValue::Blob(b.into_vec())).unwrap_or(SqlValue::Null)
    }
}

impl From<UnixMilli> for SqlValue {
    fn from(v: UnixMilli) -> Self {
        SqlValue::BigInt(v.0)
    }
}

impl From<Option<UnixMilli>> for SqlValue {
    fn from(v: Option<UnixMilli>) -> Self {
        v.map(|t| SqlValue::BigInt(t.0)).unwrap_or(SqlValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_hex_round_trip() {
        let b = Binary::from_hex("001122aabbcc").unwrap();
        assert_eq!(b.len(), 6);
        assert_eq!(b.to_string(), "001122aabbcc");
    }

    #[test]
    fn binary_rejects_bad_hex() {
        assert!(Binary::from_hex("zz").is_err());
        assert!(Binary::from_hex("abc").is_err());
    }

    #[test]
    fn binary_orders_bytewise() {
        let a = Binary::from_hex("00ff").unwrap();
        let b = Binary::from_hex("0100").unwrap();
        assert!(a < b);
    }

    #[test]
    fn unix_milli_parses_integral_and_fractional() {
        assert_eq!("1700000000000".parse::<UnixMilli>().unwrap().0, 1_700_000_000_000);
        assert_eq!("1700000000000.75".parse::<UnixMilli>().unwrap().0, 1_700_000_000_000);
        assert!("soon".parse::<UnixMilli>().is_err());
    }

    #[test]
    fn unix_milli_since_saturates() {
        let early = UnixMilli(1_000);
        let late = UnixMilli(4_000);
        assert_eq!(late.since(early), Duration::from_secs(3));
        assert_eq!(early.since(late), Duration::ZERO);
    }

    #[test]
    fn nullable_conversions_map_none_to_null() {
        assert_eq!(SqlValue::from(None::<String>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(7i64)), SqlValue::BigInt(7));
        assert_eq!(
            SqlValue::from(Some("up".to_string())),
            SqlValue::Text("up".into())
        );
    }
}
