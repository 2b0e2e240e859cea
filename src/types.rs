//! Core types for the datalogger.

use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::path::PathBuf;

/// Width of an encoded timestamp cell, in bytes.
pub const TIMESTAMP_WIDTH: usize = 32;

/// Maximum encoded length of a text value, in bytes.
pub const MAX_TEXT_LEN: usize = 256;

/// Domain assigned to entity identifiers without a `domain.` prefix.
pub const UNKNOWN_DOMAIN: &str = "unknown";

/// Attributes copied onto a series node whenever a record carries them.
pub const STATIC_ATTRIBUTES: [&str; 6] = [
    "friendly_name",
    "unit_of_measurement",
    "device_class",
    "state_class",
    "area_id",
    "device_id",
];

/// Domain of an entity identifier (`sensor.temp` -> `sensor`).
pub fn domain_of(entity_id: &str) -> String {
    match entity_id.split_once('.') {
        Some((domain, _)) => domain.to_lowercase(),
        None => UNKNOWN_DOMAIN.to_string(),
    }
}

/// Identifier of one monitored entity, unique within a day-file.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesId(String);

impl SeriesId {
    /// Build a series identifier. Empty identifiers are rejected.
    pub fn new(entity_id: impl Into<String>) -> Option<Self> {
        let entity_id = entity_id.into();
        if entity_id.is_empty() {
            None
        } else {
            Some(SeriesId(entity_id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace domain this series lives under.
    pub fn domain(&self) -> String {
        domain_of(&self.0)
    }
}

impl fmt::Debug for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeriesId({})", self.0)
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed-width UTC timestamp string (`2026-10-15T06:11:00.123456Z`).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(String);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        Self::from_utc(Utc::now())
    }

    /// Format a UTC instant with microsecond precision and a `Z` suffix.
    pub fn from_utc(at: DateTime<Utc>) -> Self {
        Timestamp(at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string())
    }

    /// Validate an already formatted timestamp.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() || s.len() > TIMESTAMP_WIDTH || !s.is_ascii() || s.contains('\0') {
            return Err(StoreError::InvalidTimestamp(s.to_string()));
        }
        Ok(Timestamp(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encode as a NUL-padded fixed-width cell.
    pub fn to_bytes(&self) -> [u8; TIMESTAMP_WIDTH] {
        let mut cell = [0u8; TIMESTAMP_WIDTH];
        cell[..self.0.len()].copy_from_slice(self.0.as_bytes());
        cell
    }

    /// Decode a NUL-padded fixed-width cell.
    pub fn from_bytes(cell: &[u8]) -> Result<Self> {
        let end = cell.iter().position(|&b| b == 0).unwrap_or(cell.len());
        let s = std::str::from_utf8(&cell[..end])
            .map_err(|_| StoreError::InvalidTimestamp(format!("{:?}", &cell[..end])))?;
        Self::parse(s)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Text value bounded to [`MAX_TEXT_LEN`] bytes.
///
/// Longer input is cut at the last character boundary that fits. This is a
/// property of the storage cell, so the stored value may be a prefix of the
/// observed one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BoundedText(String);

impl BoundedText {
    pub fn new(raw: &str) -> Self {
        if raw.len() <= MAX_TEXT_LEN {
            return BoundedText(raw.to_string());
        }
        let mut end = MAX_TEXT_LEN;
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        BoundedText(raw[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `raw` would be stored unchanged.
    pub fn fits(raw: &str) -> bool {
        raw.len() <= MAX_TEXT_LEN
    }
}

impl fmt::Display for BoundedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value type of a series, fixed by its first observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Float,
    Text,
}

impl ValueKind {
    /// Numeric-parseable values bind a float series, anything else text.
    pub fn infer(raw: &str) -> Self {
        if parse_number(raw).is_some() {
            ValueKind::Float
        } else {
            ValueKind::Text
        }
    }
}

/// Parse a raw state as a number, tolerating surrounding whitespace.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok()
}

/// A single observation.
#[derive(Clone, Debug)]
pub enum Value {
    Float(f64),
    Text(BoundedText),
}

impl Value {
    /// Coerce a raw state into a series of the given kind.
    ///
    /// A float series receiving a non-numeric value stores NaN.
    pub fn coerce(kind: ValueKind, raw: &str) -> Self {
        match kind {
            ValueKind::Float => Value::Float(parse_number(raw).unwrap_or(f64::NAN)),
            ValueKind::Text => Value::Text(BoundedText::new(raw)),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Float(_) => None,
            Value::Text(t) => Some(t.as_str()),
        }
    }
}

// NaN sentinels compare equal to each other.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(t) => write!(f, "{}", t),
        }
    }
}

/// One entity state as reported by the hub's state API.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(default)]
    pub entity_id: String,

    /// Raw state. Non-string JSON values are stringified, `null` is empty.
    #[serde(default, deserialize_with = "deserialize_state")]
    pub state: String,

    #[serde(default, deserialize_with = "deserialize_attributes")]
    pub attributes: Map<String, JsonValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl StateRecord {
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: Map::new(),
            last_updated: None,
        }
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

fn deserialize_state<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(match JsonValue::deserialize(d)? {
        JsonValue::String(s) => s,
        JsonValue::Null => String::new(),
        other => other.to_string(),
    })
}

fn deserialize_attributes<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Map<String, JsonValue>, D::Error> {
    Ok(Option::<Map<String, JsonValue>>::deserialize(d)?.unwrap_or_default())
}

/// Statistics of one ingest batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub appended_points: u64,
    pub skipped_points: u64,
    pub file_path: PathBuf,
}
