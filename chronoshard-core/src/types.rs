//! Core types for ChronoShard

use crate::{ChunkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Monotonically assigned chunk identifier
pub type ChunkId = u64;

/// Age or width expressed in nanoseconds
pub type Nanos = i64;

/// Floor `ts` onto a grid of `width` nanoseconds anchored at the epoch.
///
/// Fails with `InvalidFormat` when the grid point lies below
/// `Timestamp::MIN`, which happens within one width of it.
pub fn align_down(ts: Timestamp, width: Nanos) -> Result<Timestamp> {
    ts.div_euclid(width).checked_mul(width).ok_or_else(|| {
        ChunkError::InvalidFormat(format!(
            "Timestamp {} has no aligned start at width {}",
            ts, width
        ))
    })
}

/// The grid cell `[start, start + width)` holding `ts`.
///
/// Fails with `InvalidFormat` unless both bounds are representable.
pub fn grid_cell(ts: Timestamp, width: Nanos) -> Result<TimeRange> {
    let start = align_down(ts, width)?;
    let end = start.checked_add(width).ok_or_else(|| {
        ChunkError::InvalidFormat(format!(
            "Timestamp {} has no representable end at width {}",
            ts, width
        ))
    })?;
    Ok(TimeRange::new(start, end))
}

/// Start of the UTC calendar day containing `ts`.
pub fn floor_day(ts: Timestamp) -> Result<Timestamp> {
    align_down(ts, crate::config::DAY)
}

/// Parse a compact duration such as `"90d"`, `"12h"`, `"30m"`, `"15s"` or `"250ms"`.
pub fn parse_duration(s: &str) -> Result<Nanos> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ChunkError::Config(format!("Duration {:?} is missing a unit", s)))?;
    let (digits, unit) = s.split_at(split);
    let value: i64 = digits
        .parse()
        .map_err(|_| ChunkError::Config(format!("Invalid duration: {:?}", s)))?;
    let scale = match unit {
        "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" => crate::config::SECOND,
        "m" => 60 * crate::config::SECOND,
        "h" => crate::config::HOUR,
        "d" => crate::config::DAY,
        "w" => 7 * crate::config::DAY,
        _ => return Err(ChunkError::Config(format!("Unknown duration unit {:?}", unit))),
    };
    value
        .checked_mul(scale)
        .ok_or_else(|| ChunkError::Config(format!("Duration {:?} overflows", s)))
}

/// Render nanoseconds using the largest unit that divides them evenly.
pub fn format_duration(nanos: Nanos) -> String {
    const UNITS: [(&str, i64); 5] = [
        ("d", crate::config::DAY),
        ("h", crate::config::HOUR),
        ("m", 60 * crate::config::SECOND),
        ("s", crate::config::SECOND),
        ("ms", 1_000_000),
    ];
    for (suffix, scale) in UNITS {
        if nanos != 0 && nanos % scale == 0 {
            return format!("{}{}", nanos / scale, suffix);
        }
    }
    format!("{}ns", nanos)
}

/// Field values container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fields(pub BTreeMap<String, FieldValue>);

impl Fields {
    /// Create empty fields
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Add a field
    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.0.insert(key.into(), value);
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    /// Get a numeric field as f64
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(FieldValue::as_f64)
    }

    /// Iterate over fields
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Fields {
    fn default() -> Self {
        Self::new()
    }
}

/// Possible field value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit float
    Float(f64),
    /// Boolean
    Boolean(bool),
    /// String
    String(String),
}

impl FieldValue {
    /// Get as f64 if possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Get as i64 if possible
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            FieldValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Text form used when the value acts as a segmentation key
    pub fn segment_label(&self) -> String {
        match self {
            FieldValue::Integer(v) => v.to_string(),
            FieldValue::Float(v) => v.to_string(),
            FieldValue::Boolean(v) => v.to_string(),
            FieldValue::String(s) => s.clone(),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

/// Identity of a row within its collection
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub time: Timestamp,
    pub entity: String,
    pub discriminator: Option<i64>,
}

/// An application record of a time-series collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Timestamp in nanoseconds
    pub time: Timestamp,
    /// Entity key, e.g. a contract identifier
    pub entity: String,
    /// Disambiguates rows sharing time and entity (trade id, sequence number)
    #[serde(default)]
    pub discriminator: Option<i64>,
    /// Field values
    #[serde(default)]
    pub fields: Fields,
}

impl Row {
    /// Create a new row without fields
    pub fn new(time: Timestamp, entity: impl Into<String>) -> Self {
        Self {
            time,
            entity: entity.into(),
            discriminator: None,
            fields: Fields::new(),
        }
    }

    /// Add a field to the row
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name, value.into());
        self
    }

    /// Set the discriminator
    pub fn with_discriminator(mut self, discriminator: i64) -> Self {
        self.discriminator = Some(discriminator);
        self
    }

    /// Unique key of this row
    pub fn key(&self) -> RowKey {
        RowKey {
            time: self.time,
            entity: self.entity.clone(),
            discriminator: self.discriminator,
        }
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (exclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Range covering every representable timestamp
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Duration in nanoseconds
    pub fn duration(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
