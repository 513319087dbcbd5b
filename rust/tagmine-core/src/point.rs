//! Points, samples and data sources

use crate::ids::{DataSourceId, PointId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sample quality as reported by the source system, preserved end-to-end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quality {
    Good,
    Bad,
    Uncertain,
    Substituted,
}

impl Quality {
    pub fn is_good(&self) -> bool {
        matches!(self, Quality::Good)
    }
}

/// Declared value type of a point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Float64,
    Int32,
    Int64,
    Bool,
    Text,
}

impl ValueKind {
    /// Whether values of this kind participate in numeric analysis
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ValueKind::Text)
    }
}

/// A measured value
// Untagged: integers must be tried before floats so `3` round-trips as an
// integer instead of widening to 3.0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Numeric view used by the behavioral and correlation stages.
    /// Booleans map to 0/1 so status points can correlate with analogs.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Text(_) => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self.as_f64(), Some(v) if v == 0.0)
    }
}

/// An addressable measurement registered with the platform
///
/// `sequence_id` is the short integer key inside the time-series store. It
/// is assigned exactly once at registration and never reused; points are
/// soft-deleted while historical rows exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    pub id: PointId,
    pub sequence_id: u32,
    pub name: String,
    pub address: String,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub value_kind: ValueKind,
    pub data_source_id: Option<DataSourceId>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}

impl Point {
    /// Text searched by pattern role naming rules
    pub fn search_text(&self) -> String {
        let mut text = String::with_capacity(
            self.name.len() + self.address.len() + self.description.as_deref().map_or(0, str::len),
        );
        text.push_str(&self.name);
        text.push(' ');
        text.push_str(&self.address);
        if let Some(desc) = &self.description {
            text.push(' ');
            text.push_str(desc);
        }
        text
    }
}

/// One observation: (sequence_id, UTC timestamp, value, quality)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub sequence_id: u32,
    pub timestamp: DateTime<Utc>,
    pub value: Value,
    pub quality: Quality,
}

/// Adapter variant of a data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    Pull,
    Push,
    Replay,
}

/// Operational status of a data source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSourceStatus {
    Active,
    Disabled,
    Error(String),
}

/// A logical connection target from which points are ingested
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: DataSourceId,
    pub name: String,
    pub kind: SourceKind,
    /// Adapter-specific connection configuration
    pub connection: String,
    pub status: DataSourceStatus,
    pub created_at: DateTime<Utc>,
}

/// A point found by adapter discovery, not yet registered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPoint {
    pub address: String,
    pub name: String,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub value_kind: ValueKind,
    /// Vendor attributes passed through untouched
    pub attributes: BTreeMap<String, String>,
}
