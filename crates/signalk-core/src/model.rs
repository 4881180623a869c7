//! SignalK data model types.
//!
//! These types represent the normalized side of the pipeline:
//! - Delta messages produced by mappers and consumed by every later stage
//! - Source attribution for each update
//! - The single-value projection used for filtering, caching and storage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A SignalK delta message containing one or more updates.
///
/// Deltas are the primary mechanism for transmitting changes in SignalK.
/// They contain a context (which vessel/object) and a list of updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// The context path (e.g., "vessels.urn:mrn:imo:mmsi:244123456")
    pub context: String,

    /// The list of updates in this delta
    pub updates: Vec<Update>,
}

/// A single update within a delta, containing values from one source at one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// Where the values came from
    pub source: Source,

    /// UTC time of the originating frame
    pub timestamp: DateTime<Utc>,

    /// The path-value pairs in this update
    pub values: Vec<PathValue>,
}

/// A single path-value pair within an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    /// The SignalK path (e.g., "navigation.speedOverGround")
    pub path: String,

    /// The value at this path
    pub value: serde_json::Value,
}

/// Source information describing where data originated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    /// Label of the connector that collected the frame
    pub label: String,

    /// Protocol tag of the frame (e.g., "nmea0183", "modbus")
    #[serde(rename = "type")]
    pub source_type: String,

    /// NMEA 0183 talker ID (e.g., "GP", "II")
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub talker: Option<String>,

    /// NMEA 0183 sentence type (e.g., "RMC", "GGA")
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sentence: Option<String>,

    /// AIS message type (1-27)
    #[serde(rename = "aisType", skip_serializing_if = "Option::is_none", default)]
    pub ais_type: Option<u8>,
}

impl Source {
    /// Source with only label and type set.
    pub fn new(label: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            source_type: source_type.into(),
            talker: None,
            sentence: None,
            ais_type: None,
        }
    }
}

/// Projection of a delta onto one (context, path) reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleValueMapped {
    pub context: String,
    pub path: String,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source: Source,
}

impl SingleValueMapped {
    /// Wrap this reading back into a one-value delta.
    pub fn to_delta(&self) -> Delta {
        Delta {
            context: self.context.clone(),
            updates: vec![Update {
                source: self.source.clone(),
                timestamp: self.timestamp,
                values: vec![PathValue {
                    path: self.path.clone(),
                    value: self.value.clone(),
                }],
            }],
        }
    }
}

/// Reasons a delta is not well formed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("delta context is empty")]
    EmptyContext,
    #[error("delta has no updates")]
    NoUpdates,
    #[error("update {0} has no values")]
    EmptyUpdate(usize),
    #[error("value path is empty")]
    EmptyPath,
}

impl Delta {
    /// Create a delta with a single update.
    pub fn single(context: impl Into<String>, update: Update) -> Self {
        Self {
            context: context.into(),
            updates: vec![update],
        }
    }

    /// Check the structural invariants: nonempty context, at least one
    /// update, and no empty update or path.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.context.is_empty() {
            return Err(ModelError::EmptyContext);
        }
        if self.updates.is_empty() {
            return Err(ModelError::NoUpdates);
        }
        for (i, update) in self.updates.iter().enumerate() {
            if update.values.is_empty() {
                return Err(ModelError::EmptyUpdate(i));
            }
            if update.values.iter().any(|pv| pv.path.is_empty()) {
                return Err(ModelError::EmptyPath);
            }
        }
        Ok(())
    }

    /// Flatten into one record per value.
    pub fn single_values(&self) -> Vec<SingleValueMapped> {
        self.updates
            .iter()
            .flat_map(|update| {
                update.values.iter().map(move |pv| SingleValueMapped {
                    context: self.context.clone(),
                    path: pv.path.clone(),
                    value: pv.value.clone(),
                    timestamp: update.timestamp,
                    source: update.source.clone(),
                })
            })
            .collect()
    }

    /// Iterate over every value path in the delta.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.updates
            .iter()
            .flat_map(|u| u.values.iter().map(|pv| pv.path.as_str()))
    }

    /// Total number of values across all updates.
    pub fn value_count(&self) -> usize {
        self.updates.iter().map(|u| u.values.len()).sum()
    }
}

/// Position in WGS84 coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

/// Vessel length as published under `design.length`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Length {
    pub overall: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hull: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waterline: Option<f64>,
}
