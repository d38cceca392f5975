//! Record envelope for stored rows.

use rkyv::{Archive, Deserialize, Serialize};

use crate::catalog::Row;
use crate::error::{Error, Result};

/// A stored row with write metadata.
///
/// The payload is the JSON form of the row, so the document bags inside it
/// stay opaque to the envelope.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Record {
    /// Serialized row.
    pub data: Vec<u8>,

    /// Write timestamp in microseconds since Unix epoch.
    pub written_at: u64,
}

impl Record {
    /// Wrap a row with the current timestamp.
    pub fn from_row(row: &Row) -> Result<Self> {
        let data = serde_json::to_vec(row).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Self {
            data,
            written_at: current_timestamp(),
        })
    }

    /// Decode the row payload.
    pub fn row(&self) -> Result<Row> {
        serde_json::from_slice(&self.data).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Serialize the record to bytes using rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a record from bytes using rkyv.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Get the current timestamp in microseconds.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
