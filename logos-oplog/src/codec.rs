//! Column encoding for caller-supplied values.
//!
//! Begin/end/operation metadata and operation data are opaque to the log:
//! they are turned into bytes here, and only here, on the way into storage,
//! and turned back on the way out.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// How caller values are stored. Chosen once per coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnType {
    /// JSON text via `serde_json`. Accepts self-describing values such as
    /// `serde_json::Value`.
    #[default]
    Json,
    /// Compact binary via `bincode`. Values must not rely on
    /// `deserialize_any`.
    Binary,
}

/// Value encoding errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{column:?} encode failed: {reason}")]
    Encode { column: ColumnType, reason: String },
    #[error("{column:?} decode failed: {reason}")]
    Decode { column: ColumnType, reason: String },
}

impl ColumnType {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let encoded = match self {
            ColumnType::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            ColumnType::Binary => {
                bincode::serde::encode_to_vec(value, bincode::config::standard())
                    .map_err(|e| e.to_string())
            }
        };
        encoded.map_err(|reason| CodecError::Encode {
            column: *self,
            reason,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let decoded = match self {
            ColumnType::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
            ColumnType::Binary => {
                bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                    .map(|(value, _)| value)
                    .map_err(|e| e.to_string())
            }
        };
        decoded.map_err(|reason| CodecError::Decode {
            column: *self,
            reason,
        })
    }

    /// Encode an optional payload, keeping `None` distinct from any value.
    pub fn encode_optional<T: Serialize>(
        &self,
        value: Option<&T>,
    ) -> Result<Option<Vec<u8>>, CodecError> {
        value.map(|v| self.encode(v)).transpose()
    }

    pub fn decode_optional<T: DeserializeOwned>(
        &self,
        bytes: Option<&[u8]>,
    ) -> Result<Option<T>, CodecError> {
        bytes.map(|b| self.decode(b)).transpose()
    }
}
