//! Key layout and row encodings for the two relations of a namespace.
//!
//! Layout:
//! ```text
//! CF "<ns>.sessions"
//! ┌──────────────────┬──────────────────────────────────────────────┐
//! │ session (16 B)   │ SessionRow { begin_metadata, end_metadata? } │
//! └──────────────────┴──────────────────────────────────────────────┘
//!
//! CF "<ns>.operations"
//! ┌──────────────────┬──────────────────┬───────────────────────────────┐
//! │ session (16 B)   │ operation (8 BE) │ OperationRow { data?, meta }  │
//! └──────────────────┴──────────────────┴───────────────────────────────┘
//! ```
//!
//! Operation numbers are big-endian so byte order equals numeric order:
//! a reverse scan over a session prefix yields the newest operation first.

use serde::{Deserialize, Serialize};

use crate::session::SessionId;
use crate::storage::rocks::StoreError;

/// Longest namespace accepted by [`Tables::for_namespace`].
pub const MAX_NAMESPACE_LEN: usize = 64;

const SESSIONS_SUFFIX: &str = "sessions";
const OPERATIONS_SUFFIX: &str = "operations";

/// Length of an operation key: session prefix + u64.
pub const OPERATION_KEY_LEN: usize = 24;

/// Which relation a column family holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Sessions,
    Operations,
}

/// Column family names for one coordinator namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    namespace: String,
    sessions: String,
    operations: String,
}

impl Tables {
    /// Derive the column family names for `namespace`.
    ///
    /// The namespace is spliced into schema object names, so it is held to a
    /// conservative alphabet: an ASCII letter followed by letters, digits or
    /// underscores.
    pub fn for_namespace(namespace: &str) -> Result<Self, &'static str> {
        validate_namespace(namespace)?;
        Ok(Self {
            namespace: namespace.to_string(),
            sessions: format!("{namespace}.{SESSIONS_SUFFIX}"),
            operations: format!("{namespace}.{OPERATIONS_SUFFIX}"),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn sessions(&self) -> &str {
        &self.sessions
    }

    pub fn operations(&self) -> &str {
        &self.operations
    }

    /// Both relations, sessions first.
    pub fn all(&self) -> [(&str, TableKind); 2] {
        [
            (self.sessions.as_str(), TableKind::Sessions),
            (self.operations.as_str(), TableKind::Operations),
        ]
    }
}

/// Classify a column family name by its suffix (used when reopening a store).
pub fn table_kind(cf_name: &str) -> Option<TableKind> {
    let (_, suffix) = cf_name.rsplit_once('.')?;
    match suffix {
        SESSIONS_SUFFIX => Some(TableKind::Sessions),
        OPERATIONS_SUFFIX => Some(TableKind::Operations),
        _ => None,
    }
}

fn validate_namespace(namespace: &str) -> Result<(), &'static str> {
    if namespace.is_empty() {
        return Err("namespace is empty");
    }
    if namespace.len() > MAX_NAMESPACE_LEN {
        return Err("namespace is longer than 64 characters");
    }
    if !namespace.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err("namespace must start with an ASCII letter");
    }
    if !namespace
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err("namespace may only contain ASCII letters, digits and '_'");
    }
    Ok(())
}

// ─── Keys ─────────────────────────────────────────────────────────────

/// Key of a session row.
pub fn session_key(session: SessionId) -> [u8; 16] {
    *session.as_bytes()
}

/// Key of an operation row: session (16 bytes) + operation (8 bytes BE).
pub fn operation_key(session: SessionId, operation: u64) -> [u8; OPERATION_KEY_LEN] {
    let mut key = [0u8; OPERATION_KEY_LEN];
    key[..16].copy_from_slice(session.as_bytes());
    key[16..].copy_from_slice(&operation.to_be_bytes());
    key
}

/// Extract the operation number from `key` if it belongs to `session`.
///
/// Returns `None` once a scan has left the session's prefix.
pub fn operation_number(key: &[u8], session: SessionId) -> Option<u64> {
    if key.len() != OPERATION_KEY_LEN || &key[..16] != session.as_bytes() {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[16..]);
    Some(u64::from_be_bytes(buf))
}

// ─── Rows ─────────────────────────────────────────────────────────────

/// Stored form of a session. `end_metadata` is `None` while the session is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    pub begin_metadata: Vec<u8>,
    pub end_metadata: Option<Vec<u8>>,
}

impl SessionRow {
    pub fn open(begin_metadata: Vec<u8>) -> Self {
        Self {
            begin_metadata,
            end_metadata: None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.end_metadata.is_some()
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        encode_row(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        decode_row(bytes)
    }
}

/// Stored form of an operation. `data: None` is distinct from an empty payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRow {
    pub data: Option<Vec<u8>>,
    pub metadata: Vec<u8>,
}

impl OperationRow {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        encode_row(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        decode_row(bytes)
    }
}

fn encode_row<T: Serialize>(row: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(row, bincode::config::standard())
        .map_err(|e| StoreError::Encoding(e.to_string()))
}

fn decode_row<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (row, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Decoding(e.to_string()))?;
    Ok(row)
}
