//! # logos-oplog: per-session operation logs for collaborative editing
//!
//! Stores the ordered, gapless operation log of every editing session and
//! tells interested parties when it grows. What the operations mean is up to
//! the sync layer on top; the log only keeps them consistent under
//! concurrent writers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  begin/append/end  ┌──────────────┐   txn + retry   ┌─────────────┐
//! │ Sync server │ ─────────────────► │ Coordinator  │ ──────────────► │ SessionStore│
//! │ (host)      │ ◄───────────────── │ <B, E, M, D> │                 │ (RocksDB)   │
//! └──────┬──────┘  list/get/get_data └──────┬───────┘                 └─────────────┘
//!        │                                  │ post-commit
//!        │ re-query                         ▼
//!        │                          ┌──────────────┐
//!        └───────────────────────── │ broadcast    │
//!                                   │ sinks        │
//!                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: session lifecycle, append, paginated reads
//! - [`storage`]: RocksDB store, transactions with retry, procedures
//! - [`codec`]: metadata/data column encoding
//! - [`notify`]: post-commit notifications
//! - [`error`]: error kinds

pub mod codec;
pub mod coordinator;
pub mod error;
pub mod notify;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use codec::{CodecError, ColumnType};
pub use coordinator::{
    Coordinator, CoordinatorConfig, EndContext, OperationData, SessionInfo, MAX_PAGE_LENGTH,
};
pub use error::{CoordinatorError, ErrorKind};
pub use notify::{AppendedOperation, Notifier, NotifyStats, SessionEnded};
pub use session::SessionId;
pub use storage::{RetryConfig, SessionStore, StoreConfig, StoreError, TxContext};
pub use tokio_util::sync::CancellationToken;
