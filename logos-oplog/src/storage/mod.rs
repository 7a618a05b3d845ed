//! Durable storage for session logs.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   one txn per call   ┌─────────────────────────────────┐
//! │ Coordinator │ ───────────────────► │ SessionStore                    │
//! │             │                      │ (OptimisticTransactionDB)       │
//! └─────────────┘                      └───────────────┬─────────────────┘
//!        │                                             │ column families
//!        │ procedures                                  ▼
//!        ▼                             ┌─────────────────────────────────┐
//! ┌─────────────┐                      │ CF "<ns>.sessions":   begin/end │
//! │ append/end  │                      │ CF "<ns>.operations": the logs  │
//! │ OP001..004  │                      └─────────────────────────────────┘
//! └─────────────┘
//! ```
//!
//! ## Performance Targets
//!
//! | Metric                     | Target  |
//! |----------------------------|---------|
//! | Append (uncontended, 1KB)  | <50μs   |
//! | List page (5000 ops)       | <5ms    |
//! | End (10k ops)              | <50ms   |
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 7

pub mod procedures;
pub mod rocks;
pub mod schema;
pub mod txn;

pub use procedures::ProcedureCode;
pub use rocks::{SessionStore, StoreConfig, StoreError};
pub use schema::Tables;
pub use txn::{ReadTx, RetryConfig, Rows, TxContext, WriteTx};
