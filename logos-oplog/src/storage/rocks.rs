//! RocksDB-backed session store.
//!
//! One `OptimisticTransactionDB` can host any number of coordinator
//! namespaces. Each namespace owns two column families:
//! - `<ns>.sessions`: one row per session (begin/end metadata)
//! - `<ns>.operations`: the per-session operation logs
//!
//! All mutual exclusion lives in optimistic transactions: a commit that
//! touched a key written by a concurrent commit fails with `Busy`, and the
//! retry wrapper in [`txn`](super::txn) runs the body again.
//!
//! Reference: Kleppmann, DDIA, Chapter 7 (Serializable Snapshot Isolation)

use rocksdb::{
    BlockBasedOptions, BoundColumnFamily, Cache, ColumnFamilyDescriptor, DBCompressionType,
    ErrorKind, MultiThreaded, OptimisticTransactionDB, OptimisticTransactionOptions, Options,
    Transaction, WriteOptions, DB, DEFAULT_COLUMN_FAMILY_NAME,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::storage::procedures::ProcedureCode;
use crate::storage::schema::{self, TableKind, Tables};

/// The transactional database handle shared by every namespace.
pub type TxnDb = OptimisticTransactionDB<MultiThreaded>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes, shared by all column families (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every commit (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_oplog"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// RocksDB internal error (includes commit-time `Busy` conflicts)
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),
    /// A namespace's column family has not been provisioned
    #[error("column family '{0}' not found")]
    MissingColumnFamily(String),
    /// Row serialization failed
    #[error("row encoding error: {0}")]
    Encoding(String),
    /// Row deserialization failed
    #[error("row decoding error: {0}")]
    Decoding(String),
    /// A row the transaction meant to create already exists
    #[error("write conflict: {0}")]
    WriteConflict(String),
    /// A procedure rejected the call with a stable domain code
    #[error("procedure failed with {0}")]
    Procedure(ProcedureCode),
    /// The body was aborted by a caller-supplied callback
    #[error("transaction aborted: {0}")]
    Aborted(Box<dyn std::error::Error + Send + Sync>),
    /// The caller's cancellation token fired
    #[error("transaction cancelled")]
    Cancelled,
    /// The caller's deadline passed
    #[error("transaction deadline exceeded")]
    DeadlineExceeded,
}

impl StoreError {
    /// Whether re-running the transaction body may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => matches!(e.kind(), ErrorKind::Busy | ErrorKind::TryAgain),
            StoreError::WriteConflict(_) => true,
            _ => false,
        }
    }

    /// Whether the caller's cancellation signal ended the call.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled | StoreError::DeadlineExceeded)
    }

    /// The domain code raised by a procedure, if any.
    pub fn procedure_code(&self) -> Option<ProcedureCode> {
        match self {
            StoreError::Procedure(code) => Some(*code),
            _ => None,
        }
    }
}

/// RocksDB-backed store holding session and operation relations.
pub struct SessionStore {
    db: TxnDb,
    config: StoreConfig,
    cache: Cache,
}

impl SessionStore {
    /// Open the store at the configured path.
    ///
    /// Every column family already present on disk is reopened, so
    /// namespaces provisioned by an earlier process remain available.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);

        // A missing database has no column families to list yet.
        let existing = DB::list_cf(&db_opts, &config.path)
            .unwrap_or_else(|_| vec![DEFAULT_COLUMN_FAMILY_NAME.to_string()]);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = existing
            .iter()
            .map(|name| {
                let opts = match schema::table_kind(name) {
                    Some(kind) => Self::cf_options(kind, &config, &cache),
                    None => Options::default(),
                };
                ColumnFamilyDescriptor::new(name, opts)
            })
            .collect();

        let db = TxnDb::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!(
            "Opened session store at {} ({} column families)",
            config.path.display(),
            existing.len()
        );

        Ok(Self { db, config, cache })
    }

    /// Build column-family-specific options.
    fn cf_options(kind: TableKind, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match kind {
            TableKind::Sessions => {
                // Small rows, point lookups on every call
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            TableKind::Operations => {
                // Many small appends, reverse-scanned per session
                opts.set_max_write_buffer_number(4);
            }
        }

        opts
    }

    /// Create the namespace's column families if absent.
    ///
    /// Several coordinators may provision the same namespace at once; the
    /// loser of that race sees "already exists", which is not an error.
    /// Returns the number of column families this call created.
    pub fn provision(&self, tables: &Tables) -> Result<usize, StoreError> {
        let mut created = 0;
        for (name, kind) in tables.all() {
            if self.db.cf_handle(name).is_some() {
                continue;
            }
            let opts = Self::cf_options(kind, &self.config, &self.cache);
            match self.db.create_cf(name, &opts) {
                Ok(()) => {
                    created += 1;
                    log::info!("Created column family '{name}'");
                }
                Err(e) if is_already_exists(&e) => {
                    log::debug!("Column family '{name}' created concurrently");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(created)
    }

    /// Whether both of the namespace's column families exist.
    pub fn is_provisioned(&self, tables: &Tables) -> bool {
        tables
            .all()
            .iter()
            .all(|(name, _)| self.db.cf_handle(name).is_some())
    }

    /// Start an optimistic transaction that validates against a snapshot
    /// taken at begin time.
    pub(crate) fn begin_transaction(&self) -> Transaction<'_, TxnDb> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        let mut txn_opts = OptimisticTransactionOptions::new();
        txn_opts.set_snapshot(true);
        self.db.transaction_opt(&write_opts, &txn_opts)
    }

    pub(crate) fn db(&self) -> &TxnDb {
        &self.db
    }

    /// Get a column family handle.
    pub(crate) fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::MissingColumnFamily(name.to_string()))
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

fn is_already_exists(e: &rocksdb::Error) -> bool {
    e.to_string().to_ascii_lowercase().contains("already exists")
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open_close() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
    }

    #[test]
    fn test_provision_creates_column_families() {
        let (_dir, store) = open_temp();
        let tables = Tables::for_namespace("collab").unwrap();
        assert!(!store.is_provisioned(&tables));

        assert_eq!(store.provision(&tables).unwrap(), 2);
        assert!(store.is_provisioned(&tables));
        assert!(store.cf("collab.sessions").is_ok());
        assert!(store.cf("collab.operations").is_ok());
    }

    #[test]
    fn test_provision_is_idempotent() {
        let (_dir, store) = open_temp();
        let tables = Tables::for_namespace("collab").unwrap();
        assert_eq!(store.provision(&tables).unwrap(), 2);
        assert_eq!(store.provision(&tables).unwrap(), 0);
    }

    #[test]
    fn test_provision_race_is_tolerated() {
        let (_dir, store) = open_temp();
        let tables = Tables::for_namespace("raced").unwrap();

        let created: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| store.provision(&tables).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(created, 2);
        assert!(store.is_provisioned(&tables));
    }

    #[test]
    fn test_reopen_keeps_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        let tables = Tables::for_namespace("persisted").unwrap();
        {
            let store = SessionStore::open(config.clone()).unwrap();
            store.provision(&tables).unwrap();
        }
        let store = SessionStore::open(config).unwrap();
        assert!(store.is_provisioned(&tables));
        assert_eq!(store.provision(&tables).unwrap(), 0);
    }

    #[test]
    fn test_missing_column_family() {
        let (_dir, store) = open_temp();
        assert!(matches!(
            store.cf("nope.sessions"),
            Err(StoreError::MissingColumnFamily(_))
        ));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 256 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }

    #[test]
    fn test_error_classification() {
        assert!(StoreError::WriteConflict("k".into()).is_transient());
        assert!(!StoreError::Cancelled.is_transient());
        assert!(StoreError::Cancelled.is_cancelled());
        assert!(StoreError::DeadlineExceeded.is_cancelled());
        assert_eq!(
            StoreError::Procedure(ProcedureCode::Conflict).procedure_code(),
            Some(ProcedureCode::Conflict)
        );
        assert!(!StoreError::Procedure(ProcedureCode::Conflict).is_transient());
    }
}
