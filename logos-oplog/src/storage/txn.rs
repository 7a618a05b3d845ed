//! Transaction runner: run a body transactionally, retry on transient
//! failure, then invoke a post-commit hook exactly once.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ write_transaction(body, on_commit)                       │
//! │                                                          │
//! │  attempt 0 ─► body(&WriteTx) ─► commit ── Busy ──┐       │
//! │                                                  │       │
//! │  attempt 1 ◄── backoff (2ms, 4ms, ... ≤ 100ms) ◄─┘       │
//! │      │                                                   │
//! │      └─► body(&WriteTx) ─► commit ── Ok ─► on_commit(&T) │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every attempt gets a fresh transaction and the body returns its output
//! rather than mutating captured state, so nothing from a failed attempt
//! leaks into the next one. The hook is `FnOnce`: it cannot run twice.
//!
//! Reference: Kleppmann, DDIA, Chapter 7 (Handling errors and aborts)

use rocksdb::{BoundColumnFamily, Direction, IteratorMode};
use rocksdb::{SnapshotWithThreadMode, Transaction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::session::SessionId;
use crate::storage::rocks::{SessionStore, StoreError, TxnDb};
use crate::storage::schema::{self, OperationRow, SessionRow, Tables};

// ─── Context ──────────────────────────────────────────────────────────

/// Cancellation and deadline for one coordinator call.
///
/// Checked at the start of every attempt, after each backoff, and just
/// before commit.
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl TxContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context tied to an existing cancellation token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Set an absolute deadline.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Instant::now() + timeout)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fail if the call has been cancelled or its deadline has passed.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StoreError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

// ─── Retry ────────────────────────────────────────────────────────────

/// Retry behaviour for transient transaction failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: usize,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay_ms: 2,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Fail on the first transient error.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Generous retries for heavily contended workloads (and tests).
    pub fn contended() -> Self {
        Self {
            max_retries: 1000,
            base_delay_ms: 1,
            max_delay_ms: 10,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        let shift = attempt.min(63);
        let delay_ms = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

// ─── Row access ───────────────────────────────────────────────────────

/// Read access to both relations, shared by read-only and read-write
/// transactions.
pub trait Rows {
    fn session_row(&self, session: SessionId) -> Result<Option<SessionRow>, StoreError>;

    fn operation_row(
        &self,
        session: SessionId,
        operation: u64,
    ) -> Result<Option<OperationRow>, StoreError>;

    /// Up to `limit` operation numbers strictly below `before` (or all, if
    /// `None`), newest first.
    fn operations_before(
        &self,
        session: SessionId,
        before: Option<u64>,
        limit: usize,
    ) -> Result<Vec<u64>, StoreError>;

    /// Highest operation number in the session, if any.
    fn last_operation(&self, session: SessionId) -> Result<Option<u64>, StoreError> {
        Ok(self.operations_before(session, None, 1)?.first().copied())
    }
}

/// Seek key for a descending scan, or `None` when nothing can precede `before`.
fn descending_seek_key(session: SessionId, before: Option<u64>) -> Option<[u8; 24]> {
    match before {
        None => Some(schema::operation_key(session, u64::MAX)),
        Some(0) | Some(1) => None,
        Some(b) => Some(schema::operation_key(session, b - 1)),
    }
}

fn collect_descending<I>(iter: I, session: SessionId, limit: usize) -> Result<Vec<u64>, StoreError>
where
    I: IntoIterator<Item = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>>,
{
    let mut numbers = Vec::new();
    for item in iter {
        if numbers.len() >= limit {
            break;
        }
        let (key, _) = item?;
        match schema::operation_number(&key, session) {
            Some(n) => numbers.push(n),
            None => break,
        }
    }
    Ok(numbers)
}

fn decode_session(bytes: Option<Vec<u8>>) -> Result<Option<SessionRow>, StoreError> {
    bytes.map(|b| SessionRow::decode(&b)).transpose()
}

fn decode_operation(bytes: Option<Vec<u8>>) -> Result<Option<OperationRow>, StoreError> {
    bytes.map(|b| OperationRow::decode(&b)).transpose()
}

/// Read-only view over a consistent snapshot.
pub struct ReadTx<'a> {
    snapshot: SnapshotWithThreadMode<'a, TxnDb>,
    sessions: Arc<BoundColumnFamily<'a>>,
    operations: Arc<BoundColumnFamily<'a>>,
}

impl<'a> ReadTx<'a> {
    fn new(store: &'a SessionStore, tables: &Tables) -> Result<Self, StoreError> {
        Ok(Self {
            sessions: store.cf(tables.sessions())?,
            operations: store.cf(tables.operations())?,
            snapshot: store.db().snapshot(),
        })
    }
}

impl Rows for ReadTx<'_> {
    fn session_row(&self, session: SessionId) -> Result<Option<SessionRow>, StoreError> {
        decode_session(
            self.snapshot
                .get_cf(&self.sessions, schema::session_key(session))?,
        )
    }

    fn operation_row(
        &self,
        session: SessionId,
        operation: u64,
    ) -> Result<Option<OperationRow>, StoreError> {
        decode_operation(
            self.snapshot
                .get_cf(&self.operations, schema::operation_key(session, operation))?,
        )
    }

    fn operations_before(
        &self,
        session: SessionId,
        before: Option<u64>,
        limit: usize,
    ) -> Result<Vec<u64>, StoreError> {
        let Some(seek) = descending_seek_key(session, before) else {
            return Ok(Vec::new());
        };
        let iter = self.snapshot.iterator_cf(
            &self.operations,
            IteratorMode::From(&seek[..], Direction::Reverse),
        );
        collect_descending(iter, session, limit)
    }
}

/// Read-write view inside one optimistic transaction.
pub struct WriteTx<'a> {
    txn: Transaction<'a, TxnDb>,
    sessions: Arc<BoundColumnFamily<'a>>,
    operations: Arc<BoundColumnFamily<'a>>,
}

impl<'a> WriteTx<'a> {
    fn new(store: &'a SessionStore, tables: &Tables) -> Result<Self, StoreError> {
        Ok(Self {
            sessions: store.cf(tables.sessions())?,
            operations: store.cf(tables.operations())?,
            txn: store.begin_transaction(),
        })
    }

    /// Read a session row and track it for conflict detection at commit.
    pub fn session_row_for_update(
        &self,
        session: SessionId,
    ) -> Result<Option<SessionRow>, StoreError> {
        decode_session(self.txn.get_for_update_cf(
            &self.sessions,
            schema::session_key(session),
            true,
        )?)
    }

    /// Whether an operation row exists, tracking the key for conflict
    /// detection at commit.
    pub fn operation_exists_for_update(
        &self,
        session: SessionId,
        operation: u64,
    ) -> Result<bool, StoreError> {
        Ok(self
            .txn
            .get_for_update_cf(
                &self.operations,
                schema::operation_key(session, operation),
                true,
            )?
            .is_some())
    }

    pub fn put_session(&self, session: SessionId, row: &SessionRow) -> Result<(), StoreError> {
        self.txn
            .put_cf(&self.sessions, schema::session_key(session), row.encode()?)?;
        Ok(())
    }

    pub fn put_operation(
        &self,
        session: SessionId,
        operation: u64,
        row: &OperationRow,
    ) -> Result<(), StoreError> {
        self.txn.put_cf(
            &self.operations,
            schema::operation_key(session, operation),
            row.encode()?,
        )?;
        Ok(())
    }

    /// Fold over every operation of the session in ascending order.
    pub fn fold_operations<A, F>(
        &self,
        session: SessionId,
        init: A,
        mut f: F,
    ) -> Result<A, StoreError>
    where
        F: FnMut(A, u64, OperationRow) -> Result<A, StoreError>,
    {
        let start = schema::operation_key(session, 0);
        let iter = self
            .txn
            .iterator_cf(&self.operations, IteratorMode::From(&start[..], Direction::Forward));
        let mut acc = init;
        for item in iter {
            let (key, value) = item?;
            let Some(operation) = schema::operation_number(&key, session) else {
                break;
            };
            acc = f(acc, operation, OperationRow::decode(&value)?)?;
        }
        Ok(acc)
    }

    /// Delete every operation of the session. Returns how many were removed.
    pub fn delete_operations(&self, session: SessionId) -> Result<u64, StoreError> {
        let start = schema::operation_key(session, 0);
        let keys: Vec<Box<[u8]>> = self
            .txn
            .iterator_cf(&self.operations, IteratorMode::From(&start[..], Direction::Forward))
            .map(|item| item.map(|(key, _)| key))
            .take_while(|item| match item {
                Ok(key) => schema::operation_number(key, session).is_some(),
                Err(_) => true,
            })
            .collect::<Result<_, _>>()?;

        for key in &keys {
            self.txn.delete_cf(&self.operations, key)?;
        }
        Ok(keys.len() as u64)
    }

    fn commit(self) -> Result<(), StoreError> {
        self.txn.commit()?;
        Ok(())
    }
}

impl Rows for WriteTx<'_> {
    fn session_row(&self, session: SessionId) -> Result<Option<SessionRow>, StoreError> {
        decode_session(self.txn.get_cf(&self.sessions, schema::session_key(session))?)
    }

    fn operation_row(
        &self,
        session: SessionId,
        operation: u64,
    ) -> Result<Option<OperationRow>, StoreError> {
        decode_operation(
            self.txn
                .get_cf(&self.operations, schema::operation_key(session, operation))?,
        )
    }

    fn operations_before(
        &self,
        session: SessionId,
        before: Option<u64>,
        limit: usize,
    ) -> Result<Vec<u64>, StoreError> {
        let Some(seek) = descending_seek_key(session, before) else {
            return Ok(Vec::new());
        };
        let iter = self.txn.iterator_cf(
            &self.operations,
            IteratorMode::From(&seek[..], Direction::Reverse),
        );
        collect_descending(iter, session, limit)
    }
}

// ─── Runners ──────────────────────────────────────────────────────────

/// Run `body` over a consistent snapshot, retrying transient failures.
pub fn read_transaction<T, B>(
    store: &SessionStore,
    tables: &Tables,
    ctx: &TxContext,
    retry: &RetryConfig,
    mut body: B,
) -> Result<T, StoreError>
where
    B: FnMut(&ReadTx<'_>) -> Result<T, StoreError>,
{
    let mut attempt = 0;
    loop {
        ctx.check()?;
        let outcome = ReadTx::new(store, tables).and_then(|tx| body(&tx));
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < retry.max_retries => {
                log::debug!("Read transaction attempt {attempt} failed transiently: {e}");
                backoff(ctx, retry, attempt)?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run `body` in a read-write transaction, retrying transient failures,
/// then call `on_commit` once with the committed result.
///
/// `on_commit` never runs for a failed call, and runs exactly once for a
/// successful one no matter how many attempts it took.
pub fn write_transaction<T, B, H>(
    store: &SessionStore,
    tables: &Tables,
    ctx: &TxContext,
    retry: &RetryConfig,
    mut body: B,
    on_commit: H,
) -> Result<T, StoreError>
where
    B: FnMut(&WriteTx<'_>) -> Result<T, StoreError>,
    H: FnOnce(&T),
{
    let mut attempt = 0;
    loop {
        ctx.check()?;
        let outcome = attempt_write(store, tables, ctx, &mut body);
        match outcome {
            Ok(value) => {
                on_commit(&value);
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < retry.max_retries => {
                log::debug!("Write transaction attempt {attempt} failed transiently: {e}");
                backoff(ctx, retry, attempt)?;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    log::warn!("Write transaction gave up after {} attempts: {e}", attempt + 1);
                }
                return Err(e);
            }
        }
    }
}

fn attempt_write<T, B>(
    store: &SessionStore,
    tables: &Tables,
    ctx: &TxContext,
    body: &mut B,
) -> Result<T, StoreError>
where
    B: FnMut(&WriteTx<'_>) -> Result<T, StoreError>,
{
    // Dropping an uncommitted transaction rolls it back.
    let tx = WriteTx::new(store, tables)?;
    let value = body(&tx)?;
    ctx.check()?;
    tx.commit()?;
    Ok(value)
}

fn backoff(ctx: &TxContext, retry: &RetryConfig, attempt: usize) -> Result<(), StoreError> {
    std::thread::sleep(retry.delay(attempt));
    ctx.check()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::rocks::StoreConfig;
    use std::cell::Cell;
    use uuid::Uuid;

    fn provisioned_store() -> (tempfile::TempDir, SessionStore, Tables) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let tables = Tables::for_namespace("txn_test").unwrap();
        store.provision(&tables).unwrap();
        (dir, store, tables)
    }

    fn session() -> SessionId {
        SessionId::from_uuid(Uuid::new_v4())
    }

    #[test]
    fn test_retry_delay_backoff() {
        let retry = RetryConfig {
            max_retries: 10,
            base_delay_ms: 2,
            max_delay_ms: 20,
        };
        assert_eq!(retry.delay(0), Duration::from_millis(2));
        assert_eq!(retry.delay(1), Duration::from_millis(4));
        assert_eq!(retry.delay(3), Duration::from_millis(16));
        assert_eq!(retry.delay(4), Duration::from_millis(20));
        assert_eq!(retry.delay(200), Duration::from_millis(20));
    }

    #[test]
    fn test_context_cancellation() {
        let token = CancellationToken::new();
        let ctx = TxContext::with_token(token.clone());
        assert!(ctx.check().is_ok());
        token.cancel();
        assert!(matches!(ctx.check(), Err(StoreError::Cancelled)));
    }

    #[test]
    fn test_context_deadline() {
        let ctx = TxContext::background().deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(ctx.check(), Err(StoreError::DeadlineExceeded)));
        let ctx = TxContext::background().timeout(Duration::from_secs(60));
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, store, tables) = provisioned_store();
        let ctx = TxContext::background();
        let id = session();

        write_transaction(
            &store,
            &tables,
            &ctx,
            &RetryConfig::default(),
            |tx| tx.put_session(id, &SessionRow::open(b"begin".to_vec())),
            |_| {},
        )
        .unwrap();

        let row = read_transaction(&store, &tables, &ctx, &RetryConfig::default(), |tx| {
            tx.session_row(id)
        })
        .unwrap();
        assert_eq!(row, Some(SessionRow::open(b"begin".to_vec())));
    }

    #[test]
    fn test_hook_runs_once_after_retries() {
        let (_dir, store, tables) = provisioned_store();
        let ctx = TxContext::background();
        let id = session();
        let attempts = Cell::new(0);
        let hook_calls = Cell::new(0);

        let result = write_transaction(
            &store,
            &tables,
            &ctx,
            &RetryConfig::default(),
            |tx| {
                attempts.set(attempts.get() + 1);
                tx.put_session(id, &SessionRow::open(Vec::new()))?;
                if attempts.get() < 3 {
                    return Err(StoreError::WriteConflict("simulated".into()));
                }
                Ok(attempts.get())
            },
            |value| {
                assert_eq!(*value, 3);
                hook_calls.set(hook_calls.get() + 1);
            },
        );

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.get(), 3);
        assert_eq!(hook_calls.get(), 1);
    }

    #[test]
    fn test_hook_skipped_on_failure() {
        let (_dir, store, tables) = provisioned_store();
        let hook_calls = Cell::new(0);

        let result: Result<(), _> = write_transaction(
            &store,
            &tables,
            &TxContext::background(),
            &RetryConfig::no_retry(),
            |_| Err(StoreError::WriteConflict("always".into())),
            |_| hook_calls.set(hook_calls.get() + 1),
        );

        assert!(matches!(result, Err(StoreError::WriteConflict(_))));
        assert_eq!(hook_calls.get(), 0);
    }

    #[test]
    fn test_failed_attempt_is_rolled_back() {
        let (_dir, store, tables) = provisioned_store();
        let ctx = TxContext::background();
        let id = session();

        let result: Result<(), _> = write_transaction(
            &store,
            &tables,
            &ctx,
            &RetryConfig::no_retry(),
            |tx| {
                tx.put_session(id, &SessionRow::open(Vec::new()))?;
                Err(StoreError::Cancelled)
            },
            |_| {},
        );
        assert!(result.is_err());

        let row = read_transaction(&store, &tables, &ctx, &RetryConfig::no_retry(), |tx| {
            tx.session_row(id)
        })
        .unwrap();
        assert!(row.is_none());
    }

    #[test]
    fn test_cancelled_context_never_runs_body() {
        let (_dir, store, tables) = provisioned_store();
        let token = CancellationToken::new();
        token.cancel();
        let ran = Cell::new(false);

        let result = read_transaction(
            &store,
            &tables,
            &TxContext::with_token(token),
            &RetryConfig::default(),
            |_| {
                ran.set(true);
                Ok(())
            },
        );
        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert!(!ran.get());
    }

    #[test]
    fn test_descending_scan_and_bounds() {
        let (_dir, store, tables) = provisioned_store();
        let ctx = TxContext::background();
        let a = session();
        let b = session();

        write_transaction(
            &store,
            &tables,
            &ctx,
            &RetryConfig::default(),
            |tx| {
                for n in 1..=10 {
                    let row = OperationRow {
                        data: None,
                        metadata: vec![n as u8],
                    };
                    tx.put_operation(a, n, &row)?;
                    tx.put_operation(b, n, &row)?;
                }
                Ok(())
            },
            |_| {},
        )
        .unwrap();

        read_transaction(&store, &tables, &ctx, &RetryConfig::default(), |tx| {
            assert_eq!(tx.operations_before(a, None, 3)?, vec![10, 9, 8]);
            assert_eq!(tx.operations_before(a, Some(4), 100)?, vec![3, 2, 1]);
            assert_eq!(tx.operations_before(a, Some(1), 100)?, Vec::<u64>::new());
            assert_eq!(tx.operations_before(a, Some(0), 100)?, Vec::<u64>::new());
            assert_eq!(tx.operations_before(a, Some(500), 2)?, vec![10, 9]);
            assert_eq!(tx.last_operation(b)?, Some(10));
            assert_eq!(tx.last_operation(session())?, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_operations_only_touches_one_session() {
        let (_dir, store, tables) = provisioned_store();
        let ctx = TxContext::background();
        let a = session();
        let b = session();
        let row = OperationRow {
            data: Some(b"d".to_vec()),
            metadata: b"m".to_vec(),
        };

        write_transaction(
            &store,
            &tables,
            &ctx,
            &RetryConfig::default(),
            |tx| {
                for n in 1..=5 {
                    tx.put_operation(a, n, &row)?;
                    tx.put_operation(b, n, &row)?;
                }
                Ok(())
            },
            |_| {},
        )
        .unwrap();

        let removed = write_transaction(
            &store,
            &tables,
            &ctx,
            &RetryConfig::default(),
            |tx| tx.delete_operations(a),
            |_| {},
        )
        .unwrap();
        assert_eq!(removed, 5);

        read_transaction(&store, &tables, &ctx, &RetryConfig::default(), |tx| {
            assert_eq!(tx.last_operation(a)?, None);
            assert_eq!(tx.last_operation(b)?, Some(5));
            Ok(())
        })
        .unwrap();
    }
}
