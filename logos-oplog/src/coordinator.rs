//! The session coordinator.
//!
//! ```text
//!            ┌──────────────────────────── Coordinator<B, E, M, D> ───┐
//!  begin ───►│ encode (ColumnType) ─► write_transaction ─► on_commit ─┼─► sinks
//!  append ──►│                         │                              │
//!  end ─────►│                         ▼                              │
//!            │                procedures (OP001..OP004)               │
//!  list ────►│ read_transaction ─► Rows (snapshot) ─► decode          │
//!  get* ────►│                                                        │
//!            └────────────────────────────────────────────────────────┘
//! ```
//!
//! Every public call is exactly one retried transaction. The coordinator
//! holds no locks of its own; concurrent callers are serialized only by the
//! store's optimistic conflict detection.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;

use crate::codec::ColumnType;
use crate::error::CoordinatorError;
use crate::notify::{AppendedOperation, Notifier, NotifyStats, SessionEnded};
use crate::session::SessionId;
use crate::storage::procedures::{self, ProcedureCode};
use crate::storage::rocks::{SessionStore, StoreError};
use crate::storage::schema::{OperationRow, Tables};
use crate::storage::txn::{
    read_transaction, write_transaction, RetryConfig, Rows, TxContext, WriteTx,
};

/// Upper bound on the operation numbers returned by one [`Coordinator::list`].
pub const MAX_PAGE_LENGTH: usize = 5000;

type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Prefix of the coordinator's column families
    pub namespace: String,
    /// How metadata and data values are stored
    pub column_type: ColumnType,
    pub retry: RetryConfig,
}

impl CoordinatorConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            column_type: ColumnType::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn column_type(mut self, column_type: ColumnType) -> Self {
        self.column_type = column_type;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// One stored operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationData<D, M> {
    /// `None` when the operation was appended without data
    pub data: Option<D>,
    pub metadata: M,
}

/// Begin and end metadata of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo<B, E> {
    pub begin_metadata: B,
    /// `None` while the session is open
    pub end_metadata: Option<E>,
}

/// A view of an open session handed to the callback of
/// [`Coordinator::end_with`], valid inside the End transaction only.
pub struct EndContext<'a, 't, B, D, M> {
    tx: &'a WriteTx<'t>,
    session: SessionId,
    column: ColumnType,
    begin_metadata: B,
    _types: PhantomData<fn() -> (D, M)>,
}

impl<B, D, M> EndContext<'_, '_, B, D, M>
where
    D: DeserializeOwned,
    M: DeserializeOwned,
{
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn begin_metadata(&self) -> &B {
        &self.begin_metadata
    }

    /// Number of the newest operation, or `None` for an empty log.
    pub fn last_operation(&self) -> Result<Option<u64>, CoordinatorError> {
        self.tx
            .last_operation(self.session)
            .map_err(|e| CoordinatorError::from_store(e, self.session, None, None))
    }

    pub fn get_data(&self, operation: u64) -> Result<OperationData<D, M>, CoordinatorError> {
        let row = procedures::find_operation(self.tx, self.session, operation)
            .map_err(|e| CoordinatorError::from_store(e, self.session, Some(operation), None))?;
        decode_operation(self.column, self.session, row)
    }

    /// Fold over every operation, oldest first.
    pub fn fold<A, F>(&self, init: A, mut f: F) -> Result<A, CoordinatorError>
    where
        F: FnMut(A, u64, OperationData<D, M>) -> A,
    {
        self.tx
            .fold_operations(self.session, init, |acc, operation, row| {
                let value = decode_operation(self.column, self.session, row).map_err(abort)?;
                Ok(f(acc, operation, value))
            })
            .map_err(|e| CoordinatorError::from_store(e, self.session, None, None))
    }
}

fn decode_operation<D, M>(
    column: ColumnType,
    session: SessionId,
    row: OperationRow,
) -> Result<OperationData<D, M>, CoordinatorError>
where
    D: DeserializeOwned,
    M: DeserializeOwned,
{
    let to_err = |e| CoordinatorError::codec(Some(session), e);
    Ok(OperationData {
        data: column.decode_optional(row.data.as_deref()).map_err(to_err)?,
        metadata: column.decode(&row.metadata).map_err(to_err)?,
    })
}

/// Carry a coordinator error out of a transaction body.
fn abort(err: CoordinatorError) -> StoreError {
    StoreError::Aborted(Box::new(err))
}

struct Bound {
    store: Arc<SessionStore>,
    tables: Tables,
}

/// Append-only operation log, one per session, stored under a namespace.
///
/// `B`, `E` and `M` are the begin, end and per-operation metadata types;
/// `D` is the optional per-operation payload. All four are opaque to the
/// coordinator and go through the configured [`ColumnType`].
pub struct Coordinator<B, E, M, D = ()> {
    config: CoordinatorConfig,
    notifier: Notifier,
    claimed: AtomicBool,
    bound: OnceLock<Bound>,
    _types: PhantomData<fn() -> (B, E, M, D)>,
}

impl<B, E, M, D> Coordinator<B, E, M, D>
where
    B: Serialize + DeserializeOwned,
    E: Serialize + DeserializeOwned,
    M: Serialize + DeserializeOwned,
    D: Serialize + DeserializeOwned,
{
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            notifier: Notifier::new(),
            claimed: AtomicBool::new(false),
            bound: OnceLock::new(),
            _types: PhantomData,
        }
    }

    /// Receive an [`AppendedOperation`] after every committed append.
    pub fn with_appended_sink(mut self, sink: broadcast::Sender<AppendedOperation>) -> Self {
        self.notifier.set_appended_sink(sink);
        self
    }

    /// Receive a [`SessionEnded`] after every committed end.
    pub fn with_ended_sink(mut self, sink: broadcast::Sender<SessionEnded>) -> Self {
        self.notifier.set_ended_sink(sink);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn is_initialized(&self) -> bool {
        self.bound.get().is_some()
    }

    pub fn notify_stats(&self) -> NotifyStats {
        self.notifier.stats()
    }

    /// Provision the namespace in `store` and bind the coordinator to it.
    ///
    /// Other coordinators (or processes) may provision the same namespace
    /// concurrently. A second `init` on the same coordinator fails with
    /// `AlreadyInitialized`; a failed `init` may be retried.
    pub fn init(&self, store: Arc<SessionStore>) -> Result<(), CoordinatorError> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoordinatorError::AlreadyInitialized);
        }

        match self.provision(&store) {
            Ok(tables) => {
                let bound = self.bound.set(Bound { store, tables });
                debug_assert!(bound.is_ok(), "only the init claimant binds");
                Ok(())
            }
            Err(e) => {
                self.claimed.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn provision(&self, store: &SessionStore) -> Result<Tables, CoordinatorError> {
        let namespace = &self.config.namespace;
        let tables = Tables::for_namespace(namespace).map_err(|reason| {
            CoordinatorError::InvalidNamespace {
                namespace: namespace.clone(),
                reason,
            }
        })?;
        let created = store.provision(&tables).map_err(|source| {
            log::error!("Provisioning namespace '{namespace}' failed: {source}");
            CoordinatorError::Init {
                namespace: namespace.clone(),
                source,
            }
        })?;
        log::info!(
            "Coordinator bound to namespace '{namespace}' ({created} column families created)"
        );
        Ok(tables)
    }

    fn bound(&self) -> Result<&Bound, CoordinatorError> {
        self.bound.get().ok_or(CoordinatorError::NotInitialized)
    }

    /// Start a new session and return its generated id.
    pub fn begin(&self, ctx: &TxContext, metadata: &B) -> Result<SessionId, CoordinatorError> {
        let bound = self.bound()?;
        let begin_metadata = self
            .config
            .column_type
            .encode(metadata)
            .map_err(|e| CoordinatorError::codec(None, e))?;

        // Id of the latest attempt, for error context. Nil when the call was
        // cancelled before the first attempt.
        let mut attempted = None;
        let session = write_transaction(
            &bound.store,
            &bound.tables,
            ctx,
            &self.config.retry,
            |tx| {
                let session = procedures::begin_session(tx, begin_metadata.clone())?;
                attempted = Some(session);
                Ok(session)
            },
            |_| {},
        )
        .map_err(|e| {
            let session = attempted.unwrap_or_else(|| SessionId::from(uuid::Uuid::nil()));
            CoordinatorError::from_store(e, session, None, None)
        })?;

        log::info!("Session {session} begun in '{}'", self.config.namespace);
        Ok(session)
    }

    /// Append an operation and return its number.
    ///
    /// With `expected`, the append only succeeds if `expected` is the number
    /// the operation would receive; otherwise it fails with `Conflict` and
    /// nothing is written.
    pub fn append(
        &self,
        ctx: &TxContext,
        session: SessionId,
        data: Option<&D>,
        metadata: &M,
        expected: Option<u64>,
    ) -> Result<u64, CoordinatorError> {
        let bound = self.bound()?;
        let column = self.config.column_type;
        let to_err = |e| CoordinatorError::codec(Some(session), e);
        let metadata = column.encode(metadata).map_err(to_err)?;
        let data = column.encode_optional(data).map_err(to_err)?;

        let operation = write_transaction(
            &bound.store,
            &bound.tables,
            ctx,
            &self.config.retry,
            |tx| {
                procedures::append_operation(tx, session, metadata.clone(), data.clone(), expected)
            },
            |&operation| {
                self.notifier
                    .appended(AppendedOperation { session, operation })
            },
        )
        .map_err(|e| CoordinatorError::from_store(e, session, None, expected))?;

        log::debug!("Session {session}: appended operation {operation}");
        Ok(operation)
    }

    /// End a session, deleting its operations. Returns the stored end
    /// metadata.
    pub fn end(
        &self,
        ctx: &TxContext,
        session: SessionId,
        metadata: E,
    ) -> Result<E, CoordinatorError> {
        let bound = self.bound()?;
        let end_metadata = self
            .config
            .column_type
            .encode(&metadata)
            .map_err(|e| CoordinatorError::codec(Some(session), e))?;

        let removed = write_transaction(
            &bound.store,
            &bound.tables,
            ctx,
            &self.config.retry,
            |tx| procedures::end_session(tx, session, end_metadata.clone()),
            |_| self.notifier.ended(SessionEnded { session }),
        )
        .map_err(|e| CoordinatorError::from_store(e, session, None, None))?;

        log::info!("Session {session} ended ({removed} operations removed)");
        Ok(metadata)
    }

    /// End a session with end metadata computed from its final state.
    ///
    /// `callback` sees the open session through an [`EndContext`] before
    /// anything is deleted, and returns the end metadata to store. It runs
    /// inside the End transaction and is re-run if that transaction is
    /// retried. An error from the callback aborts the End; a
    /// [`CoordinatorError`] returned through it comes back unchanged.
    pub fn end_with<F>(
        &self,
        ctx: &TxContext,
        session: SessionId,
        metadata: E,
        mut callback: F,
    ) -> Result<E, CoordinatorError>
    where
        F: FnMut(&EndContext<'_, '_, B, D, M>, &E) -> Result<E, CallbackError>,
    {
        let bound = self.bound()?;
        let column = self.config.column_type;

        let (final_metadata, removed) = write_transaction(
            &bound.store,
            &bound.tables,
            ctx,
            &self.config.retry,
            |tx| {
                let row = procedures::require_open_session(tx, session)?;
                let begin_metadata = column
                    .decode(&row.begin_metadata)
                    .map_err(|e| abort(CoordinatorError::codec(Some(session), e)))?;
                let end_ctx = EndContext {
                    tx,
                    session,
                    column,
                    begin_metadata,
                    _types: PhantomData,
                };
                let final_metadata = callback(&end_ctx, &metadata).map_err(StoreError::Aborted)?;
                let encoded = column
                    .encode(&final_metadata)
                    .map_err(|e| abort(CoordinatorError::codec(Some(session), e)))?;
                let removed = procedures::end_session(tx, session, encoded)?;
                Ok((final_metadata, removed))
            },
            |_| self.notifier.ended(SessionEnded { session }),
        )
        .map_err(|e| CoordinatorError::from_store(e, session, None, None))?;

        log::info!("Session {session} ended via callback ({removed} operations removed)");
        Ok(final_metadata)
    }

    /// Up to [`MAX_PAGE_LENGTH`] operation numbers, newest first.
    ///
    /// `before` continues a previous page: pass the last number received.
    /// An empty page is an error when the session is missing or ended, or
    /// when `before` names an operation that was never assigned.
    pub fn list(
        &self,
        ctx: &TxContext,
        session: SessionId,
        before: Option<u64>,
    ) -> Result<Vec<u64>, CoordinatorError> {
        let bound = self.bound()?;
        let page = read_transaction(&bound.store, &bound.tables, ctx, &self.config.retry, |tx| {
            let page = tx.operations_before(session, before, MAX_PAGE_LENGTH)?;
            if !page.is_empty() {
                return Ok(page);
            }
            procedures::require_open_session(tx, session)?;
            if let Some(cursor) = before {
                let last = tx.last_operation(session)?;
                if cursor == 0 || last.map_or(true, |last| cursor > last) {
                    return Err(StoreError::Procedure(ProcedureCode::OperationNotFound));
                }
            }
            Ok(page)
        })
        .map_err(|e| CoordinatorError::from_store(e, session, before, None))?;

        log::trace!("Session {session}: served page of {} before {before:?}", page.len());
        Ok(page)
    }

    /// Every operation number of the session, newest first, read page by
    /// page. Pages are separate reads and may interleave with appends.
    pub fn list_all(
        &self,
        ctx: &TxContext,
        session: SessionId,
    ) -> Result<Vec<u64>, CoordinatorError> {
        let mut all = self.list(ctx, session, None)?;
        let mut page_len = all.len();
        while page_len == MAX_PAGE_LENGTH {
            let Some(&cursor) = all.last() else { break };
            let page = self.list(ctx, session, Some(cursor))?;
            page_len = page.len();
            all.extend(page);
        }
        Ok(all)
    }

    /// Begin and end metadata of a session.
    ///
    /// Works on ended sessions too; only an unknown id fails.
    pub fn get(
        &self,
        ctx: &TxContext,
        session: SessionId,
    ) -> Result<SessionInfo<B, E>, CoordinatorError> {
        let bound = self.bound()?;
        let row = read_transaction(&bound.store, &bound.tables, ctx, &self.config.retry, |tx| {
            tx.session_row(session)?
                .ok_or(StoreError::Procedure(ProcedureCode::SessionNotFound))
        })
        .map_err(|e| CoordinatorError::from_store(e, session, None, None))?;

        let column = self.config.column_type;
        let to_err = |e| CoordinatorError::codec(Some(session), e);
        Ok(SessionInfo {
            begin_metadata: column.decode(&row.begin_metadata).map_err(to_err)?,
            end_metadata: column
                .decode_optional(row.end_metadata.as_deref())
                .map_err(to_err)?,
        })
    }

    /// Data and metadata of one operation.
    pub fn get_data(
        &self,
        ctx: &TxContext,
        session: SessionId,
        operation: u64,
    ) -> Result<OperationData<D, M>, CoordinatorError> {
        let row = self.operation_row(ctx, session, operation)?;
        decode_operation(self.config.column_type, session, row)
    }

    /// Metadata of one operation, without decoding its data.
    pub fn get_metadata(
        &self,
        ctx: &TxContext,
        session: SessionId,
        operation: u64,
    ) -> Result<M, CoordinatorError> {
        let row = self.operation_row(ctx, session, operation)?;
        self.config
            .column_type
            .decode(&row.metadata)
            .map_err(|e| CoordinatorError::codec(Some(session), e))
    }

    fn operation_row(
        &self,
        ctx: &TxContext,
        session: SessionId,
        operation: u64,
    ) -> Result<OperationRow, CoordinatorError> {
        let bound = self.bound()?;
        read_transaction(&bound.store, &bound.tables, ctx, &self.config.retry, |tx| {
            procedures::find_operation(tx, session, operation)
        })
        .map_err(|e| CoordinatorError::from_store(e, session, Some(operation), None))
    }
}
