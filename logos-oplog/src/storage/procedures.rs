//! The two atomic procedures of a namespace: `append_operation` and
//! `end_session`.
//!
//! Each runs its check-then-write steps inside one optimistic transaction.
//! Domain failures leave the procedure as a stable [`ProcedureCode`] wrapped
//! in [`StoreError::Procedure`]; the coordinator translates the code back
//! into a domain error at its edge. The codes are part of the storage
//! contract and must not be renumbered.

use std::fmt;

use crate::session::SessionId;
use crate::storage::rocks::StoreError;
use crate::storage::schema::{OperationRow, SessionRow};
use crate::storage::txn::{Rows, WriteTx};

/// Stable domain error codes raised by procedures and lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureCode {
    /// `OP001`: no session with that id
    SessionNotFound,
    /// `OP002`: the session already has end metadata
    SessionEnded,
    /// `OP003`: expected operation number differs from the next one
    Conflict,
    /// `OP004`: the operation number was never assigned
    OperationNotFound,
}

impl ProcedureCode {
    /// The wire form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcedureCode::SessionNotFound => "OP001",
            ProcedureCode::SessionEnded => "OP002",
            ProcedureCode::Conflict => "OP003",
            ProcedureCode::OperationNotFound => "OP004",
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "OP001" => Some(ProcedureCode::SessionNotFound),
            "OP002" => Some(ProcedureCode::SessionEnded),
            "OP003" => Some(ProcedureCode::Conflict),
            "OP004" => Some(ProcedureCode::OperationNotFound),
            _ => None,
        }
    }
}

impl fmt::Display for ProcedureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ProcedureCode::SessionNotFound => "session not found",
            ProcedureCode::SessionEnded => "session already ended",
            ProcedureCode::Conflict => "expected operation conflict",
            ProcedureCode::OperationNotFound => "operation not found",
        };
        write!(f, "{} ({reason})", self.as_str())
    }
}

fn raise<T>(code: ProcedureCode) -> Result<T, StoreError> {
    Err(StoreError::Procedure(code))
}

/// Load a session that must exist and still be open.
pub fn require_open_session<R: Rows + ?Sized>(
    rows: &R,
    session: SessionId,
) -> Result<SessionRow, StoreError> {
    match rows.session_row(session)? {
        None => raise(ProcedureCode::SessionNotFound),
        Some(row) if row.is_ended() => raise(ProcedureCode::SessionEnded),
        Some(row) => Ok(row),
    }
}

/// Same as [`require_open_session`], but tracks the session row so a
/// concurrent End or Append invalidates this transaction at commit.
fn lock_open_session(tx: &WriteTx<'_>, session: SessionId) -> Result<SessionRow, StoreError> {
    match tx.session_row_for_update(session)? {
        None => raise(ProcedureCode::SessionNotFound),
        Some(row) if row.is_ended() => raise(ProcedureCode::SessionEnded),
        Some(row) => Ok(row),
    }
}

/// Insert a fresh session row.
pub fn create_session(
    tx: &WriteTx<'_>,
    session: SessionId,
    begin_metadata: Vec<u8>,
) -> Result<(), StoreError> {
    if tx.session_row_for_update(session)?.is_some() {
        return Err(StoreError::WriteConflict(format!("session {session} already exists")));
    }
    tx.put_session(session, &SessionRow::open(begin_metadata))
}

/// Insert a session under a freshly generated id and return the id.
///
/// Each call draws a new id, so a retried attempt never reuses the id of
/// the attempt before it.
pub fn begin_session(tx: &WriteTx<'_>, begin_metadata: Vec<u8>) -> Result<SessionId, StoreError> {
    let session = SessionId::generate();
    create_session(tx, session, begin_metadata)?;
    Ok(session)
}

/// Append one operation and return its number.
///
/// 1. The session must exist and be open.
/// 2. `next = max(operation) + 1`, or 1 for an empty log.
/// 3. A supplied `expected` must equal `next`, otherwise nothing is written.
/// 4. The row is inserted under `next`.
pub fn append_operation(
    tx: &WriteTx<'_>,
    session: SessionId,
    metadata: Vec<u8>,
    data: Option<Vec<u8>>,
    expected: Option<u64>,
) -> Result<u64, StoreError> {
    lock_open_session(tx, session)?;

    let next = tx.last_operation(session)?.map_or(1, |last| last + 1);

    if let Some(expected) = expected {
        if expected != next {
            return raise(ProcedureCode::Conflict);
        }
    }

    // A concurrent append committed after our scan; retry from the top.
    if tx.operation_exists_for_update(session, next)? {
        return Err(StoreError::WriteConflict(format!(
            "operation {next} of session {session} already exists"
        )));
    }

    tx.put_operation(session, next, &OperationRow { data, metadata })?;
    Ok(next)
}

/// End an open session: delete every operation and store the end metadata.
/// Returns the number of operations removed.
pub fn end_session(
    tx: &WriteTx<'_>,
    session: SessionId,
    end_metadata: Vec<u8>,
) -> Result<u64, StoreError> {
    let mut row = lock_open_session(tx, session)?;
    let last = tx.last_operation(session)?.unwrap_or(0);

    // Appends never write the session row, so fence the next number: an
    // append committed after our snapshot makes one of the two commits fail.
    if tx.operation_exists_for_update(session, last + 1)? {
        return Err(StoreError::WriteConflict(format!(
            "operation {} of session {session} appeared during end",
            last + 1
        )));
    }

    let removed = tx.delete_operations(session)?;
    row.end_metadata = Some(end_metadata);
    tx.put_session(session, &row)?;
    Ok(removed)
}

/// Load an operation, explaining its absence with the right code.
pub fn find_operation<R: Rows + ?Sized>(
    rows: &R,
    session: SessionId,
    operation: u64,
) -> Result<OperationRow, StoreError> {
    if let Some(row) = rows.operation_row(session, operation)? {
        return Ok(row);
    }
    require_open_session(rows, session)?;
    raise(ProcedureCode::OperationNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::rocks::{SessionStore, StoreConfig};
    use crate::storage::schema::Tables;
    use crate::storage::txn::{read_transaction, write_transaction, RetryConfig, TxContext};
    use uuid::Uuid;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: SessionStore,
        tables: Tables,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store =
                SessionStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
            let tables = Tables::for_namespace("proc_test").unwrap();
            store.provision(&tables).unwrap();
            Self {
                _dir: dir,
                store,
                tables,
            }
        }

        fn write<T>(
            &self,
            body: impl FnMut(&WriteTx<'_>) -> Result<T, StoreError>,
        ) -> Result<T, StoreError> {
            write_transaction(
                &self.store,
                &self.tables,
                &TxContext::background(),
                &RetryConfig::default(),
                body,
                |_| {},
            )
        }

        fn begin(&self) -> SessionId {
            let session = SessionId::from_uuid(Uuid::new_v4());
            self.write(|tx| create_session(tx, session, b"begin".to_vec()))
                .unwrap();
            session
        }

        fn append(&self, session: SessionId, expected: Option<u64>) -> Result<u64, StoreError> {
            self.write(|tx| append_operation(tx, session, b"m".to_vec(), None, expected))
        }
    }

    #[test]
    fn test_code_wire_forms() {
        for code in [
            ProcedureCode::SessionNotFound,
            ProcedureCode::SessionEnded,
            ProcedureCode::Conflict,
            ProcedureCode::OperationNotFound,
        ] {
            assert_eq!(ProcedureCode::from_code(code.as_str()), Some(code));
            assert!(code.to_string().starts_with(code.as_str()));
        }
        assert_eq!(ProcedureCode::from_code("42P01"), None);
    }

    #[test]
    fn test_begin_session_draws_new_id_per_attempt() {
        let fx = Fixture::new();
        let mut attempted = Vec::new();

        let session = fx
            .write(|tx| {
                let session = begin_session(tx, b"begin".to_vec())?;
                attempted.push(session);
                if attempted.len() < 3 {
                    return Err(StoreError::WriteConflict("simulated collision".into()));
                }
                Ok(session)
            })
            .unwrap();

        assert_eq!(attempted.len(), 3);
        assert_eq!(attempted.iter().collect::<std::collections::HashSet<_>>().len(), 3);
        assert_eq!(attempted.last(), Some(&session));

        let rows = read_transaction(
            &fx.store,
            &fx.tables,
            &TxContext::background(),
            &RetryConfig::default(),
            |tx| {
                attempted
                    .iter()
                    .map(|id| tx.session_row(*id).map(|row| row.is_some()))
                    .collect::<Result<Vec<_>, _>>()
            },
        )
        .unwrap();
        assert_eq!(rows, vec![false, false, true]);
    }

    #[test]
    fn test_create_session_rejects_existing_id() {
        let fx = Fixture::new();
        let session = fx.begin();
        let err = write_transaction(
            &fx.store,
            &fx.tables,
            &TxContext::background(),
            &RetryConfig::no_retry(),
            |tx| create_session(tx, session, Vec::new()),
            |_| {},
        )
        .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_append_numbers_from_one() {
        let fx = Fixture::new();
        let session = fx.begin();
        assert_eq!(fx.append(session, None).unwrap(), 1);
        assert_eq!(fx.append(session, None).unwrap(), 2);
        assert_eq!(fx.append(session, Some(3)).unwrap(), 3);
    }

    #[test]
    fn test_append_conflict_inserts_nothing() {
        let fx = Fixture::new();
        let session = fx.begin();
        fx.append(session, None).unwrap();

        let err = fx.append(session, Some(5)).unwrap_err();
        assert_eq!(err.procedure_code(), Some(ProcedureCode::Conflict));
        let err = fx.append(session, Some(1)).unwrap_err();
        assert_eq!(err.procedure_code(), Some(ProcedureCode::Conflict));

        assert_eq!(fx.append(session, None).unwrap(), 2);
    }

    #[test]
    fn test_append_unknown_session() {
        let fx = Fixture::new();
        let err = fx
            .append(SessionId::from_uuid(Uuid::new_v4()), None)
            .unwrap_err();
        assert_eq!(err.procedure_code(), Some(ProcedureCode::SessionNotFound));
    }

    #[test]
    fn test_end_session_deletes_operations() {
        let fx = Fixture::new();
        let session = fx.begin();
        for _ in 0..4 {
            fx.append(session, None).unwrap();
        }

        let removed = fx
            .write(|tx| end_session(tx, session, b"end".to_vec()))
            .unwrap();
        assert_eq!(removed, 4);

        let err = fx.append(session, None).unwrap_err();
        assert_eq!(err.procedure_code(), Some(ProcedureCode::SessionEnded));
        let err = fx
            .write(|tx| end_session(tx, session, b"again".to_vec()))
            .unwrap_err();
        assert_eq!(err.procedure_code(), Some(ProcedureCode::SessionEnded));

        let row = read_transaction(
            &fx.store,
            &fx.tables,
            &TxContext::background(),
            &RetryConfig::default(),
            |tx| {
                assert_eq!(tx.last_operation(session)?, None);
                tx.session_row(session)
            },
        )
        .unwrap()
        .unwrap();
        assert_eq!(row.begin_metadata, b"begin");
        assert_eq!(row.end_metadata.as_deref(), Some(&b"end"[..]));
    }

    #[test]
    fn test_end_session_without_operations() {
        let fx = Fixture::new();
        let session = fx.begin();
        let removed = fx
            .write(|tx| end_session(tx, session, Vec::new()))
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_find_operation_codes() {
        let fx = Fixture::new();
        let session = fx.begin();
        fx.append(session, None).unwrap();

        let lookup = |session: SessionId, op: u64| {
            read_transaction(
                &fx.store,
                &fx.tables,
                &TxContext::background(),
                &RetryConfig::default(),
                |tx| find_operation(tx, session, op),
            )
        };

        assert!(lookup(session, 1).is_ok());
        assert_eq!(
            lookup(session, 2).unwrap_err().procedure_code(),
            Some(ProcedureCode::OperationNotFound)
        );
        assert_eq!(
            lookup(SessionId::from_uuid(Uuid::new_v4()), 1)
                .unwrap_err()
                .procedure_code(),
            Some(ProcedureCode::SessionNotFound)
        );

        fx.write(|tx| end_session(tx, session, Vec::new())).unwrap();
        assert_eq!(
            lookup(session, 1).unwrap_err().procedure_code(),
            Some(ProcedureCode::SessionEnded)
        );
    }
}
