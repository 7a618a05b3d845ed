//! Coordinator errors.
//!
//! Four kinds are expected and recoverable: [`ErrorKind::SessionNotFound`],
//! [`ErrorKind::AlreadyEnded`], [`ErrorKind::Conflict`] and
//! [`ErrorKind::OperationNotFound`]. Everything else from the store
//! (connectivity, corruption, cancellation) fails the call without
//! poisoning the coordinator.

use thiserror::Error;

use crate::codec::CodecError;
use crate::session::SessionId;
use crate::storage::procedures::ProcedureCode;
use crate::storage::rocks::StoreError;

/// Coarse classification for matching on outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SessionNotFound,
    AlreadyEnded,
    Conflict,
    OperationNotFound,
    Store,
    Codec,
    EndCallback,
    NotInitialized,
    AlreadyInitialized,
    InvalidNamespace,
    Init,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("session {session} not found")]
    SessionNotFound {
        session: SessionId,
        #[source]
        source: StoreError,
    },

    #[error("session {session} already ended")]
    AlreadyEnded {
        session: SessionId,
        #[source]
        source: StoreError,
    },

    #[error("session {session}: expected operation {expected} is not next")]
    Conflict {
        session: SessionId,
        expected: u64,
        #[source]
        source: StoreError,
    },

    #[error("session {session}: operation {operation} not found")]
    OperationNotFound {
        session: SessionId,
        operation: u64,
        #[source]
        source: StoreError,
    },

    #[error("session {session}{}: store failure", fmt_operation(.operation))]
    Store {
        session: SessionId,
        operation: Option<u64>,
        #[source]
        source: StoreError,
    },

    #[error("{}value codec failure", fmt_session(.session))]
    Codec {
        /// `None` when no session id exists yet (Begin)
        session: Option<SessionId>,
        #[source]
        source: CodecError,
    },

    #[error("session {session}: end callback failed")]
    EndCallback {
        session: SessionId,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("coordinator is not initialized")]
    NotInitialized,

    #[error("coordinator is already initialized")]
    AlreadyInitialized,

    #[error("invalid namespace '{namespace}': {reason}")]
    InvalidNamespace {
        namespace: String,
        reason: &'static str,
    },

    #[error("provisioning namespace '{namespace}' failed")]
    Init {
        namespace: String,
        #[source]
        source: StoreError,
    },
}

fn fmt_session(session: &Option<SessionId>) -> String {
    session
        .map(|session| format!("session {session}: "))
        .unwrap_or_default()
}

fn fmt_operation(operation: &Option<u64>) -> String {
    operation
        .map(|op| format!(" operation {op}"))
        .unwrap_or_default()
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            CoordinatorError::AlreadyEnded { .. } => ErrorKind::AlreadyEnded,
            CoordinatorError::Conflict { .. } => ErrorKind::Conflict,
            CoordinatorError::OperationNotFound { .. } => ErrorKind::OperationNotFound,
            CoordinatorError::Store { .. } => ErrorKind::Store,
            CoordinatorError::Codec { .. } => ErrorKind::Codec,
            CoordinatorError::EndCallback { .. } => ErrorKind::EndCallback,
            CoordinatorError::NotInitialized => ErrorKind::NotInitialized,
            CoordinatorError::AlreadyInitialized => ErrorKind::AlreadyInitialized,
            CoordinatorError::InvalidNamespace { .. } => ErrorKind::InvalidNamespace,
            CoordinatorError::Init { .. } => ErrorKind::Init,
        }
    }

    /// Whether this is one of the four expected domain outcomes.
    pub fn is_domain(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SessionNotFound
                | ErrorKind::AlreadyEnded
                | ErrorKind::Conflict
                | ErrorKind::OperationNotFound
        )
    }

    /// Whether the caller's cancellation token or deadline ended the call.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoordinatorError::Store { source, .. } if source.is_cancelled())
    }

    /// Translate a store failure at the coordinator edge.
    ///
    /// Procedure codes become domain errors; `Aborted` carries an end
    /// callback's own error; anything else is wrapped with the call's
    /// session and operation.
    pub(crate) fn from_store(
        source: StoreError,
        session: SessionId,
        operation: Option<u64>,
        expected: Option<u64>,
    ) -> Self {
        match source {
            StoreError::Procedure(code) => match code {
                ProcedureCode::SessionNotFound => {
                    CoordinatorError::SessionNotFound { session, source }
                }
                ProcedureCode::SessionEnded => CoordinatorError::AlreadyEnded { session, source },
                ProcedureCode::Conflict => CoordinatorError::Conflict {
                    session,
                    expected: expected.unwrap_or_default(),
                    source,
                },
                ProcedureCode::OperationNotFound => CoordinatorError::OperationNotFound {
                    session,
                    operation: operation.unwrap_or_default(),
                    source,
                },
            },
            StoreError::Aborted(inner) => match inner.downcast::<CoordinatorError>() {
                Ok(err) => *err,
                Err(inner) => CoordinatorError::EndCallback {
                    session,
                    source: inner,
                },
            },
            source => CoordinatorError::Store {
                session,
                operation,
                source,
            },
        }
    }

    pub(crate) fn codec(session: Option<SessionId>, source: CodecError) -> Self {
        CoordinatorError::Codec { session, source }
    }
}
