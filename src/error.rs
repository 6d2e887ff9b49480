use crate::domain::{BlockNumber, TransactionId};
use sqlx::error::ErrorKind;
use thiserror::Error;

pub type IndexResult<T> = Result<T, IndexError>;

/// Error returned by a block handler; surfaced to the caller untouched.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

// sqlite primary result codes that mean another writer holds the lock
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("block handler failed: {0}")]
    Application(#[source] HandlerError),

    #[error("conflicting concurrent transaction, retry the operation: {0}")]
    Conflict(#[source] sqlx::Error),

    #[error("index state is inconsistent: {0}")]
    Consistency(String),

    #[error(
        "rollback failed at block {block_number} (transaction {transaction_id}) after undoing {undone} block(s), manual remediation required: {source}"
    )]
    RollbackFailure {
        block_number: BlockNumber,
        transaction_id: TransactionId,
        undone: usize,
        #[source]
        source: Box<IndexError>,
    },

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("invalid sql identifier '{0}'")]
    InvalidIdentifier(String),
}

impl IndexError {
    /// Only a serialization conflict is worth retrying as a whole.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::Conflict(_))
    }

    /// Classifies a handler failure: storage conflicts hit from inside the
    /// handler are still conflicts, anything else is the handler's own error.
    pub fn from_handler(err: HandlerError) -> Self {
        match err.downcast::<sqlx::Error>() {
            Ok(sqlx_err) if is_conflict(&sqlx_err) => IndexError::Conflict(*sqlx_err),
            Ok(sqlx_err) => IndexError::Application(sqlx_err),
            Err(other) => IndexError::Application(other),
        }
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        if is_conflict(&err) {
            IndexError::Conflict(err)
        } else {
            IndexError::Database(err)
        }
    }
}

pub(crate) fn is_conflict(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    let Some(code) = db_err.code() else {
        return false;
    };
    // sqlite reports extended result codes, the primary code is the low byte
    code.parse::<i32>()
        .map(|extended| matches!(extended & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false)
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if matches!(db_err.kind(), ErrorKind::UniqueViolation))
}
