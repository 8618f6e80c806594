//! Error types for persistence operations.

use std::fmt;

/// The primary error type for all persistence operations.
#[derive(Debug)]
pub enum Error {
    /// Statement execution errors reported by a query runner
    Query(QueryError),
    /// Transaction control errors (begin, commit, rollback)
    Transaction(TransactionError),
    /// Errors raised by the persistence core itself
    Persist(PersistError),
    /// A lifecycle listener refused the batch
    Listener(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Connection lost while the statement was running
    Connection,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// BEGIN failed or a transaction is already open
    Begin,
    /// COMMIT failed
    Commit,
    /// ROLLBACK failed
    Rollback,
    /// No transaction is active
    NotActive,
}

/// An error detected by the persistence core before or while running a batch.
#[derive(Debug, Clone)]
pub struct PersistError {
    pub kind: PersistErrorKind,
    pub message: String,
    /// Human readable description of the entity involved, if any
    /// (for example `"Hero#3"`).
    pub entity: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistErrorKind {
    /// An entity is scheduled for removal and for insert or update.
    ConflictingOperation,
    /// A junction row needs an id the entity never received.
    EntityNotPersisted,
    /// A fix-up, update or remove needs an identity that is unknown.
    MissingIdentity,
    /// Mandatory foreign keys form a cycle between pending inserts.
    DependencyCycle,
    /// No metadata is registered for a target.
    MissingMetadata,
    /// A relation is used in a way its kind does not allow.
    InvalidRelation,
}

impl PersistError {
    pub fn new(kind: PersistErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            entity: None,
        }
    }

    /// Attach the offending entity's description.
    #[must_use]
    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }
}

impl Error {
    pub fn persist(kind: PersistErrorKind, message: impl Into<String>) -> Self {
        Error::Persist(PersistError::new(kind, message))
    }

    /// The core error kind, if this is a core error.
    pub fn persist_kind(&self) -> Option<PersistErrorKind> {
        match self {
            Error::Persist(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Is this a remove vs insert/update scheduling conflict?
    pub fn is_conflicting_operation(&self) -> bool {
        self.persist_kind() == Some(PersistErrorKind::ConflictingOperation)
    }

    /// Is this an "entity not persisted" junction error?
    pub fn is_not_persisted(&self) -> bool {
        self.persist_kind() == Some(PersistErrorKind::EntityNotPersisted)
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Persist(e) => write!(f, "Persist error: {}", e),
            Error::Listener(msg) => write!(f, "Listener error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{} ({})", self.message, entity),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<PersistError> for Error {
    fn from(err: PersistError) -> Self {
        Error::Persist(err)
    }
}

/// Result type alias for persistence operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_kind_helpers() {
        let err = Error::persist(PersistErrorKind::ConflictingOperation, "both");
        assert!(err.is_conflicting_operation());
        assert!(!err.is_not_persisted());

        let err: Error = PersistError::new(PersistErrorKind::EntityNotPersisted, "no id")
            .entity("Power#1")
            .into();
        assert!(err.is_not_persisted());
        assert_eq!(err.to_string(), "Persist error: no id (Power#1)");
    }

    #[test]
    fn query_error_exposes_sql() {
        let err = Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            sql: Some("INSERT INTO \"t\" DEFAULT VALUES".to_string()),
            message: "unique violation".to_string(),
            source: None,
        });
        assert_eq!(err.sql(), Some("INSERT INTO \"t\" DEFAULT VALUES"));
        assert_eq!(err.persist_kind(), None);
        assert_eq!(err.to_string(), "Query error: unique violation");
    }
}
