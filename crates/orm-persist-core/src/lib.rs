//! Core types and traits for ORM Persist.
//!
//! This crate provides the vocabulary shared by the persistence executor and
//! the outside world:
//!
//! - `Value` for dynamically-typed column values
//! - `Error` taxonomy for persistence failures
//! - Entity metadata (`EntityMetadata`, `ColumnMetadata`, `RelationMetadata`)
//! - `QueryRunner` trait consumed by the executor
//! - `Connection` trait and `Dialect` helpers for SQL rendering
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod metadata;
pub mod runner;
pub mod value;

pub use connection::{Connection, Dialect};
pub use error::{
    Error, PersistError, PersistErrorKind, QueryError, QueryErrorKind, Result, TransactionError,
    TransactionErrorKind,
};
pub use metadata::{
    ClosureTableMetadata, ColumnMetadata, ColumnRole, ColumnValues, EntityMetadata, IdMap,
    JoinColumn, JunctionMetadata, JunctionSide, MetadataProvider, MetadataRegistry, RelationKind,
    RelationMetadata,
};
pub use runner::QueryRunner;
pub use value::Value;
