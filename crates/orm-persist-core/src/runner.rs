//! The statement executor consumed by the persistence core.

use crate::metadata::{ClosureTableMetadata, ColumnValues};
use crate::{Error, Value};
use asupersync::{Cx, Outcome};
use std::future::Future;

/// Executes single parametrized statements and controls the transaction
/// the persistence core runs in.
///
/// Tables and columns are passed as plain names; implementations quote them.
pub trait QueryRunner: Send + Sync {
    /// Insert one row.
    ///
    /// Returns the value of `generated_column` assigned by the storage
    /// engine, or `None` when no column is generated.
    fn insert(
        &self,
        cx: &Cx,
        table: &str,
        values: &ColumnValues,
        generated_column: Option<&str>,
    ) -> impl Future<Output = Outcome<Option<Value>, Error>> + Send;

    /// Update the rows matching every condition.
    fn update(
        &self,
        cx: &Cx,
        table: &str,
        values: &ColumnValues,
        conditions: &ColumnValues,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Delete the rows matching every condition.
    fn delete(
        &self,
        cx: &Cx,
        table: &str,
        conditions: &ColumnValues,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Record `child_id` in a closure table: its self row plus one row per
    /// ancestor of `parent_id`.
    fn insert_into_closure_table(
        &self,
        cx: &Cx,
        closure: &ClosureTableMetadata,
        child_id: &Value,
        parent_id: Option<&Value>,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Is a transaction open on the underlying connection?
    fn is_transaction_active(&self) -> bool;

    fn begin_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn commit_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn rollback_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Driver-level coercion applied to every value before it is bound.
    fn prepare_value(&self, value: Value) -> Value {
        value
    }
}
