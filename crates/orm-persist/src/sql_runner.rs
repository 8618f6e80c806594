//! A [`QueryRunner`] rendering SQL for a [`Connection`].

use asupersync::{Cx, Outcome};
use orm_persist_core::{
    ClosureTableMetadata, ColumnValues, Connection, Dialect, Error, PersistErrorKind,
    QueryRunner, TransactionError, TransactionErrorKind, Value,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

/// Renders one parametrized statement per call and tracks whether it
/// opened a transaction on the connection.
#[derive(Debug)]
pub struct SqlQueryRunner<C> {
    connection: C,
    in_transaction: AtomicBool,
}

impl<C: Connection> SqlQueryRunner<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            in_transaction: AtomicBool::new(false),
        }
    }

    /// Wrap a connection that already has an open transaction.
    pub fn in_transaction(connection: C) -> Self {
        Self {
            connection,
            in_transaction: AtomicBool::new(true),
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn into_inner(self) -> C {
        self.connection
    }

    fn dialect(&self) -> Dialect {
        self.connection.dialect()
    }

    fn quote(&self, name: &str) -> String {
        self.dialect().quote_identifier(name)
    }

    /// `"a" = $n AND "b" = $n+1`, numbering from `start`.
    fn where_clause(&self, conditions: &ColumnValues, start: usize) -> String {
        let dialect = self.dialect();
        conditions
            .iter()
            .enumerate()
            .map(|(i, (column, _))| {
                format!(
                    "{} = {}",
                    dialect.quote_identifier(column),
                    dialect.placeholder(start + i)
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Build the INSERT statement for one row.
    pub fn insert_sql(
        &self,
        table: &str,
        values: &ColumnValues,
        generated_column: Option<&str>,
    ) -> String {
        let dialect = self.dialect();
        let mut sql = if values.is_empty() {
            match dialect {
                Dialect::Mysql => format!("INSERT INTO {} () VALUES ()", self.quote(table)),
                Dialect::Postgres | Dialect::Sqlite => {
                    format!("INSERT INTO {} DEFAULT VALUES", self.quote(table))
                }
            }
        } else {
            let columns: Vec<String> = values.iter().map(|(c, _)| self.quote(c)).collect();
            let placeholders: Vec<String> =
                (1..=values.len()).map(|i| dialect.placeholder(i)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.quote(table),
                columns.join(", "),
                placeholders.join(", ")
            )
        };
        if let Some(column) = generated_column {
            if dialect.supports_returning() {
                sql.push_str(" RETURNING ");
                sql.push_str(&self.quote(column));
            }
        }
        sql
    }

    /// Build the UPDATE statement for one row set.
    pub fn update_sql(&self, table: &str, values: &ColumnValues, conditions: &ColumnValues) -> String {
        let dialect = self.dialect();
        let assignments: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(i, (column, _))| {
                format!("{} = {}", self.quote(column), dialect.placeholder(i + 1))
            })
            .collect();
        format!(
            "UPDATE {} SET {} WHERE {}",
            self.quote(table),
            assignments.join(", "),
            self.where_clause(conditions, values.len() + 1)
        )
    }

    /// Build the DELETE statement for one row set.
    pub fn delete_sql(&self, table: &str, conditions: &ColumnValues) -> String {
        format!(
            "DELETE FROM {} WHERE {}",
            self.quote(table),
            self.where_clause(conditions, 1)
        )
    }

    /// The self row of a closure table entry (`ancestor = descendant`).
    fn closure_self_sql(&self, closure: &ClosureTableMetadata) -> String {
        let dialect = self.dialect();
        let (level_column, level_value) = match closure.level_column {
            Some(level) => (format!(", {}", self.quote(level)), ", 0".to_string()),
            None => (String::new(), String::new()),
        };
        format!(
            "INSERT INTO {} ({}, {}{}) VALUES ({}, {}{})",
            self.quote(closure.table_name),
            self.quote(closure.ancestor_column),
            self.quote(closure.descendant_column),
            level_column,
            dialect.placeholder(1),
            dialect.placeholder(2),
            level_value
        )
    }

    /// One row per ancestor of the parent, copied onto the new child.
    fn closure_ancestors_sql(&self, closure: &ClosureTableMetadata) -> String {
        let dialect = self.dialect();
        let table = self.quote(closure.table_name);
        let ancestor = self.quote(closure.ancestor_column);
        let descendant = self.quote(closure.descendant_column);
        let (level_column, level_value) = match closure.level_column {
            Some(level) => {
                let level = self.quote(level);
                (format!(", {level}"), format!(", {level} + 1"))
            }
            None => (String::new(), String::new()),
        };
        format!(
            "INSERT INTO {table} ({ancestor}, {descendant}{level_column}) \
             SELECT {ancestor}, {}{level_value} FROM {table} WHERE {descendant} = {}",
            dialect.placeholder(1),
            dialect.placeholder(2)
        )
    }

    fn params(values: &ColumnValues) -> Vec<Value> {
        values.iter().map(|(_, v)| v.clone()).collect()
    }

    fn transaction_error(kind: TransactionErrorKind, message: &str) -> Error {
        Error::Transaction(TransactionError {
            kind,
            message: message.to_string(),
        })
    }
}

impl<C: Connection> QueryRunner for SqlQueryRunner<C> {
    fn insert(
        &self,
        cx: &Cx,
        table: &str,
        values: &ColumnValues,
        generated_column: Option<&str>,
    ) -> impl Future<Output = Outcome<Option<Value>, Error>> + Send {
        let sql = self.insert_sql(table, values, generated_column);
        let params = Self::params(values);
        let returning = generated_column.is_some() && self.dialect().supports_returning();
        let generated = generated_column.is_some();
        async move {
            tracing::trace!(sql = %sql, "Executing INSERT");
            if returning {
                match self.connection.query_row(cx, &sql, &params).await {
                    Outcome::Ok(row) => {
                        Outcome::Ok(row.and_then(|row| row.into_iter().next()))
                    }
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            } else {
                match self.connection.insert(cx, &sql, &params).await {
                    Outcome::Ok(id) => Outcome::Ok(generated.then_some(Value::BigInt(id))),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
        }
    }

    fn update(
        &self,
        cx: &Cx,
        table: &str,
        values: &ColumnValues,
        conditions: &ColumnValues,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let statement = if values.is_empty() {
            None
        } else if conditions.is_empty() {
            Some(Err(Error::persist(
                PersistErrorKind::MissingIdentity,
                format!("refusing to UPDATE \"{table}\" without conditions"),
            )))
        } else {
            let mut params = Self::params(values);
            params.extend(Self::params(conditions));
            Some(Ok((self.update_sql(table, values, conditions), params)))
        };
        async move {
            let (sql, params) = match statement {
                None => return Outcome::Ok(0),
                Some(Ok(statement)) => statement,
                Some(Err(e)) => return Outcome::Err(e),
            };
            tracing::trace!(sql = %sql, "Executing UPDATE");
            self.connection.execute(cx, &sql, &params).await
        }
    }

    fn delete(
        &self,
        cx: &Cx,
        table: &str,
        conditions: &ColumnValues,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let statement = if conditions.is_empty() {
            Err(Error::persist(
                PersistErrorKind::MissingIdentity,
                format!("refusing to DELETE from \"{table}\" without conditions"),
            ))
        } else {
            Ok((self.delete_sql(table, conditions), Self::params(conditions)))
        };
        async move {
            let (sql, params) = match statement {
                Ok(statement) => statement,
                Err(e) => return Outcome::Err(e),
            };
            tracing::trace!(sql = %sql, "Executing DELETE");
            self.connection.execute(cx, &sql, &params).await
        }
    }

    fn insert_into_closure_table(
        &self,
        cx: &Cx,
        closure: &ClosureTableMetadata,
        child_id: &Value,
        parent_id: Option<&Value>,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let self_row = (
            self.closure_self_sql(closure),
            vec![child_id.clone(), child_id.clone()],
        );
        let ancestors = parent_id.map(|parent| {
            (
                self.closure_ancestors_sql(closure),
                vec![child_id.clone(), parent.clone()],
            )
        });
        async move {
            for (sql, params) in std::iter::once(self_row).chain(ancestors) {
                tracing::trace!(sql = %sql, "Executing closure INSERT");
                match self.connection.execute(cx, &sql, &params).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            Outcome::Ok(())
        }
    }

    fn is_transaction_active(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    fn begin_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            if self.is_transaction_active() {
                return Outcome::Err(Self::transaction_error(
                    TransactionErrorKind::Begin,
                    "a transaction is already active",
                ));
            }
            match self.connection.execute(cx, "BEGIN", &[]).await {
                Outcome::Ok(_) => {
                    self.in_transaction.store(true, Ordering::SeqCst);
                    Outcome::Ok(())
                }
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    fn commit_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            if !self.is_transaction_active() {
                return Outcome::Err(Self::transaction_error(
                    TransactionErrorKind::NotActive,
                    "no transaction to commit",
                ));
            }
            match self.connection.execute(cx, "COMMIT", &[]).await {
                Outcome::Ok(_) => {
                    self.in_transaction.store(false, Ordering::SeqCst);
                    Outcome::Ok(())
                }
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    fn rollback_transaction(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            if !self.is_transaction_active() {
                return Outcome::Err(Self::transaction_error(
                    TransactionErrorKind::NotActive,
                    "no transaction to roll back",
                ));
            }
            // the transaction is gone whether or not ROLLBACK succeeds
            self.in_transaction.store(false, Ordering::SeqCst);
            match self.connection.execute(cx, "ROLLBACK", &[]).await {
                Outcome::Ok(_) => Outcome::Ok(()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    fn prepare_value(&self, value: Value) -> Value {
        match (self.dialect(), value) {
            (Dialect::Sqlite | Dialect::Mysql, Value::Bool(b)) => Value::Int(i32::from(b)),
            (Dialect::Sqlite, Value::Json(json)) => Value::Text(json.to_string()),
            (_, value) => value,
        }
    }
}
