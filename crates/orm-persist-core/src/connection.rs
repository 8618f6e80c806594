//! Database connection trait and SQL dialects.
//!
//! The persistence core never talks to a driver directly. A [`Connection`]
//! is the narrow statement-level surface a driver exposes; the
//! `SqlQueryRunner` in `orm-persist` renders SQL for it.

use crate::{Error, Value};
use asupersync::{Cx, Outcome};
use std::future::Future;

/// SQL dialect of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Can an INSERT return the generated column directly?
    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres)
    }
}

/// A database connection able to run parametrized statements.
///
/// Implementations must be `Send + Sync`; interior mutability is expected
/// for driver state.
pub trait Connection: Send + Sync {
    /// The dialect SQL must be rendered in.
    fn dialect(&self) -> Dialect;

    /// Execute a statement and return the number of rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Execute an INSERT and return the last inserted row id.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send;

    /// Execute a statement returning at most one row.
    fn query_row(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Vec<Value>>, Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(2), "$2");
        assert_eq!(Dialect::Sqlite.placeholder(2), "?2");
        assert_eq!(Dialect::Mysql.placeholder(2), "?");
    }

    #[test]
    fn test_quote_identifier_escapes() {
        assert_eq!(Dialect::Postgres.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::Mysql.quote_identifier("a`b"), "`a``b`");
        assert_eq!(Dialect::Sqlite.quote_identifier("heroes"), "\"heroes\"");
    }

    #[test]
    fn test_returning_support() {
        assert!(Dialect::Postgres.supports_returning());
        assert!(!Dialect::Sqlite.supports_returning());
        assert!(!Dialect::Mysql.supports_returning());
    }
}
