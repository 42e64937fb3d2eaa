//! [`Executor`] for [`rusqlite::Connection`].
//!
//! SQLite supports transactional DDL, so a plan applied with [`TxMode::Wrap`](crate::TxMode)
//! either commits completely or leaves the database untouched.

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::Connection;

use crate::core::{Executor, Row, Statement, Value};
use crate::error::Error;

// Re-export rusqlite types for use in hooks and planners
pub use rusqlite::Connection as SqliteConnection;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as Sqlite;
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(Sqlite::Null),
            Value::Bool(b) => ToSqlOutput::Owned(Sqlite::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(Sqlite::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(Sqlite::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Json(v) => ToSqlOutput::Owned(Sqlite::Text(v.to_string())),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Int(i),
            ValueRef::Real(f) => Value::Float(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
        }
    }
}

impl Executor for Connection {
    fn execute(&mut self, statement: &Statement) -> Result<u64, Error> {
        let affected = Connection::execute(
            self,
            &statement.sql,
            rusqlite::params_from_iter(statement.args.iter()),
        )?;
        Ok(affected as u64)
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, Error> {
        let mut stmt = self.prepare(&statement.sql)?;
        let columns = stmt.column_count();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(statement.args.iter()), |row| {
                (0..columns)
                    .map(|i| row.get_ref(i).map(Value::from))
                    .collect::<rusqlite::Result<Row>>()
            })?
            .collect::<rusqlite::Result<Vec<Row>>>()?;
        Ok(rows)
    }

    fn begin(&mut self) -> Result<(), Error> {
        self.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        self.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
