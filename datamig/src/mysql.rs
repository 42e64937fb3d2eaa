//! [`Executor`] for [`mysql::Conn`].
//!
//! MySQL commits implicitly before and after most DDL statements, so
//! [`TxMode::Wrap`](crate::TxMode) only protects data statements. A plan that fails halfway
//! through its DDL may leave earlier schema changes in place and need manual cleanup.

use mysql::prelude::Queryable;
use mysql::{Conn, Params};

use crate::core::{Executor, Row, Statement, Value};
use crate::error::Error;

// Re-export mysql types for use in hooks and planners
pub use mysql::Conn as MysqlConn;

fn to_mysql(value: &Value) -> mysql::Value {
    match value {
        Value::Null => mysql::Value::NULL,
        Value::Bool(b) => mysql::Value::Int(i64::from(*b)),
        Value::Int(i) => mysql::Value::Int(*i),
        Value::Float(f) => mysql::Value::Double(*f),
        Value::Text(s) => mysql::Value::Bytes(s.clone().into_bytes()),
        Value::Bytes(b) => mysql::Value::Bytes(b.clone()),
        Value::Json(v) => mysql::Value::Bytes(v.to_string().into_bytes()),
    }
}

fn from_mysql(value: mysql::Value) -> Value {
    match value {
        mysql::Value::NULL => Value::Null,
        mysql::Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Value::Text(text),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
        mysql::Value::Int(i) => Value::Int(i),
        mysql::Value::UInt(u) => match i64::try_from(u) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Text(u.to_string()),
        },
        mysql::Value::Float(f) => Value::Float(f.into()),
        mysql::Value::Double(d) => Value::Float(d),
        temporal @ (mysql::Value::Date(..) | mysql::Value::Time(..)) => {
            Value::Text(temporal.as_sql(true).trim_matches('\'').to_string())
        }
    }
}

fn params(statement: &Statement) -> Params {
    Params::Positional(statement.args.iter().map(to_mysql).collect())
}

impl Executor for Conn {
    fn execute(&mut self, statement: &Statement) -> Result<u64, Error> {
        // the text protocol accepts statements that cannot be prepared, such as most DDL
        if statement.args.is_empty() {
            Queryable::query_drop(self, &statement.sql)?;
        } else {
            Queryable::exec_drop(self, statement.sql.as_str(), params(statement))?;
        }
        Ok(self.affected_rows())
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, Error> {
        let rows: Vec<mysql::Row> = if statement.args.is_empty() {
            Queryable::query(self, &statement.sql)?
        } else {
            Queryable::exec(self, statement.sql.as_str(), params(statement))?
        };
        Ok(rows
            .into_iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.as_ref(i).cloned().map_or(Value::Null, from_mysql))
                    .collect()
            })
            .collect())
    }

    fn begin(&mut self) -> Result<(), Error> {
        Queryable::query_drop(self, "START TRANSACTION")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        Queryable::query_drop(self, "COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        Queryable::query_drop(self, "ROLLBACK")?;
        Ok(())
    }
}
