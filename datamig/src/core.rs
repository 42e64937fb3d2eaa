use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A value bound to a [`Statement`] placeholder, or read back from a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Value {
    /// Render this value as a SQL literal, for writing statements into migration files.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) if f.is_finite() => format!("{f:?}"),
            Value::Float(_) => "NULL".to_string(),
            Value::Text(s) => quote(s),
            Value::Bytes(b) => {
                let hex: String = b.iter().map(|byte| format!("{byte:02X}")).collect();
                format!("X'{hex}'")
            }
            Value::Json(v) => quote(&v.to_string()),
        }
    }

    /// The text content, if this is a [`Value::Text`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Json(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// One row returned by [`Executor::query`].
pub type Row = Vec<Value>;

/// A single SQL statement with its bound arguments and an optional comment describing intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub comment: Option<String>,
    pub args: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            comment: None,
            args: Vec::new(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Bind the next positional argument.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// The statement text with every bound argument inlined as a literal.
    pub fn to_literal_sql(&self) -> Result<String, Error> {
        crate::sql::inline_args(&self.sql, &self.args).map_err(|reason| {
            Error::Generic(format!(
                "cannot inline arguments of `{}`: {}",
                self.sql, reason
            ))
        })
    }
}

impl From<&str> for Statement {
    fn from(value: &str) -> Self {
        Statement::new(value)
    }
}

impl From<String> for Statement {
    fn from(value: String) -> Self {
        Statement::new(value)
    }
}

/// The execution sink every statement goes through.
///
/// Live database connections implement this by running the statement. A
/// [`RecordingSession`](crate::RecordingSession) implements it by remembering the statement instead,
/// which is how the same mutation code can either change a database or produce a migration file.
pub trait Executor {
    /// Run a statement that returns no rows, returning the number of affected rows.
    fn execute(&mut self, statement: &Statement) -> Result<u64, Error>;

    /// Run a statement and return every row it produces.
    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, Error>;

    fn begin(&mut self) -> Result<(), Error> {
        self.execute(&Statement::new("BEGIN")).map(|_| ())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.execute(&Statement::new("COMMIT")).map(|_| ())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        self.execute(&Statement::new("ROLLBACK")).map(|_| ())
    }
}

impl<E: Executor + ?Sized> Executor for &mut E {
    fn execute(&mut self, statement: &Statement) -> Result<u64, Error> {
        (**self).execute(statement)
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, Error> {
        (**self).query(statement)
    }

    fn begin(&mut self) -> Result<(), Error> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<(), Error> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<(), Error> {
        (**self).rollback()
    }
}
