//! Testing utilities for hook and migration development

use std::collections::HashMap;

use crate::core::{Executor, Row, Statement};
use crate::error::Error;

/// An [`Executor`] that remembers every statement it is asked to run and can be told to fail.
///
/// Failing statements are still recorded as attempted, so a test can assert exactly how far a
/// plan got.
///
/// ```ignore
/// use datamig::testing::MockExecutor;
/// use datamig::{Executor, Statement};
///
/// let mut conn = MockExecutor::new().fail_on("DROP TABLE users");
/// conn.execute(&Statement::new("DELETE FROM users")).unwrap();
/// assert!(conn.execute(&Statement::new("DROP TABLE users")).is_err());
/// assert_eq!(conn.attempted_sql(), vec!["DELETE FROM users", "DROP TABLE users"]);
/// ```
#[derive(Debug, Default)]
pub struct MockExecutor {
    attempted: Vec<Statement>,
    failing: Vec<String>,
    rows: HashMap<String, Vec<Row>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any statement whose SQL equals `sql`.
    pub fn fail_on(mut self, sql: impl Into<String>) -> Self {
        self.failing.push(sql.into());
        self
    }

    /// Answer queries whose SQL equals `sql` with `rows`. Other queries return no rows.
    pub fn with_rows(mut self, sql: impl Into<String>, rows: Vec<Row>) -> Self {
        self.rows.insert(sql.into(), rows);
        self
    }

    pub fn attempted(&self) -> &[Statement] {
        &self.attempted
    }

    pub fn attempted_sql(&self) -> Vec<&str> {
        self.attempted.iter().map(|s| s.sql.as_str()).collect()
    }

    fn attempt(&mut self, statement: &Statement) -> Result<(), Error> {
        self.attempted.push(statement.clone());
        if self.failing.iter().any(|sql| *sql == statement.sql) {
            return Err(Error::Generic(format!(
                "mock failure for statement: {}",
                statement.sql
            )));
        }
        Ok(())
    }
}

impl Executor for MockExecutor {
    fn execute(&mut self, statement: &Statement) -> Result<u64, Error> {
        self.attempt(statement)?;
        Ok(1)
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, Error> {
        self.attempt(statement)?;
        Ok(self.rows.get(&statement.sql).cloned().unwrap_or_default())
    }
}
