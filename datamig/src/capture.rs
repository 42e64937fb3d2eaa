use crate::core::{Executor, Row, Statement};
use crate::error::Error;

/// An [`Executor`] that records statements instead of running them.
///
/// Run mutation code against a session to capture the SQL it would have executed, then hand the
/// session to a [`MigrationWriter`](crate::MigrationWriter) (or use
/// [`MigrationWriter::record`](crate::MigrationWriter::record), which scopes one for you).
/// Anything that needs data back from the database fails with [`Error::RecordingUnsupported`].
///
/// ```
/// use datamig::{Executor, RecordingSession, Statement};
///
/// let mut session = RecordingSession::new();
/// session
///     .execute(&Statement::new("UPDATE users SET active = ? WHERE active IS NULL").bind(true))
///     .unwrap();
/// assert!(session.query(&Statement::new("SELECT id FROM users")).is_err());
/// assert_eq!(session.statements().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct RecordingSession {
    statements: Vec<Statement>,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements recorded so far, in execution order.
    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn into_statements(mut self) -> Vec<Statement> {
        std::mem::take(&mut self.statements)
    }

    /// Drop everything recorded so far.
    pub fn discard(mut self) {
        self.statements.clear();
    }
}

impl Executor for RecordingSession {
    fn execute(&mut self, statement: &Statement) -> Result<u64, Error> {
        self.statements.push(statement.clone());
        Ok(0)
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, Error> {
        Err(Error::RecordingUnsupported {
            operation: "query",
            sql: statement.sql.clone(),
        })
    }

    fn begin(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if !self.statements.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                statements = self.statements.len(),
                "Recording session dropped without being flushed; captured statements discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn backfill(exec: &mut dyn Executor) -> Result<(), Error> {
        exec.execute(&Statement::new("UPDATE users SET role = ? WHERE role IS NULL").bind("member"))?;
        exec.execute(&Statement::new("UPDATE users SET active = TRUE"))?;
        Ok(())
    }

    #[test]
    fn records_in_execution_order() {
        let mut session = RecordingSession::new();
        backfill(&mut session).unwrap();
        backfill(&mut session).unwrap();
        let sql: Vec<&str> = session.statements().iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "UPDATE users SET role = ? WHERE role IS NULL",
                "UPDATE users SET active = TRUE",
                "UPDATE users SET role = ? WHERE role IS NULL",
                "UPDATE users SET active = TRUE",
            ]
        );
        assert_eq!(session.statements()[0].args, vec![Value::from("member")]);
    }

    #[test]
    fn reads_are_rejected() {
        let mut session = RecordingSession::new();
        let err = session
            .query(&Statement::new("SELECT id FROM users"))
            .unwrap_err();
        match err {
            Error::RecordingUnsupported { operation, sql } => {
                assert_eq!(operation, "query");
                assert_eq!(sql, "SELECT id FROM users");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(session.is_empty());
    }

    #[test]
    fn transaction_control_is_not_recorded() {
        let mut session = RecordingSession::new();
        session.begin().unwrap();
        session.execute(&Statement::new("DELETE FROM t")).unwrap();
        session.commit().unwrap();
        assert_eq!(session.into_statements().len(), 1);
    }
}
