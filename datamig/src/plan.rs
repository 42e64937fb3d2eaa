use serde::{Deserialize, Serialize};

use crate::core::{Executor, Statement};
use crate::error::Error;

/// A column attribute that a [`Change::ModifyColumn`] altered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnAttr {
    Type,
    Nullability,
    Default,
    Comment,
    Collation,
}

/// One schema delta produced by diffing the desired schema against the live one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    AddTable { table: String },
    DropTable { table: String },
    RenameTable { from: String, to: String },
    AddColumn { table: String, column: String },
    DropColumn { table: String, column: String },
    ModifyColumn {
        table: String,
        column: String,
        changed: Vec<ColumnAttr>,
    },
    RenameColumn {
        table: String,
        from: String,
        to: String,
    },
    AddIndex { table: String, index: String },
    DropIndex { table: String, index: String },
    AddForeignKey { table: String, name: String },
    DropForeignKey { table: String, name: String },
}

impl Change {
    /// The table this change applies to. For renames this is the new name.
    pub fn table(&self) -> &str {
        match self {
            Change::AddTable { table }
            | Change::DropTable { table }
            | Change::AddColumn { table, .. }
            | Change::DropColumn { table, .. }
            | Change::ModifyColumn { table, .. }
            | Change::RenameColumn { table, .. }
            | Change::AddIndex { table, .. }
            | Change::DropIndex { table, .. }
            | Change::AddForeignKey { table, .. }
            | Change::DropForeignKey { table, .. } => table,
            Change::RenameTable { to, .. } => to,
        }
    }

    /// The column this change applies to, if it is a column change.
    pub fn column(&self) -> Option<&str> {
        match self {
            Change::AddColumn { column, .. }
            | Change::DropColumn { column, .. }
            | Change::ModifyColumn { column, .. } => Some(column),
            Change::RenameColumn { to, .. } => Some(to),
            Change::AddTable { .. }
            | Change::DropTable { .. }
            | Change::RenameTable { .. }
            | Change::AddIndex { .. }
            | Change::DropIndex { .. }
            | Change::AddForeignKey { .. }
            | Change::DropForeignKey { .. } => None,
        }
    }
}

/// An ordered set of schema changes and the statements that realize them.
///
/// Hooks may append statements. They should not reorder `changes` unless they understand the
/// dependencies between them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub changes: Vec<Change>,
    pub statements: Vec<Statement>,
}

impl Plan {
    pub fn new(changes: Vec<Change>, statements: Vec<Statement>) -> Self {
        Self {
            changes,
            statements,
        }
    }

    /// A plan with statements only, as used when applying migration files.
    pub fn from_statements(statements: Vec<Statement>) -> Self {
        Self {
            changes: Vec::new(),
            statements,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.statements.is_empty()
    }

    pub fn push(&mut self, statement: impl Into<Statement>) {
        self.statements.push(statement.into());
    }

    pub fn has_change(&self, predicate: impl Fn(&Change) -> bool) -> bool {
        self.changes.iter().any(predicate)
    }
}

/// Computes the plan that moves the live database to the desired schema.
///
/// Diffing schemas is outside this crate; implement this over whatever inspector and differ
/// the application uses.
pub trait Planner {
    fn plan(&mut self, conn: &mut dyn Executor) -> Result<Plan, Error>;
}

impl<F> Planner for F
where
    F: FnMut(&mut dyn Executor) -> Result<Plan, Error>,
{
    fn plan(&mut self, conn: &mut dyn Executor) -> Result<Plan, Error> {
        self(conn)
    }
}
