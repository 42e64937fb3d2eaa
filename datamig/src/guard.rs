use std::fmt;

use crate::apply::{ApplyContext, Applier, Hook};
use crate::core::{Executor, Statement};
use crate::error::Error;
use crate::plan::{Change, ColumnAttr, Plan};

/// Which schema change makes a [`DataMigration`] fire.
pub enum Trigger {
    ColumnAdded {
        table: String,
        column: String,
    },
    /// Fires when the column is modified. With `attr` set, only when that attribute changed.
    ColumnModified {
        table: String,
        column: String,
        attr: Option<ColumnAttr>,
    },
    ColumnAddedOrModified {
        table: String,
        column: String,
    },
    TableAdded {
        table: String,
    },
    Custom(Box<dyn Fn(&Change) -> bool + Send + Sync>),
}

impl Trigger {
    pub fn column_added(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::ColumnAdded {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn column_modified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::ColumnModified {
            table: table.into(),
            column: column.into(),
            attr: None,
        }
    }

    pub fn column_added_or_modified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::ColumnAddedOrModified {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn table_added(table: impl Into<String>) -> Self {
        Self::TableAdded {
            table: table.into(),
        }
    }

    pub fn custom(predicate: impl Fn(&Change) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Box::new(predicate))
    }

    /// Restrict a [`Trigger::ColumnModified`] to one attribute. Other triggers are unchanged.
    pub fn on_attr(self, attr: ColumnAttr) -> Self {
        match self {
            Self::ColumnModified { table, column, .. } => Self::ColumnModified {
                table,
                column,
                attr: Some(attr),
            },
            other => other,
        }
    }

    pub fn matches(&self, change: &Change) -> bool {
        match self {
            Trigger::ColumnAdded { table, column } => column_added(change, table, column),
            Trigger::ColumnModified {
                table,
                column,
                attr,
            } => column_modified(change, table, column, *attr),
            Trigger::ColumnAddedOrModified { table, column } => {
                column_added(change, table, column) || column_modified(change, table, column, None)
            }
            Trigger::TableAdded { table } => {
                matches!(change, Change::AddTable { table: t } if t == table)
            }
            Trigger::Custom(predicate) => predicate(change),
        }
    }
}

fn column_added(change: &Change, table: &str, column: &str) -> bool {
    matches!(change, Change::AddColumn { table: t, column: c } if t == table && c == column)
}

fn column_modified(change: &Change, table: &str, column: &str, attr: Option<ColumnAttr>) -> bool {
    match change {
        Change::ModifyColumn {
            table: t,
            column: c,
            changed,
        } => t == table && c == column && attr.map_or(true, |a| changed.contains(&a)),
        _ => false,
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::ColumnAdded { table, column } => f
                .debug_struct("ColumnAdded")
                .field("table", table)
                .field("column", column)
                .finish(),
            Trigger::ColumnModified {
                table,
                column,
                attr,
            } => f
                .debug_struct("ColumnModified")
                .field("table", table)
                .field("column", column)
                .field("attr", attr)
                .finish(),
            Trigger::ColumnAddedOrModified { table, column } => f
                .debug_struct("ColumnAddedOrModified")
                .field("table", table)
                .field("column", column)
                .finish(),
            Trigger::TableAdded { table } => {
                f.debug_struct("TableAdded").field("table", table).finish()
            }
            Trigger::Custom(_) => f.write_str("Custom(<predicate>)"),
        }
    }
}

/// A hook that appends data statements to a plan, but only when the plan contains the schema
/// change those statements depend on.
///
/// Because the guard looks at the changes of the plan being applied and not at any history, a
/// backfill tied to "column added" runs again if the column is later dropped and re-added.
///
/// ```
/// use datamig::{ApplyContext, ApplyPipeline, Change, DataMigration, Plan, RecordingSession, Trigger};
///
/// let mut pipeline = ApplyPipeline::builder()
///     .hook(
///         DataMigration::new("default_user_names", Trigger::column_added("users", "name"))
///             .statement("UPDATE users SET name = 'Unknown' WHERE name IS NULL"),
///     )
///     .build();
///
/// let plan = Plan::new(
///     vec![Change::AddColumn { table: "users".into(), column: "name".into() }],
///     vec!["ALTER TABLE users ADD COLUMN name TEXT".into()],
/// );
/// let mut session = RecordingSession::new();
/// pipeline.apply(&ApplyContext::new(), &mut session, plan).unwrap();
/// assert_eq!(session.statements().len(), 2);
/// # session.discard();
/// ```
#[derive(Debug)]
pub struct DataMigration {
    name: String,
    trigger: Trigger,
    statements: Vec<Statement>,
}

impl DataMigration {
    pub fn new(name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            trigger,
            statements: Vec::new(),
        }
    }

    /// Add a statement to run when the trigger matches.
    pub fn statement(mut self, statement: impl Into<Statement>) -> Self {
        self.statements.push(statement.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this data migration fires for `plan`.
    pub fn is_triggered_by(&self, plan: &Plan) -> bool {
        plan.has_change(|change| self.trigger.matches(change))
    }

    fn append_to(&self, plan: &mut Plan) {
        for (i, statement) in self.statements.iter().enumerate() {
            let mut statement = statement.clone();
            if i == 0 {
                let label = format!("data migration: {}", self.name);
                statement.comment = Some(match statement.comment.take() {
                    Some(existing) => format!("{label}\n{existing}"),
                    None => label,
                });
            }
            plan.statements.push(statement);
        }
    }
}

impl Hook for DataMigration {
    fn wrap(self: Box<Self>, next: Box<dyn Applier>) -> Box<dyn Applier> {
        Box::new(DataMigrationStage {
            migration: *self,
            next,
        })
    }
}

struct DataMigrationStage {
    migration: DataMigration,
    next: Box<dyn Applier>,
}

impl Applier for DataMigrationStage {
    fn apply(
        &mut self,
        ctx: &ApplyContext,
        conn: &mut dyn Executor,
        mut plan: Plan,
    ) -> Result<(), Error> {
        if self.migration.is_triggered_by(&plan) {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                data_migration = %self.migration.name,
                statements = self.migration.statements.len(),
                "Data migration triggered"
            );
            self.migration.append_to(&mut plan);
        } else {
            #[cfg(feature = "tracing")]
            tracing::debug!(data_migration = %self.migration.name, "Data migration not triggered");
        }
        self.next.apply(ctx, conn, plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::ApplyPipeline;
    use crate::testing::MockExecutor;

    fn name_backfill() -> DataMigration {
        DataMigration::new("default_user_names", Trigger::column_added("users", "name"))
            .statement("UPDATE users SET name='Unknown' WHERE name IS NULL")
    }

    fn add_name_column() -> Plan {
        Plan::new(
            vec![Change::AddColumn {
                table: "users".into(),
                column: "name".into(),
            }],
            vec![Statement::new("ALTER TABLE users ADD COLUMN name TEXT")],
        )
    }

    #[test]
    fn appends_when_change_is_present() {
        let mut pipeline = ApplyPipeline::builder().hook(name_backfill()).build();
        let mut conn = MockExecutor::new();
        pipeline
            .apply(&ApplyContext::new(), &mut conn, add_name_column())
            .unwrap();
        assert_eq!(
            conn.attempted_sql(),
            vec![
                "ALTER TABLE users ADD COLUMN name TEXT",
                "UPDATE users SET name='Unknown' WHERE name IS NULL",
            ]
        );
        assert_eq!(
            conn.attempted()[1].comment.as_deref(),
            Some("data migration: default_user_names")
        );
    }

    #[test]
    fn plan_without_change_gains_nothing() {
        let mut pipeline = ApplyPipeline::builder().hook(name_backfill()).build();
        let mut conn = MockExecutor::new();
        pipeline
            .apply(&ApplyContext::new(), &mut conn, add_name_column())
            .unwrap();
        let mut conn = MockExecutor::new();
        let later = Plan::new(
            vec![Change::AddIndex {
                table: "users".into(),
                index: "users_name".into(),
            }],
            vec![Statement::new("CREATE INDEX users_name ON users (name)")],
        );
        pipeline
            .apply(&ApplyContext::new(), &mut conn, later)
            .unwrap();
        assert_eq!(
            conn.attempted_sql(),
            vec!["CREATE INDEX users_name ON users (name)"]
        );
    }

    #[test]
    fn fires_again_when_column_is_re_added() {
        let mut pipeline = ApplyPipeline::builder().hook(name_backfill()).build();
        for _ in 0..2 {
            let mut conn = MockExecutor::new();
            pipeline
                .apply(&ApplyContext::new(), &mut conn, add_name_column())
                .unwrap();
            assert_eq!(conn.attempted().len(), 2);
        }
    }

    #[test]
    fn trigger_matching() {
        let modified = Change::ModifyColumn {
            table: "users".into(),
            column: "email".into(),
            changed: vec![ColumnAttr::Nullability],
        };
        assert!(Trigger::column_modified("users", "email").matches(&modified));
        assert!(Trigger::column_added_or_modified("users", "email").matches(&modified));
        assert!(Trigger::column_modified("users", "email")
            .on_attr(ColumnAttr::Nullability)
            .matches(&modified));
        assert!(!Trigger::column_modified("users", "email")
            .on_attr(ColumnAttr::Type)
            .matches(&modified));
        assert!(!Trigger::column_added("users", "email").matches(&modified));
        assert!(!Trigger::column_modified("accounts", "email").matches(&modified));

        let added = Change::AddTable {
            table: "audit".into(),
        };
        assert!(Trigger::table_added("audit").matches(&added));
        assert!(Trigger::custom(|c| c.table().starts_with("aud")).matches(&added));
        assert!(!Trigger::table_added("users").matches(&added));
    }

    #[test]
    fn keeps_existing_comment_of_first_statement() {
        let migration = DataMigration::new("seed", Trigger::table_added("roles"))
            .statement(Statement::new("INSERT INTO roles VALUES ('admin')").with_comment("admins"))
            .statement("INSERT INTO roles VALUES ('member')");
        let mut plan = Plan::new(
            vec![Change::AddTable {
                table: "roles".into(),
            }],
            vec![],
        );
        migration.append_to(&mut plan);
        assert_eq!(
            plan.statements[0].comment.as_deref(),
            Some("data migration: seed\nadmins")
        );
        assert_eq!(plan.statements[1].comment, None);
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn backfills_a_live_sqlite_database() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY); INSERT INTO users (id) VALUES (1), (2);")
            .unwrap();
        let mut pipeline = ApplyPipeline::builder().hook(name_backfill()).build();
        pipeline
            .apply(&ApplyContext::new(), &mut conn, add_name_column())
            .unwrap();
        let unknown: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE name = 'Unknown'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(unknown, 2);
    }
}
