use crate::apply::{ApplyContext, ApplyPipeline};
use crate::core::Executor;
use crate::dir::Version;
use crate::error::Error;
use crate::plan::{Change, Planner};
use crate::writer::MigrationWriter;

/// What one [`AutoMigrator::run`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoReport {
    /// Changes of the applied plan. Empty when the database was already up to date.
    pub changes: Vec<Change>,
    /// Statements in the plan before hooks ran.
    pub planned_statements: usize,
}

impl AutoReport {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty() && self.planned_statements == 0
    }
}

/// Plans against the live database and applies the result through a hook pipeline.
///
/// ```
/// use datamig::{ApplyContext, ApplyPipeline, AutoMigrator, Change, DataMigration, Executor, Plan, Trigger};
///
/// let planner = |conn: &mut dyn Executor| -> Result<Plan, datamig::Error> {
///     let exists = !conn
///         .query(&"SELECT name FROM sqlite_master WHERE name = 'users'".into())?
///         .is_empty();
///     if exists {
///         return Ok(Plan::default());
///     }
///     Ok(Plan::new(
///         vec![Change::AddTable { table: "users".into() }],
///         vec!["CREATE TABLE users (id INTEGER PRIMARY KEY, role TEXT)".into()],
///     ))
/// };
/// let pipeline = ApplyPipeline::builder()
///     .hook(
///         DataMigration::new("seed_admin", Trigger::table_added("users"))
///             .statement("INSERT INTO users (id, role) VALUES (1, 'admin')"),
///     )
///     .build();
///
/// let mut conn = rusqlite::Connection::open_in_memory()?;
/// let mut migrator = AutoMigrator::new(planner, pipeline);
/// assert!(!migrator.run(&ApplyContext::new(), &mut conn)?.is_noop());
/// assert!(migrator.run(&ApplyContext::new(), &mut conn)?.is_noop());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct AutoMigrator<P> {
    planner: P,
    pipeline: ApplyPipeline,
}

impl<P: Planner> AutoMigrator<P> {
    pub fn new(planner: P, pipeline: ApplyPipeline) -> Self {
        Self { planner, pipeline }
    }

    pub fn pipeline(&self) -> &ApplyPipeline {
        &self.pipeline
    }

    /// Plan, then apply unless the plan is empty.
    pub fn run(&mut self, ctx: &ApplyContext, conn: &mut dyn Executor) -> Result<AutoReport, Error> {
        let plan = self.planner.plan(conn)?;
        if plan.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Database is up to date, nothing to apply");
            return Ok(AutoReport::default());
        }
        let report = AutoReport {
            changes: plan.changes.clone(),
            planned_statements: plan.statements.len(),
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            changes = report.changes.len(),
            statements = report.planned_statements,
            "Applying planned changes"
        );

        self.pipeline.apply(ctx, conn, plan)?;
        Ok(report)
    }

    /// Plan against `conn`, run the plan through the hooks into a recording session and flush
    /// what was recorded as a new migration file named `name`.
    ///
    /// Nothing is executed against `conn` apart from what the planner reads. Returns `None` when
    /// the plan is empty and no file was written.
    pub fn write_plan(
        &mut self,
        ctx: &ApplyContext,
        conn: &mut dyn Executor,
        writer: &mut MigrationWriter,
        name: &str,
    ) -> Result<Option<Version>, Error> {
        let plan = self.planner.plan(conn)?;
        if plan.is_empty() {
            return Ok(None);
        }
        let pipeline = &mut self.pipeline;
        writer.record(|session| pipeline.apply(ctx, session, plan))?;
        writer.flush(name).map(Some)
    }
}
