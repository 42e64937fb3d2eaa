//! The plan/apply pipeline.
//!
//! An [`ApplyPipeline`] is a chain of [`Hook`]s around a terminal stage that runs every statement
//! of a [`Plan`] in order. Each hook receives the already composed next stage and decides for
//! itself whether to call it, so a hook can pass the plan through, append statements to it,
//! replace it, or veto the apply by returning an error.
//!
//! ```
//! use datamig::{ApplyContext, ApplyPipeline, Error, Plan, RecordingSession, Statement};
//! use datamig::apply::hook_fn;
//!
//! let mut pipeline = ApplyPipeline::builder()
//!     .hook(hook_fn(|ctx, conn, plan: Plan, next| {
//!         if plan.statements.iter().any(|s| s.sql.starts_with("DROP")) {
//!             return Err(Error::veto("no-drops", "plan drops a table"));
//!         }
//!         next.apply(ctx, conn, plan)
//!     }))
//!     .build();
//!
//! let mut conn = RecordingSession::new();
//! let plan = Plan::from_statements(vec![Statement::new("DROP TABLE users")]);
//! let err = pipeline.apply(&ApplyContext::new(), &mut conn, plan).unwrap_err();
//! assert!(matches!(err, Error::HookVeto { .. }));
//! assert!(conn.is_empty());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::Executor;
use crate::error::Error;
use crate::plan::Plan;

/// Per-apply context. Clones share the same cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct ApplyContext {
    cancelled: Arc<AtomicBool>,
}

impl ApplyContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running apply to stop before its next statement.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Whether the terminal stage wraps a plan in a transaction.
///
/// Transactional DDL is dialect dependent (MySQL commits implicitly on most DDL), so this is a
/// choice of the caller rather than a guarantee of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxMode {
    /// Statements run as they come; a failure leaves the effects of earlier statements in place.
    #[default]
    None,
    /// Begin before the first statement, commit after the last, roll back on failure or
    /// cancellation.
    Wrap,
}

/// One stage of the pipeline.
pub trait Applier {
    fn apply(&mut self, ctx: &ApplyContext, conn: &mut dyn Executor, plan: Plan)
        -> Result<(), Error>;
}

/// Wraps the next stage of the pipeline into a new stage.
pub trait Hook {
    fn wrap(self: Box<Self>, next: Box<dyn Applier>) -> Box<dyn Applier>;
}

impl<F> Hook for F
where
    F: FnOnce(Box<dyn Applier>) -> Box<dyn Applier>,
{
    fn wrap(self: Box<Self>, next: Box<dyn Applier>) -> Box<dyn Applier> {
        (*self)(next)
    }
}

/// A hook written as one function that receives the plan together with the next stage.
pub fn hook_fn<F>(f: F) -> FnHook<F>
where
    F: FnMut(&ApplyContext, &mut dyn Executor, Plan, &mut dyn Applier) -> Result<(), Error>
        + 'static,
{
    FnHook { f }
}

/// See [`hook_fn`].
pub struct FnHook<F> {
    f: F,
}

impl<F> Hook for FnHook<F>
where
    F: FnMut(&ApplyContext, &mut dyn Executor, Plan, &mut dyn Applier) -> Result<(), Error>
        + 'static,
{
    fn wrap(self: Box<Self>, next: Box<dyn Applier>) -> Box<dyn Applier> {
        Box::new(FnStage { f: self.f, next })
    }
}

struct FnStage<F> {
    f: F,
    next: Box<dyn Applier>,
}

impl<F> Applier for FnStage<F>
where
    F: FnMut(&ApplyContext, &mut dyn Executor, Plan, &mut dyn Applier) -> Result<(), Error>,
{
    fn apply(
        &mut self,
        ctx: &ApplyContext,
        conn: &mut dyn Executor,
        plan: Plan,
    ) -> Result<(), Error> {
        (self.f)(ctx, conn, plan, self.next.as_mut())
    }
}

/// The last stage: runs every statement in order, stopping at the first failure.
struct Terminal {
    tx_mode: TxMode,
}

impl Terminal {
    fn rollback(conn: &mut dyn Executor) {
        if let Err(_error) = conn.rollback() {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %_error, "Rollback failed");
        }
    }
}

impl Applier for Terminal {
    fn apply(
        &mut self,
        ctx: &ApplyContext,
        conn: &mut dyn Executor,
        plan: Plan,
    ) -> Result<(), Error> {
        let wrap = self.tx_mode == TxMode::Wrap;
        if wrap {
            conn.begin()?;
        }
        for (index, statement) in plan.statements.iter().enumerate() {
            if ctx.is_cancelled() {
                #[cfg(feature = "tracing")]
                tracing::info!(index, "Apply cancelled");
                if wrap {
                    Self::rollback(conn);
                }
                return Err(Error::Cancelled { index });
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(index, sql = %statement.sql, "Executing statement");
            if let Err(source) = conn.execute(statement) {
                #[cfg(feature = "tracing")]
                tracing::error!(index, error = %source, "Statement failed");
                if wrap {
                    Self::rollback(conn);
                }
                return Err(Error::PlanExecution {
                    index,
                    sql: statement.sql.clone(),
                    source: Box::new(source),
                });
            }
        }
        if wrap {
            conn.commit()?;
        }
        Ok(())
    }
}

/// A composed chain of hooks around the terminal executor.
pub struct ApplyPipeline {
    chain: Box<dyn Applier>,
    hooks: usize,
    tx_mode: TxMode,
}

// Manual Debug impl since hooks don't implement Debug
impl std::fmt::Debug for ApplyPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyPipeline")
            .field("hooks", &self.hooks)
            .field("tx_mode", &self.tx_mode)
            .finish()
    }
}

impl Default for ApplyPipeline {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ApplyPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn tx_mode(&self) -> TxMode {
        self.tx_mode
    }

    /// Run the plan through every hook and, if they all call their next stage, execute it.
    pub fn apply(
        &mut self,
        ctx: &ApplyContext,
        conn: &mut dyn Executor,
        plan: Plan,
    ) -> Result<(), Error> {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            changes = plan.changes.len(),
            statements = plan.statements.len(),
            hooks = self.hooks,
            "Applying plan"
        );
        self.chain.apply(ctx, conn, plan)
    }
}

/// Collects hooks in order. The first hook added is the outermost and sees the plan first.
#[derive(Default)]
pub struct PipelineBuilder {
    hooks: Vec<Box<dyn Hook>>,
    tx_mode: TxMode,
}

impl PipelineBuilder {
    pub fn hook(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn hooks<I, H>(mut self, hooks: I) -> Self
    where
        I: IntoIterator<Item = H>,
        H: Hook + 'static,
    {
        for hook in hooks {
            self.hooks.push(Box::new(hook));
        }
        self
    }

    pub fn tx_mode(mut self, tx_mode: TxMode) -> Self {
        self.tx_mode = tx_mode;
        self
    }

    pub fn build(self) -> ApplyPipeline {
        let hooks = self.hooks.len();
        let mut chain: Box<dyn Applier> = Box::new(Terminal {
            tx_mode: self.tx_mode,
        });
        for hook in self.hooks.into_iter().rev() {
            chain = hook.wrap(chain);
        }
        ApplyPipeline {
            chain,
            hooks,
            tx_mode: self.tx_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::core::Statement;
    use crate::testing::MockExecutor;

    fn plan(sql: &[&str]) -> Plan {
        Plan::from_statements(sql.iter().map(|s| Statement::new(*s)).collect())
    }

    fn appending(sql: &'static str) -> impl Hook {
        hook_fn(move |ctx, conn, mut plan: Plan, next| {
            plan.push(sql);
            next.apply(ctx, conn, plan)
        })
    }

    #[test]
    fn stops_at_first_failing_statement() {
        let mut conn = MockExecutor::new().fail_on("S2");
        let err = ApplyPipeline::default()
            .apply(&ApplyContext::new(), &mut conn, plan(&["S1", "S2", "S3"]))
            .unwrap_err();
        match err {
            Error::PlanExecution { index, sql, .. } => {
                assert_eq!(index, 1);
                assert_eq!(sql, "S2");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(conn.attempted_sql(), vec!["S1", "S2"]);
    }

    #[test]
    fn veto_skips_the_rest_of_the_chain() {
        let reached = Arc::new(Mutex::new(false));
        let reached_in_hook = reached.clone();
        let mut pipeline = ApplyPipeline::builder()
            .hook(hook_fn(|_ctx, _conn, _plan: Plan, _next| {
                Err(Error::veto("h1", "not today"))
            }))
            .hook(hook_fn(move |ctx, conn, plan: Plan, next| {
                *reached_in_hook.lock().unwrap() = true;
                next.apply(ctx, conn, plan)
            }))
            .build();
        let mut conn = MockExecutor::new();
        let err = pipeline
            .apply(&ApplyContext::new(), &mut conn, plan(&["S1"]))
            .unwrap_err();
        assert_eq!(err.to_string(), "hook 'h1' vetoed the apply: not today");
        assert!(!*reached.lock().unwrap());
        assert!(conn.attempted().is_empty());
    }

    #[test]
    fn hooks_run_in_registration_order() {
        let mut pipeline = ApplyPipeline::builder()
            .hook(appending("H1"))
            .hook(appending("H2"))
            .build();
        let mut conn = MockExecutor::new();
        pipeline
            .apply(&ApplyContext::new(), &mut conn, plan(&["S1"]))
            .unwrap();
        assert_eq!(conn.attempted_sql(), vec!["S1", "H1", "H2"]);
    }

    #[test]
    fn hook_can_replace_the_plan() {
        let mut pipeline = ApplyPipeline::builder()
            .hook(appending("H1"))
            .hook(hook_fn(|ctx, conn, _plan: Plan, next| {
                next.apply(ctx, conn, plan(&["REPLACED"]))
            }))
            .build();
        let mut conn = MockExecutor::new();
        pipeline
            .apply(&ApplyContext::new(), &mut conn, plan(&["S1"]))
            .unwrap();
        assert_eq!(conn.attempted_sql(), vec!["REPLACED"]);
    }

    #[test]
    fn closures_over_the_next_stage_are_hooks() {
        struct Counting {
            next: Box<dyn Applier>,
            seen: Arc<Mutex<usize>>,
        }
        impl Applier for Counting {
            fn apply(
                &mut self,
                ctx: &ApplyContext,
                conn: &mut dyn Executor,
                plan: Plan,
            ) -> Result<(), Error> {
                *self.seen.lock().unwrap() += plan.statements.len();
                self.next.apply(ctx, conn, plan)
            }
        }
        let seen = Arc::new(Mutex::new(0));
        let seen_by_hook = seen.clone();
        let mut pipeline = ApplyPipeline::builder()
            .hook(move |next: Box<dyn Applier>| -> Box<dyn Applier> {
                Box::new(Counting {
                    next,
                    seen: seen_by_hook,
                })
            })
            .build();
        let mut conn = MockExecutor::new();
        pipeline
            .apply(&ApplyContext::new(), &mut conn, plan(&["S1", "S2"]))
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[test]
    fn cancelled_context_stops_before_the_next_statement() {
        struct CancelAfterFirst {
            inner: MockExecutor,
            ctx: ApplyContext,
        }
        impl Executor for CancelAfterFirst {
            fn execute(&mut self, statement: &Statement) -> Result<u64, Error> {
                let result = self.inner.execute(statement);
                self.ctx.cancel();
                result
            }
            fn query(&mut self, statement: &Statement) -> Result<Vec<crate::Row>, Error> {
                self.inner.query(statement)
            }
        }
        let ctx = ApplyContext::new();
        let mut conn = CancelAfterFirst {
            inner: MockExecutor::new(),
            ctx: ctx.clone(),
        };
        let err = ApplyPipeline::default()
            .apply(&ctx, &mut conn, plan(&["S1", "S2", "S3"]))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { index: 1 }));
        assert_eq!(conn.inner.attempted_sql(), vec!["S1"]);
    }

    #[test]
    fn wrapped_plan_rolls_back_on_failure() {
        let mut pipeline = ApplyPipeline::builder().tx_mode(TxMode::Wrap).build();
        let mut conn = MockExecutor::new().fail_on("S2");
        pipeline
            .apply(&ApplyContext::new(), &mut conn, plan(&["S1", "S2", "S3"]))
            .unwrap_err();
        assert_eq!(conn.attempted_sql(), vec!["BEGIN", "S1", "S2", "ROLLBACK"]);

        let mut conn = MockExecutor::new();
        pipeline
            .apply(&ApplyContext::new(), &mut conn, plan(&["S1"]))
            .unwrap();
        assert_eq!(conn.attempted_sql(), vec!["BEGIN", "S1", "COMMIT"]);
    }
}
