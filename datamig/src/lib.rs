#![cfg_attr(docsrs, feature(doc_cfg))]
//! `datamig` is a library for versioned SQL migration directories and hookable schema applies.
//!
//! Core concepts:
//! - Data migrations are written as ordinary Rust code against an [`Executor`]. Run that code
//!   against a [`RecordingSession`] and the [`MigrationWriter`] turns what it would have executed
//!   into a versioned migration file.
//! - Every migration directory carries an integrity manifest (`datamig.sum`, see [`ledger`]), so
//!   edits to files that were already written are detected before anything is applied.
//! - Schema changes flow through an [`ApplyPipeline`] of hooks. A [`DataMigration`] hook adds its
//!   statements only to plans containing the schema change it depends on.
//!
//! # Motivation
//!
//! ## One code path for live and generated migrations
//!
//! Backfills tend to be written twice: once as SQL in a migration file, once as application code
//! that already knows how to compute the values. With an [`Executor`] as the execution sink the
//! same function can either change a live database or be recorded into a file:
//!
//! ```
//! use datamig::{Executor, MigrationDir, MigrationWriter, Statement};
//!
//! fn backfill_tags(conn: &mut dyn Executor) -> Result<(), datamig::Error> {
//!     conn.execute(
//!         &Statement::new("UPDATE users SET tags = ? WHERE tags IS NULL")
//!             .bind(serde_json::json!(["foo", "bar"])),
//!     )?;
//!     Ok(())
//! }
//!
//! let tmp = tempfile::tempdir()?;
//! let mut writer = MigrationWriter::new(MigrationDir::open(tmp.path())?);
//! writer.record(|session| backfill_tags(session))?;
//! let version = writer.flush_with_comment("backfill_user_tags", "Backfill NULL tags")?;
//! # let _ = version;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Guarded data migrations
//!
//! Tying a data fix to the schema change that needs it, rather than to a point in history, keeps
//! it correct when that change happens again (a column dropped and re-added gets backfilled
//! again). See [`DataMigration`] and [`AutoMigrator`].
//!
//! # Benefits
//! - Versioned apply of migration directories with a revision table: [`DirMigrator`].
//! - Configurable transaction wrapping ([`TxMode`]) instead of assuming transactional DDL.
//! - Cancellation between statements through [`ApplyContext`].
//! - Observability callbacks on [`DirMigrator`].
//! - Tracing integration - available with the `tracing` feature flag.
//! - Testing utilities - available with the `testing` feature flag.
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag.
//! - [`MySQL`](mysql) - available with the `mysql` feature flag.
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.

mod core;
pub use core::{Executor, Row, Statement, Value};

mod error;
pub use error::Error;

mod sql;

mod capture;
pub use capture::RecordingSession;

mod dir;
pub use dir::{MigrationDir, MigrationFile, Version};

pub mod ledger;

mod writer;
pub use writer::MigrationWriter;

mod plan;
pub use plan::{Change, ColumnAttr, Plan, Planner};

pub mod apply;
pub use apply::{ApplyContext, ApplyPipeline, Applier, Hook, PipelineBuilder, TxMode};

mod guard;
pub use guard::{DataMigration, Trigger};

mod versioned;
pub use versioned::{DirMigrator, FileFailure, Revision, Status, UpgradeReport};

mod auto;
pub use auto::{AutoMigrator, AutoReport};

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "mysql")]
#[cfg_attr(docsrs, doc(cfg(feature = "mysql")))]
pub mod mysql;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
