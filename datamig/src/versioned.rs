use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::apply::{ApplyContext, ApplyPipeline, TxMode};
use crate::core::{Executor, Statement, Value};
use crate::dir::{MigrationDir, MigrationFile, Version};
use crate::error::Error;
use crate::ledger::{self, Manifest};
use crate::plan::Plan;

pub(crate) const DEFAULT_REVISION_TABLE_NAME: &str = "_datamig_revisions_";

/// A migration file recorded as applied in the revision table.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub version: Version,
    pub name: String,
    pub applied_at: DateTime<Utc>,
    /// Manifest hash of the file at the time it was applied.
    pub hash: String,
}

/// Applied revisions and pending files of a directory against one database.
#[derive(Debug)]
pub struct Status {
    pub applied: Vec<Revision>,
    pub pending: Vec<MigrationFile>,
}

/// The file an upgrade stopped at, and why.
#[derive(Debug)]
pub struct FileFailure {
    pub version: Version,
    pub file_name: String,
    pub error: Error,
}

/// The result of [`DirMigrator::upgrade`].
#[derive(Debug)]
pub struct UpgradeReport {
    /// Versions applied by this call, in order.
    pub applied: Vec<Version>,
    pub failing: Option<FileFailure>,
}

/// Applies the pending files of a [`MigrationDir`] in version order and records each one in a
/// revision table.
///
/// Each file is applied as one plan whose last statement inserts its revision row, so with
/// [`TxMode::Wrap`] (the default) a file and its revision commit together.
///
/// ```
/// use datamig::{ApplyContext, DirMigrator, MigrationDir};
///
/// let tmp = tempfile::tempdir()?;
/// std::fs::write(
///     tmp.path().join("1_create_users.sql"),
///     "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);\n",
/// )?;
/// let dir = MigrationDir::open(tmp.path())?;
/// datamig::ledger::write(&dir)?;
///
/// let mut conn = rusqlite::Connection::open_in_memory()?;
/// let report = DirMigrator::new(dir).upgrade(&ApplyContext::new(), &mut conn, None)?;
/// assert_eq!(report.applied.len(), 1);
/// assert!(report.failing.is_none());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct DirMigrator {
    dir: MigrationDir,
    revision_table_name: String,
    tx_mode: TxMode,
    on_migration_start: Option<Box<dyn Fn(&Version, &str) + Send + Sync>>,
    on_migration_complete: Option<Box<dyn Fn(&Version, &str, Duration) + Send + Sync>>,
    on_migration_error: Option<Box<dyn Fn(&Version, &str, &Error) + Send + Sync>>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for DirMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirMigrator")
            .field("dir", &self.dir)
            .field("revision_table_name", &self.revision_table_name)
            .field("tx_mode", &self.tx_mode)
            .field("on_migration_start", &self.on_migration_start.is_some())
            .field(
                "on_migration_complete",
                &self.on_migration_complete.is_some(),
            )
            .field("on_migration_error", &self.on_migration_error.is_some())
            .finish()
    }
}

impl DirMigrator {
    pub fn new(dir: MigrationDir) -> Self {
        Self {
            dir,
            revision_table_name: DEFAULT_REVISION_TABLE_NAME.to_string(),
            tx_mode: TxMode::Wrap,
            on_migration_start: None,
            on_migration_complete: None,
            on_migration_error: None,
        }
    }

    /// Set a custom name for the revision table. Defaults to `_datamig_revisions_`.
    pub fn with_revision_table_name(mut self, name: impl Into<String>) -> Self {
        self.revision_table_name = name.into();
        self
    }

    /// How each file is applied. Defaults to [`TxMode::Wrap`].
    pub fn with_tx_mode(mut self, tx_mode: TxMode) -> Self {
        self.tx_mode = tx_mode;
        self
    }

    /// Called before each file is applied, with its version and name.
    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Version, &str) + Send + Sync + 'static,
    {
        self.on_migration_start = Some(Box::new(callback));
        self
    }

    /// Called after each file is applied, with its version, name and how long it took.
    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Version, &str, Duration) + Send + Sync + 'static,
    {
        self.on_migration_complete = Some(Box::new(callback));
        self
    }

    /// Called when a file fails to apply.
    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Version, &str, &Error) + Send + Sync + 'static,
    {
        self.on_migration_error = Some(Box::new(callback));
        self
    }

    pub fn dir(&self) -> &MigrationDir {
        &self.dir
    }

    pub fn revision_table_name(&self) -> &str {
        &self.revision_table_name
    }

    fn ensure_revision_table(&self, conn: &mut dyn Executor) -> Result<(), Error> {
        conn.execute(&Statement::new(format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             version VARCHAR(255) NOT NULL PRIMARY KEY, \
             name VARCHAR(255) NOT NULL, \
             applied_at VARCHAR(64) NOT NULL, \
             hash VARCHAR(255) NOT NULL)",
            self.revision_table_name
        )))?;
        Ok(())
    }

    /// Revisions recorded in the database, in version order. Creates the revision table if it
    /// does not exist yet.
    pub fn applied(&self, conn: &mut dyn Executor) -> Result<Vec<Revision>, Error> {
        self.ensure_revision_table(conn)?;
        let rows = conn.query(&Statement::new(format!(
            "SELECT version, name, applied_at, hash FROM {}",
            self.revision_table_name
        )))?;
        let mut revisions = rows
            .iter()
            .map(|row| self.revision_from_row(row))
            .collect::<Result<Vec<_>, _>>()?;
        revisions.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(revisions)
    }

    fn revision_from_row(&self, row: &[Value]) -> Result<Revision, Error> {
        let text = |i: usize, column: &str| -> Result<String, Error> {
            row.get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::Generic(format!(
                        "revision table {} has an unexpected value in column {column}: {:?}",
                        self.revision_table_name,
                        row.get(i)
                    ))
                })
        };
        let applied_at = text(2, "applied_at")?;
        let applied_at = DateTime::parse_from_rfc3339(&applied_at)
            .map_err(|e| Error::Generic(format!("Failed to parse datetime: {}", e)))?
            .with_timezone(&Utc);
        Ok(Revision {
            version: Version::new(text(0, "version")?),
            name: text(1, "name")?,
            applied_at,
            hash: text(3, "hash")?,
        })
    }

    /// Check the directory against its manifest and the database, and split the files into
    /// applied and pending.
    pub fn status(&self, conn: &mut dyn Executor) -> Result<Status, Error> {
        self.checked_status(conn).map(|(_, status)| status)
    }

    fn checked_status(&self, conn: &mut dyn Executor) -> Result<(Manifest, Status), Error> {
        let manifest = ledger::check(&self.dir)?;
        let files = self.dir.files()?;
        let applied = self.applied(conn)?;
        validate(&manifest, &files, &applied)?;
        let pending = files
            .into_iter()
            .filter(|file| !applied.iter().any(|r| &r.version == file.version()))
            .collect();
        Ok((manifest, Status { applied, pending }))
    }

    /// Apply pending files in version order, at most `limit` of them when given.
    ///
    /// Validation problems (manifest drift, changed or missing applied files, out of order files)
    /// are returned as errors before anything runs. A file that fails to apply stops the upgrade
    /// and is reported in [`UpgradeReport::failing`] alongside the files applied before it.
    pub fn upgrade(
        &self,
        ctx: &ApplyContext,
        conn: &mut dyn Executor,
        limit: Option<usize>,
    ) -> Result<UpgradeReport, Error> {
        let (manifest, status) = self.checked_status(conn)?;
        let pending: Vec<MigrationFile> = match limit {
            Some(limit) => status.pending.into_iter().take(limit).collect(),
            None => status.pending,
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            applied = status.applied.len(),
            pending = ?pending.iter().map(MigrationFile::file_name).collect::<Vec<_>>(),
            limit = ?limit,
            "Considering migration files to apply"
        );

        let mut pipeline = ApplyPipeline::builder().tx_mode(self.tx_mode).build();
        // all files applied by this call share one timestamp
        let batch_applied_at = Utc::now().to_rfc3339();
        let mut applied = Vec::new();
        let mut failing = None;

        for file in pending {
            let version = file.version().clone();

            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!(
                "datamig_file_up",
                version = %version,
                file = %file.file_name()
            )
            .entered();

            #[cfg(feature = "tracing")]
            tracing::info!("Starting migration file");

            if let Some(ref callback) = self.on_migration_start {
                callback(&version, file.name());
            }
            let started = Instant::now();

            let hash = manifest
                .entry(&version)
                .map(|entry| entry.hash.clone())
                .ok_or_else(|| {
                    Error::Generic(format!(
                        "manifest has no entry for {}",
                        file.file_name()
                    ))
                })?;
            let mut plan = Plan::from_statements(file.statements());
            plan.push(self.revision_insert(&file, &batch_applied_at, &hash)?);

            match pipeline.apply(ctx, conn, plan) {
                Ok(()) => {
                    let duration = started.elapsed();

                    #[cfg(feature = "tracing")]
                    tracing::info!(
                        duration_ms = duration.as_millis(),
                        "Migration file applied"
                    );

                    if let Some(ref callback) = self.on_migration_complete {
                        callback(&version, file.name(), duration);
                    }
                    applied.push(version);
                }
                Err(error) => {
                    let error = error.in_file(file.file_name());

                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %error, "Migration file failed");

                    if let Some(ref callback) = self.on_migration_error {
                        callback(&version, file.name(), &error);
                    }
                    failing = Some(FileFailure {
                        version,
                        file_name: file.file_name().to_string(),
                        error,
                    });
                    break;
                }
            }
        }

        Ok(UpgradeReport { applied, failing })
    }

    fn revision_insert(
        &self,
        file: &MigrationFile,
        applied_at: &str,
        hash: &str,
    ) -> Result<Statement, Error> {
        let insert = Statement::new(format!(
            "INSERT INTO {} (version, name, applied_at, hash) VALUES (?, ?, ?, ?)",
            self.revision_table_name
        ))
        .bind(file.version().as_str())
        .bind(file.name())
        .bind(applied_at)
        .bind(hash);
        // inlined so the same text works with every driver's placeholder syntax
        Ok(Statement::new(insert.to_literal_sql()?))
    }
}

fn validate(manifest: &Manifest, files: &[MigrationFile], applied: &[Revision]) -> Result<(), Error> {
    let by_version: BTreeMap<&Version, &MigrationFile> =
        files.iter().map(|f| (f.version(), f)).collect();

    for revision in applied {
        let Some(file) = by_version.get(&revision.version) else {
            return Err(Error::Generic(format!(
                "Revision {} ('{}') was previously applied but is no longer present in the migration directory. \
                Applied migration files cannot be removed.",
                revision.version, revision.name
            )));
        };
        let current = manifest
            .entry(&revision.version)
            .map(|entry| entry.hash.as_str())
            .unwrap_or_default();
        if current != revision.hash {
            return Err(Error::Generic(format!(
                "Migration file {} hash mismatch. Recorded '{}' but found '{}'. \
                This indicates the file was modified after being applied.",
                file.file_name(),
                revision.hash,
                current
            )));
        }
    }

    if let Some(newest) = applied.iter().map(|r| &r.version).max() {
        if let Some(file) = files
            .iter()
            .find(|f| f.version() < newest && !applied.iter().any(|r| &r.version == f.version()))
        {
            return Err(Error::Generic(format!(
                "Migration file {} was not applied, yet the newer revision {} already is. \
                This likely means the file was added after {} was applied.",
                file.file_name(),
                newest,
                newest
            )));
        }
    }
    Ok(())
}
