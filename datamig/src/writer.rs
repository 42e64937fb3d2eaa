use std::collections::HashSet;
use std::io::ErrorKind;

use chrono::{DateTime, Utc};

use crate::capture::RecordingSession;
use crate::core::Statement;
use crate::dir::{file_name, MigrationDir, Version};
use crate::error::Error;
use crate::ledger;
use crate::sql::{render_statement, split_statements};

const MAX_VERSION_ATTEMPTS: usize = 32;

/// Accumulates statements and flushes them into new, versioned migration files.
///
/// ```
/// use datamig::{Executor, MigrationDir, MigrationWriter, Statement};
/// use serde_json::json;
///
/// # fn main() -> Result<(), datamig::Error> {
/// # let tmp = tempfile::tempdir().unwrap();
/// let dir = MigrationDir::create(tmp.path().join("migrations"))?;
/// let mut writer = MigrationWriter::new(dir);
///
/// writer.record(|session| {
///     session.execute(
///         &Statement::new("UPDATE users SET tags = ? WHERE tags IS NULL").bind(json!(["foo", "bar"])),
///     )?;
///     Ok(())
/// })?;
/// let version = writer.flush_with_comment("backfill_user_tags", "Backfill NULL tags")?;
///
/// let file = writer.dir().file(&version)?.unwrap();
/// assert!(file
///     .content()
///     .starts_with("-- Backfill NULL tags\nUPDATE users SET tags = '[\"foo\",\"bar\"]' WHERE tags IS NULL;"));
/// # Ok(())
/// # }
/// ```
pub struct MigrationWriter {
    dir: MigrationDir,
    pending: Vec<Statement>,
    section: Option<String>,
    clock: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ledger: bool,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for MigrationWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationWriter")
            .field("dir", &self.dir)
            .field("pending", &self.pending)
            .field("section", &self.section)
            .field("ledger", &self.ledger)
            .finish()
    }
}

impl MigrationWriter {
    pub fn new(dir: MigrationDir) -> Self {
        Self {
            dir,
            pending: Vec::new(),
            section: None,
            clock: Box::new(Utc::now),
            ledger: true,
        }
    }

    /// Set the clock used to derive new versions. Defaults to [`Utc::now`].
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    /// Whether to verify the manifest before a flush and rewrite it after. Defaults to true.
    pub fn with_ledger(mut self, enabled: bool) -> Self {
        self.ledger = enabled;
        self
    }

    pub fn dir(&self) -> &MigrationDir {
        &self.dir
    }

    /// Statements waiting for the next flush.
    pub fn pending(&self) -> &[Statement] {
        &self.pending
    }

    /// Add statement text to the pending file, optionally preceded by a comment.
    ///
    /// The text is split the way the file will be read back: each top-level `;` starts a new
    /// statement and leading `--` lines become part of that statement's comment. Returns the
    /// number of statements added. Text without a statement leaves its comments for the next one.
    pub fn append_statement(&mut self, sql: impl Into<String>, comment: Option<&str>) -> usize {
        let sql = sql.into();
        let mut comment = join_comments(self.section.take(), comment.map(str::to_string));
        let pieces = split_statements(&sql);
        if pieces.is_empty() {
            self.section = comment;
            return 0;
        }
        let count = pieces.len();
        for piece in pieces {
            self.pending.push(Statement {
                sql: piece.sql,
                comment: join_comments(comment.take(), piece.comment),
                args: Vec::new(),
            });
        }
        count
    }

    /// Start a commented section. The comment is written before the next statement.
    pub fn mark_section(&mut self, comment: impl Into<String>) {
        self.section = join_comments(self.section.take(), Some(comment.into()));
    }

    /// Run `f` against a fresh recording session and add what it captured to the pending file.
    ///
    /// If `f` fails, nothing it captured is kept.
    pub fn record<F>(&mut self, f: F) -> Result<usize, Error>
    where
        F: FnOnce(&mut RecordingSession) -> Result<(), Error>,
    {
        let mut session = RecordingSession::new();
        if let Err(error) = f(&mut session) {
            session.discard();
            return Err(error);
        }
        self.append_session(session)
    }

    /// Add every statement of a recording session to the pending file, inlining bound arguments.
    /// Returns the number of statements added, as split by [`append_statement`](Self::append_statement).
    pub fn append_session(&mut self, session: RecordingSession) -> Result<usize, Error> {
        let statements = session.into_statements();
        let rendered = statements
            .iter()
            .map(|s| s.to_literal_sql().map(|sql| (sql, s.comment.as_deref())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rendered
            .into_iter()
            .map(|(sql, comment)| self.append_statement(sql, comment))
            .sum())
    }

    /// Drop the pending statements and section.
    pub fn discard(&mut self) {
        self.pending.clear();
        self.section = None;
    }

    /// Write the pending statements as `<version>_<name>.sql` and return the new version.
    pub fn flush(&mut self, name: &str) -> Result<Version, Error> {
        self.flush_inner(name, None)
    }

    /// Like [`flush`](Self::flush), with `comment` as the first line(s) of the file.
    pub fn flush_with_comment(&mut self, name: &str, comment: &str) -> Result<Version, Error> {
        self.flush_inner(name, Some(comment))
    }

    fn flush_inner(&mut self, name: &str, header: Option<&str>) -> Result<Version, Error> {
        validate_name(name)?;
        if self.ledger {
            ledger::check(&self.dir)?;
        }

        let content = self.render(header);
        let files = self.dir.files()?;
        let mut taken: HashSet<Version> = files.iter().map(|f| f.version().clone()).collect();
        let latest = files.last().map(|f| f.version().clone());

        let mut version = Version::from_timestamp((self.clock)());
        if let Some(latest) = &latest {
            if &version <= latest {
                version = latest.successor().ok_or_else(|| Error::Write {
                    file: file_name(&version, name),
                    reason: format!("cannot allocate a version after non-numeric version {latest}"),
                })?;
            }
        }

        let mut written = None;
        for _ in 0..MAX_VERSION_ATTEMPTS {
            let target = file_name(&version, name);
            if !taken.contains(&version) {
                match self.dir.write_atomic(&target, &content, false) {
                    Ok(()) => {
                        written = Some(target);
                        break;
                    }
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                    Err(e) => {
                        return Err(Error::Write {
                            file: self.dir.path().join(&target).display().to_string(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(version = %version, "Version already taken, trying the next one");
            taken.insert(version.clone());
            version = version.successor().ok_or_else(|| Error::Write {
                file: target.clone(),
                reason: "version collision".to_string(),
            })?;
        }
        let Some(written) = written else {
            return Err(Error::Write {
                file: file_name(&version, name),
                reason: format!("no free version after {MAX_VERSION_ATTEMPTS} attempts"),
            });
        };

        if self.ledger {
            if let Err(error) = ledger::write(&self.dir) {
                // keep the directory and its manifest in agreement
                let path = self.dir.path().join(&written);
                if let Err(cleanup) = std::fs::remove_file(&path) {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        file = %path.display(),
                        error = %cleanup,
                        "Failed to remove migration file missing from the manifest"
                    );
                    return Err(Error::Write {
                        file: path.display().to_string(),
                        reason: format!(
                            "{error}; the file is not in the manifest and could not be removed: {cleanup}"
                        ),
                    });
                }
                return Err(error);
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            file = %written,
            statements = self.pending.len(),
            "Wrote migration file"
        );

        self.discard();
        Ok(version)
    }

    fn render(&self, header: Option<&str>) -> String {
        let mut out = String::new();
        if let Some(header) = header {
            for line in header.lines() {
                out.push_str("-- ");
                out.push_str(line);
                out.push('\n');
            }
        }
        for statement in &self.pending {
            out.push_str(&render_statement(statement.comment.as_deref(), &statement.sql));
        }
        if let Some(section) = &self.section {
            for line in section.lines() {
                out.push_str("-- ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

fn join_comments(first: Option<String>, second: Option<String>) -> Option<String> {
    match (first, second) {
        (Some(first), Some(second)) => Some(format!("{first}\n{second}")),
        (first, second) => first.or(second),
    }
}

fn validate_name(name: &str) -> Result<(), Error> {
    let invalid = name.starts_with('.')
        || name
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\' || c.is_control());
    if invalid {
        return Err(Error::Write {
            file: name.to_string(),
            reason: "migration names may not contain whitespace or path separators".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Executor, Value};
    use chrono::TimeZone;
    use std::fs;

    fn fixed(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> impl Fn() -> DateTime<Utc> {
        let at = Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap();
        move || at
    }

    fn writer() -> (tempfile::TempDir, MigrationWriter) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = MigrationDir::open(tmp.path()).unwrap();
        let writer = MigrationWriter::new(dir).with_clock(fixed(2024, 5, 1, 12, 0, 0));
        (tmp, writer)
    }

    #[test]
    fn flush_round_trips_statements() {
        let (_tmp, mut writer) = writer();
        writer.mark_section("Create the table");
        writer.append_statement("CREATE TABLE notes (id INT, body TEXT)", None);
        writer.append_statement(
            "INSERT INTO notes VALUES (1, 'semi; colon')",
            Some("seed row"),
        );
        writer.mark_section("Backfill");
        writer.append_statement("UPDATE notes\nSET body = 'it''s'\nWHERE body IS NULL;", None);
        let expected: Vec<(Option<String>, String)> = writer
            .pending()
            .iter()
            .map(|s| (s.comment.clone(), s.sql.clone()))
            .collect();

        let version = writer.flush("notes").unwrap();
        assert_eq!(version.as_str(), "20240501120000");
        assert!(writer.pending().is_empty());

        let file = writer.dir().file(&version).unwrap().unwrap();
        assert_eq!(file.file_name(), "20240501120000_notes.sql");
        let read_back: Vec<(Option<String>, String)> = file
            .statements()
            .into_iter()
            .map(|s| (s.comment, s.sql))
            .collect();
        assert_eq!(read_back, expected);
        assert_eq!(read_back[0].0.as_deref(), Some("Create the table"));
        assert_eq!(read_back[1].0.as_deref(), Some("seed row"));
        assert_eq!(read_back[1].1, "INSERT INTO notes VALUES (1, 'semi; colon')");
        assert_eq!(read_back[2].1, "UPDATE notes\nSET body = 'it''s'\nWHERE body IS NULL");
    }

    #[test]
    fn captured_backfill_is_written_after_every_prior_file() {
        let (tmp, writer) = writer();
        // a prior migration with a timestamp ahead of the writer's clock
        fs::write(
            tmp.path().join("20240601000000_create_users.sql"),
            "CREATE TABLE users (id INT, tags TEXT);\n",
        )
        .unwrap();
        ledger::write(writer.dir()).unwrap();
        let mut writer = writer;

        let added = writer
            .record(|session| {
                session.execute(
                    &Statement::new("UPDATE users SET tags = ? WHERE tags IS NULL")
                        .bind(serde_json::json!(["foo", "bar"])),
                )?;
                Ok(())
            })
            .unwrap();
        assert_eq!(added, 1);
        let version = writer
            .flush_with_comment("backfill_user_tags", "Backfill NULL tags")
            .unwrap();
        assert_eq!(version.as_str(), "20240601000001");
        assert!(version > Version::new("20240601000000"));

        let content =
            fs::read_to_string(tmp.path().join("20240601000001_backfill_user_tags.sql")).unwrap();
        assert_eq!(
            content,
            "-- Backfill NULL tags\nUPDATE users SET tags = '[\"foo\",\"bar\"]' WHERE tags IS NULL;\n"
        );
        // the manifest was updated to include the new file
        assert!(ledger::check(writer.dir()).is_ok());
        assert_eq!(ledger::read(writer.dir()).unwrap().unwrap().entries().len(), 2);
    }

    #[test]
    fn flushes_in_the_same_instant_get_distinct_versions() {
        let (_tmp, mut writer) = writer();
        writer.append_statement("SELECT 1", None);
        let first = writer.flush("first").unwrap();
        writer.append_statement("SELECT 2", None);
        let second = writer.flush("second").unwrap();
        assert_eq!(first.as_str(), "20240501120000");
        assert_eq!(second.as_str(), "20240501120001");
        assert_eq!(writer.dir().files().unwrap().len(), 2);
    }

    #[test]
    fn failed_recording_keeps_nothing() {
        let (_tmp, mut writer) = writer();
        let err = writer
            .record(|session| {
                session.execute(&Statement::new("INSERT INTO t VALUES (?)").bind(Value::Int(1)))?;
                session.query(&Statement::new("SELECT id FROM t"))?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, Error::RecordingUnsupported { .. }));
        assert!(writer.pending().is_empty());
    }

    #[test]
    fn invalid_names_leave_the_directory_unchanged() {
        let (tmp, mut writer) = writer();
        writer.append_statement("SELECT 1", None);
        let err = writer.flush("../escape").unwrap_err();
        assert!(matches!(err, Error::Write { .. }));
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
        assert_eq!(writer.pending().len(), 1);
    }

    #[test]
    fn drifted_directory_blocks_flush() {
        let (tmp, mut writer) = writer();
        writer.append_statement("CREATE TABLE t (id INT)", None);
        writer.flush("init").unwrap();
        fs::write(
            tmp.path().join("20240501120000_init.sql"),
            "CREATE TABLE t (id BIGINT);\n",
        )
        .unwrap();

        writer.append_statement("SELECT 1", None);
        let err = writer.flush("next").unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch(_)));
        assert_eq!(writer.dir().files().unwrap().len(), 1);
    }

    fn round_trip(writer: &mut MigrationWriter, name: &str) -> Vec<(Option<String>, String)> {
        let expected: Vec<(Option<String>, String)> = writer
            .pending()
            .iter()
            .map(|s| (s.comment.clone(), s.sql.clone()))
            .collect();
        let version = writer.flush(name).unwrap();
        let read_back: Vec<(Option<String>, String)> = writer
            .dir()
            .file(&version)
            .unwrap()
            .unwrap()
            .statements()
            .into_iter()
            .map(|s| (s.comment, s.sql))
            .collect();
        assert_eq!(read_back, expected);
        read_back
    }

    #[test]
    fn leading_comment_lines_in_statement_text_become_its_comment() {
        let (_tmp, mut writer) = writer();
        assert_eq!(writer.append_statement("-- why\nUPDATE t SET b = 2", None), 1);
        assert_eq!(writer.pending()[0].comment.as_deref(), Some("why"));
        assert_eq!(writer.pending()[0].sql, "UPDATE t SET b = 2");

        writer.mark_section("Cleanup");
        writer.append_statement("-- drop it\nDELETE FROM t", Some("old rows"));
        assert_eq!(
            writer.pending()[1].comment.as_deref(),
            Some("Cleanup\nold rows\ndrop it")
        );

        // a comment without a statement waits for the next one
        assert_eq!(writer.append_statement("-- just a note", None), 0);
        writer.append_statement("SELECT 1", None);
        assert_eq!(writer.pending()[2].comment.as_deref(), Some("just a note"));

        let read_back = round_trip(&mut writer, "comments");
        assert_eq!(read_back[0], (Some("why".to_string()), "UPDATE t SET b = 2".to_string()));
    }

    #[test]
    fn statement_text_with_several_statements_is_split() {
        let (_tmp, mut writer) = writer();
        let added = writer.append_statement("UPDATE t SET c = 3; UPDATE t SET d = 4", Some("two"));
        assert_eq!(added, 2);
        let pending: Vec<(Option<&str>, &str)> = writer
            .pending()
            .iter()
            .map(|s| (s.comment.as_deref(), s.sql.as_str()))
            .collect();
        assert_eq!(
            pending,
            vec![
                (Some("two"), "UPDATE t SET c = 3"),
                (None, "UPDATE t SET d = 4"),
            ]
        );
        round_trip(&mut writer, "split");
    }

    #[test]
    fn recorded_trigger_survives_the_round_trip() {
        let (_tmp, mut writer) = writer();
        let added = writer
            .record(|session| {
                session.execute(&Statement::new(
                    "CREATE TRIGGER a_ins AFTER INSERT ON a BEGIN INSERT INTO b VALUES (NEW.id); END",
                ))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(added, 1);
        round_trip(&mut writer, "trigger");
    }

    #[test]
    fn version_taken_after_listing_moves_to_the_next_one() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().to_path_buf();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        // another writer creates the same file between listing and persisting
        let mut writer = MigrationWriter::new(MigrationDir::open(tmp.path()).unwrap()).with_clock(
            move || {
                fs::write(path.join("20240501120000_race.sql"), "SELECT 0;\n").unwrap();
                at
            },
        );
        writer.append_statement("SELECT 1", None);

        let version = writer.flush("race").unwrap();
        assert_eq!(version.as_str(), "20240501120001");
        assert_eq!(
            fs::read_to_string(tmp.path().join("20240501120000_race.sql")).unwrap(),
            "SELECT 0;\n"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("20240501120001_race.sql")).unwrap(),
            "SELECT 1;\n"
        );
        assert!(ledger::check(writer.dir()).is_ok());
    }

    #[test]
    fn gives_up_when_no_version_is_free() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().to_path_buf();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut writer = MigrationWriter::new(MigrationDir::open(tmp.path()).unwrap())
            .with_ledger(false)
            .with_clock(move || {
                let mut version = Version::from_timestamp(at);
                for _ in 0..MAX_VERSION_ATTEMPTS {
                    fs::write(path.join(file_name(&version, "busy")), "SELECT 0;\n").unwrap();
                    version = version.successor().unwrap();
                }
                at
            });
        writer.append_statement("SELECT 1", None);

        let err = writer.flush("busy").unwrap_err();
        match err {
            Error::Write { reason, .. } => {
                assert_eq!(reason, format!("no free version after {MAX_VERSION_ATTEMPTS} attempts"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(writer.dir().files().unwrap().len(), MAX_VERSION_ATTEMPTS);
        assert_eq!(writer.pending().len(), 1);
    }

    #[test]
    fn failed_manifest_write_removes_the_new_file() {
        let tmp = tempfile::tempdir().unwrap();
        let sum_file = tmp.path().join(crate::dir::DEFAULT_SUM_FILE_NAME);
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        // a directory where the manifest should go makes the manifest write fail
        let mut writer = MigrationWriter::new(MigrationDir::open(tmp.path()).unwrap()).with_clock(
            move || {
                fs::create_dir_all(&sum_file).unwrap();
                at
            },
        );
        writer.append_statement("SELECT 1", None);

        let err = writer.flush("orphan").unwrap_err();
        assert!(matches!(err, Error::Io { .. }), "{err:?}");
        assert!(writer.dir().files().unwrap().is_empty());
        assert_eq!(writer.pending().len(), 1);
    }

    #[test]
    fn trailing_section_is_kept_as_comment() {
        let (_tmp, writer) = writer();
        let mut writer = writer.with_ledger(false);
        writer.append_statement("SELECT 1", None);
        writer.mark_section("nothing follows");
        let version = writer.flush("tail").unwrap();
        let file = writer.dir().file(&version).unwrap().unwrap();
        assert_eq!(file.content(), "SELECT 1;\n-- nothing follows\n");
        assert_eq!(file.statements().len(), 1);
    }
}
