use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::Statement;
use crate::error::Error;

pub(crate) const DEFAULT_SUM_FILE_NAME: &str = "datamig.sum";

/// The version of a migration file: the part of its file name before the first `_`.
///
/// Versions made only of digits (the timestamp versions the writer produces) compare
/// numerically and sort before every other version. The rest compare as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// A `YYYYMMDDHHMMSS` version for the given instant.
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self(at.format("%Y%m%d%H%M%S").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_numeric(&self) -> bool {
        !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit())
    }

    /// The next version after this one. Only numeric versions have a successor.
    pub fn successor(&self) -> Option<Version> {
        if !self.is_numeric() {
            return None;
        }
        let mut digits = self.0.clone().into_bytes();
        for digit in digits.iter_mut().rev() {
            if *digit == b'9' {
                *digit = b'0';
            } else {
                *digit += 1;
                return String::from_utf8(digits).ok().map(Version);
            }
        }
        digits.insert(0, b'1');
        String::from_utf8(digits).ok().map(Version)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_numeric(), other.is_numeric()) {
            (true, true) => {
                let a = self.0.trim_start_matches('0');
                let b = other.0.trim_start_matches('0');
                a.len()
                    .cmp(&b.len())
                    .then_with(|| a.cmp(b))
                    .then_with(|| self.0.cmp(&other.0))
            }
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// File name for a migration: `<version>_<name>.sql`, or `<version>.sql` without a name.
pub(crate) fn file_name(version: &Version, name: &str) -> String {
    if name.is_empty() {
        format!("{version}.sql")
    } else {
        format!("{version}_{name}.sql")
    }
}

/// One migration file of a directory.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationFile {
    version: Version,
    name: String,
    file_name: String,
    content: String,
}

impl MigrationFile {
    /// Parse the version and name out of a file name. Returns `None` for non-migration files.
    pub fn from_content(file_name: impl Into<String>, content: impl Into<String>) -> Option<Self> {
        let file_name = file_name.into();
        let stem = file_name.strip_suffix(".sql")?;
        let (version, name) = match stem.split_once('_') {
            Some((version, name)) => (version, name),
            None => (stem, ""),
        };
        if version.is_empty() {
            return None;
        }
        Some(Self {
            version: Version::new(version),
            name: name.to_string(),
            file_name: file_name.clone(),
            content: content.into(),
        })
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// The raw file content, as hashed by the ledger.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// The statements of this file in order.
    pub fn statements(&self) -> Vec<Statement> {
        crate::sql::split_statements(&self.content)
            .into_iter()
            .map(|raw| Statement {
                sql: raw.sql,
                comment: raw.comment,
                args: Vec::new(),
            })
            .collect()
    }
}

/// A directory of migration files on the local file system, plus its manifest.
#[derive(Debug, Clone)]
pub struct MigrationDir {
    path: PathBuf,
    sum_file_name: String,
}

impl MigrationDir {
    /// Open an existing directory.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let metadata = fs::metadata(&path).map_err(|e| Error::io(&path, e))?;
        if !metadata.is_dir() {
            return Err(Error::Directory {
                path,
                reason: "not a directory".to_string(),
            });
        }
        Ok(Self {
            path,
            sum_file_name: DEFAULT_SUM_FILE_NAME.to_string(),
        })
    }

    /// Open a directory, creating it first if needed.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        fs::create_dir_all(&path).map_err(|e| Error::io(&path, e))?;
        Self::open(path)
    }

    /// Set the manifest file name. Defaults to `datamig.sum`.
    pub fn with_sum_file_name(mut self, name: impl Into<String>) -> Self {
        self.sum_file_name = name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sum_file_path(&self) -> PathBuf {
        self.path.join(&self.sum_file_name)
    }

    /// All migration files, sorted by version. Fails if two files share a version.
    pub fn files(&self) -> Result<Vec<MigrationFile>, Error> {
        let entries = fs::read_dir(&self.path).map_err(|e| Error::io(&self.path, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.path, e))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !file_name.ends_with(".sql") || file_name.starts_with('.') {
                continue;
            }
            if !entry
                .file_type()
                .map_err(|e| Error::io(entry.path(), e))?
                .is_file()
            {
                continue;
            }
            let content = fs::read(entry.path()).map_err(|e| Error::io(entry.path(), e))?;
            let content = String::from_utf8(content).map_err(|_| Error::Directory {
                path: entry.path(),
                reason: "migration file is not valid UTF-8".to_string(),
            })?;
            if let Some(file) = MigrationFile::from_content(file_name, content) {
                files.push(file);
            }
        }
        files.sort_by(|a, b| {
            a.version
                .cmp(&b.version)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        for pair in files.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(Error::Directory {
                    path: self.path.clone(),
                    reason: format!(
                        "version {} is used by both {} and {}",
                        pair[0].version, pair[0].file_name, pair[1].file_name
                    ),
                });
            }
        }
        Ok(files)
    }

    /// The file with the given version, if any.
    pub fn file(&self, version: &Version) -> Result<Option<MigrationFile>, Error> {
        Ok(self.files()?.into_iter().find(|f| &f.version == version))
    }

    /// Write `content` to `file_name` atomically: the data goes to a temporary file in this
    /// directory which is then persisted under the final name. With `overwrite` false an existing
    /// file is never replaced and the [`std::io::ErrorKind::AlreadyExists`] error is returned.
    pub(crate) fn write_atomic(
        &self,
        file_name: &str,
        content: &str,
        overwrite: bool,
    ) -> Result<(), std::io::Error> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".datamig-")
            .suffix(".tmp")
            .tempfile_in(&self.path)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        let target = self.path.join(file_name);
        if overwrite {
            tmp.persist(&target).map_err(|e| e.error)?;
        } else {
            tmp.persist_noclobber(&target).map_err(|e| e.error)?;
        }
        Ok(())
    }
}
