//! Integrity manifest over a migration directory.
//!
//! The manifest (`datamig.sum` by default) records a hash of every migration file plus an
//! aggregate hash over all entries in version order:
//!
//! ```text
//! h1:<base64 aggregate>
//! 20240101000000_create_users.sql h1:<base64 sha256 of the file>
//! 20240102000000_backfill_user_tags.sql h1:<base64 sha256 of the file>
//! ```
//!
//! Verification is a pure content check. It never touches a database.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::dir::{MigrationDir, MigrationFile, Version};
use crate::error::Error;

const HASH_PREFIX: &str = "h1:";

/// One file's entry in a [`Manifest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub version: Version,
    pub file_name: String,
    pub hash: String,
}

/// The checksum ledger of a migration directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    sum: String,
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build the manifest for files already in version order.
    pub fn from_files(files: &[MigrationFile]) -> Self {
        let entries = files
            .iter()
            .map(|file| ManifestEntry {
                version: file.version().clone(),
                file_name: file.file_name().to_string(),
                hash: hash_content(file.content()),
            })
            .collect::<Vec<_>>();
        Self {
            sum: aggregate(&entries),
            entries,
        }
    }

    /// The aggregate hash.
    pub fn sum(&self) -> &str {
        &self.sum
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn entry(&self, version: &Version) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| &e.version == version)
    }

    /// Whether the stored aggregate matches the stored entries.
    pub fn is_consistent(&self) -> bool {
        aggregate(&self.entries) == self.sum
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let (_, first) = lines.next().ok_or_else(|| Error::Manifest {
            line: 1,
            reason: "manifest is empty".to_string(),
        })?;
        let sum = first.trim();
        if !sum.starts_with(HASH_PREFIX) {
            return Err(Error::Manifest {
                line: 1,
                reason: format!("expected aggregate hash starting with '{HASH_PREFIX}'"),
            });
        }
        let mut entries = Vec::new();
        for (index, line) in lines {
            let line_no = index + 1;
            let (file_name, hash) = line.trim().rsplit_once(' ').ok_or_else(|| Error::Manifest {
                line: line_no,
                reason: "expected '<file> <hash>'".to_string(),
            })?;
            if !hash.starts_with(HASH_PREFIX) {
                return Err(Error::Manifest {
                    line: line_no,
                    reason: format!("hash of {file_name} does not start with '{HASH_PREFIX}'"),
                });
            }
            let file = MigrationFile::from_content(file_name, "").ok_or_else(|| Error::Manifest {
                line: line_no,
                reason: format!("{file_name} is not a migration file name"),
            })?;
            entries.push(ManifestEntry {
                version: file.version().clone(),
                file_name: file_name.to_string(),
                hash: hash.to_string(),
            });
        }
        Ok(Self {
            sum: sum.to_string(),
            entries,
        })
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.sum)?;
        for entry in &self.entries {
            writeln!(f, "{} {}", entry.file_name, entry.hash)?;
        }
        Ok(())
    }
}

fn hash_content(content: &str) -> String {
    format!("{HASH_PREFIX}{}", STANDARD.encode(Sha256::digest(content.as_bytes())))
}

fn aggregate(entries: &[ManifestEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.file_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(entry.hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("{HASH_PREFIX}{}", STANDARD.encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriftKind {
    /// On disk, not in the manifest.
    Added,
    /// In the manifest, no longer on disk.
    Removed,
    /// Same version, different content or file name.
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftEntry {
    pub kind: DriftKind,
    pub version: Version,
    pub file_name: String,
}

/// Differences between a directory and a stored manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub entries: Vec<DriftEntry>,
    /// The stored aggregate hash disagrees with the stored entries or their order.
    pub sum_mismatch: bool,
    /// Newest version recorded in the stored manifest.
    pub last_recorded: Option<Version>,
}

impl Drift {
    pub fn is_clean(&self) -> bool {
        self.entries.is_empty() && !self.sum_mismatch
    }

    /// True when the only differences are new files after the newest recorded one, which is
    /// what writing a new migration without rehashing looks like.
    pub fn is_append_only(&self) -> bool {
        !self.sum_mismatch
            && self.entries.iter().all(|e| {
                e.kind == DriftKind::Added
                    && self.last_recorded.as_ref().map_or(true, |last| &e.version > last)
            })
    }

    pub fn of_kind(&self, kind: DriftKind) -> impl Iterator<Item = &DriftEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            let label = match entry.kind {
                DriftKind::Added => "added",
                DriftKind::Removed => "removed",
                DriftKind::Modified => "modified",
            };
            writeln!(
                f,
                "  {label:<9}{} (version {})",
                entry.file_name, entry.version
            )?;
        }
        if self.sum_mismatch {
            writeln!(f, "  manifest aggregate hash does not match its entries")?;
        }
        Ok(())
    }
}

/// Hash every file of the directory in version order.
pub fn recompute(dir: &MigrationDir) -> Result<Manifest, Error> {
    Ok(Manifest::from_files(&dir.files()?))
}

/// Compare the directory against a stored manifest and report every difference.
pub fn verify(dir: &MigrationDir, stored: &Manifest) -> Result<Drift, Error> {
    let current = recompute(dir)?;
    Ok(diff(stored, &current))
}

fn diff(stored: &Manifest, current: &Manifest) -> Drift {
    let recorded: BTreeMap<&Version, &ManifestEntry> =
        stored.entries.iter().map(|e| (&e.version, e)).collect();
    let on_disk: BTreeMap<&Version, &ManifestEntry> =
        current.entries.iter().map(|e| (&e.version, e)).collect();

    let mut entries = Vec::new();
    for (version, entry) in &on_disk {
        match recorded.get(version) {
            None => entries.push(DriftEntry {
                kind: DriftKind::Added,
                version: (*version).clone(),
                file_name: entry.file_name.clone(),
            }),
            Some(old) if old.hash != entry.hash || old.file_name != entry.file_name => {
                entries.push(DriftEntry {
                    kind: DriftKind::Modified,
                    version: (*version).clone(),
                    file_name: entry.file_name.clone(),
                })
            }
            Some(_) => {}
        }
    }
    for (version, entry) in &recorded {
        if !on_disk.contains_key(version) {
            entries.push(DriftEntry {
                kind: DriftKind::Removed,
                version: (*version).clone(),
                file_name: entry.file_name.clone(),
            });
        }
    }
    entries.sort_by(|a, b| a.version.cmp(&b.version));

    let sum_mismatch =
        !stored.is_consistent() || (entries.is_empty() && stored.sum != current.sum);
    Drift {
        entries,
        sum_mismatch,
        last_recorded: stored.entries.iter().map(|e| e.version.clone()).max(),
    }
}

/// Read the stored manifest, if the directory has one.
pub fn read(dir: &MigrationDir) -> Result<Option<Manifest>, Error> {
    let path = dir.sum_file_path();
    match fs::read_to_string(&path) {
        Ok(text) => Manifest::parse(&text).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Recompute the manifest and persist it next to the files.
pub fn write(dir: &MigrationDir) -> Result<Manifest, Error> {
    let manifest = recompute(dir)?;
    let sum_file = dir.sum_file_path();
    let file_name = sum_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.write_atomic(&file_name, &manifest.to_string(), true)
        .map_err(|e| Error::io(&sum_file, e))?;
    #[cfg(feature = "tracing")]
    tracing::debug!(
        path = %sum_file.display(),
        files = manifest.entries().len(),
        sum = %manifest.sum(),
        "Wrote migration manifest"
    );
    Ok(manifest)
}

/// Verify the directory against its stored manifest, surfacing any drift as
/// [`Error::IntegrityMismatch`]. A directory without files needs no manifest.
pub fn check(dir: &MigrationDir) -> Result<Manifest, Error> {
    match read(dir)? {
        Some(stored) => {
            let drift = verify(dir, &stored)?;
            if drift.is_clean() {
                Ok(stored)
            } else {
                Err(Error::IntegrityMismatch(drift))
            }
        }
        None => {
            let current = recompute(dir)?;
            if current.entries.is_empty() {
                Ok(current)
            } else {
                Err(Error::ManifestNotFound {
                    path: dir.sum_file_path(),
                })
            }
        }
    }
}
