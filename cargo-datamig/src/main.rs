//! Cargo subcommand for datamig migration directories.
//!
//! This binary provides the `cargo datamig` command. It creates migration files, maintains the
//! integrity manifest and applies pending files to a SQLite database, using configuration from
//! `[package.metadata.datamig]` in `Cargo.toml`:
//!
//! ```toml
//! [package.metadata.datamig]
//! dir = "migrations"
//! sum_file = "datamig.sum"
//! database_url_env = "DATABASE_URL"
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use cargo_metadata::MetadataCommand;
use clap::Parser;
use datamig::{ApplyContext, DirMigrator, MigrationDir, MigrationWriter};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cargo")]
#[command(bin_name = "cargo")]
struct Cargo {
    #[command(subcommand)]
    command: CargoCommands,
}

#[derive(clap::Subcommand)]
enum CargoCommands {
    /// Manage datamig migration directories
    Datamig(DatamigArgs),
}

#[derive(clap::Args)]
struct DatamigArgs {
    /// Migration directory, overriding `dir` from [package.metadata.datamig]
    #[arg(long, env = "DATAMIG_DIR")]
    dir: Option<PathBuf>,
    /// Database URL, overriding the variable named by `database_url_env`
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Create an empty migration file to edit by hand (no database required)
    New {
        name: String,
        /// Comment placed at the top of the file
        #[arg(long)]
        comment: Option<String>,
    },
    /// Recompute and write the integrity manifest (no database required)
    Hash,
    /// Check the directory against its integrity manifest (no database required)
    Validate,
    /// List all migration files (no database required)
    List,
    /// Show applied and pending migration files (requires database)
    Status,
    /// Apply pending migration files, at most N when given (requires database)
    Apply { n: Option<usize> },
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DatamigConfig {
    /// Migration directory, relative to the package root
    dir: String,
    /// Manifest file name inside the migration directory
    sum_file: String,
    /// Environment variable for the database URL
    database_url_env: String,
    /// Name of the revision table
    revision_table: Option<String>,
}

impl Default for DatamigConfig {
    fn default() -> Self {
        Self {
            dir: "migrations".to_string(),
            sum_file: "datamig.sum".to_string(),
            database_url_env: "DATABASE_URL".to_string(),
            revision_table: None,
        }
    }
}

/// Read `[package.metadata.datamig]` of the root package. Returns the config and the package
/// directory that relative paths resolve against.
fn load_config() -> Result<(DatamigConfig, PathBuf), Box<dyn std::error::Error>> {
    let metadata = MetadataCommand::new().no_deps().exec()?;
    let root_package = metadata
        .root_package()
        .ok_or("No root package found. Are you in a Cargo project directory?")?;
    let package_dir = root_package
        .manifest_path
        .parent()
        .ok_or("Could not determine package directory")?
        .as_std_path()
        .to_path_buf();

    let config = match root_package.metadata.get("datamig") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| format!("Invalid datamig config: {}", e))?,
        None => DatamigConfig::default(),
    };
    Ok((config, package_dir))
}

fn open_sqlite(url: &str) -> Result<rusqlite::Connection, rusqlite::Error> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    if path == ":memory:" {
        rusqlite::Connection::open_in_memory()
    } else {
        rusqlite::Connection::open(path)
    }
}

fn database_url(
    args: &DatamigArgs,
    config: &DatamigConfig,
) -> Result<String, Box<dyn std::error::Error>> {
    match &args.database_url {
        Some(url) => Ok(url.clone()),
        None => std::env::var(&config.database_url_env).map_err(|_| {
            format!(
                "No database URL given. Pass --database-url or set {}.",
                config.database_url_env
            )
            .into()
        }),
    }
}

fn migration_dir(path: &Path, config: &DatamigConfig, create: bool) -> Result<MigrationDir, datamig::Error> {
    let dir = if create {
        MigrationDir::create(path)?
    } else {
        MigrationDir::open(path)?
    };
    Ok(dir.with_sum_file_name(&config.sum_file))
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let Cargo {
        command: CargoCommands::Datamig(args),
    } = Cargo::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("DATAMIG_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (config, package_dir) = load_config()?;
    let dir_path = match &args.dir {
        Some(dir) => dir.clone(),
        None => package_dir.join(&config.dir),
    };

    match &args.command {
        Command::New { name, comment } => {
            let dir = migration_dir(&dir_path, &config, true)?;
            let path = new_file(dir, name, comment.as_deref())?;
            println!("Created {}", path.display());
        }
        Command::Hash => {
            let dir = migration_dir(&dir_path, &config, false)?;
            let manifest = datamig::ledger::write(&dir)?;
            println!(
                "Wrote {} ({} files, {})",
                dir.sum_file_path().display(),
                manifest.entries().len(),
                manifest.sum()
            );
        }
        Command::Validate => {
            let dir = migration_dir(&dir_path, &config, false)?;
            let manifest = datamig::ledger::check(&dir)?;
            println!(
                "Migration directory is valid ({} files)",
                manifest.entries().len()
            );
        }
        Command::List => {
            let dir = migration_dir(&dir_path, &config, false)?;
            let files = dir.files()?;
            if files.is_empty() {
                println!("No migration files in {}", dir.path().display());
            }
            for file in files {
                println!(
                    "{:<16} {:<40} {} statements",
                    file.version(),
                    file.name(),
                    file.statements().len()
                );
            }
        }
        Command::Status => {
            let dir = migration_dir(&dir_path, &config, false)?;
            let mut conn = open_sqlite(&database_url(&args, &config)?)?;
            let status = migrator(dir, &config).status(&mut conn)?;
            println!("Applied:");
            if status.applied.is_empty() {
                println!("  (none)");
            }
            for revision in &status.applied {
                println!(
                    "  {:<16} {:<40} {}",
                    revision.version,
                    revision.name,
                    revision.applied_at.to_rfc3339()
                );
            }
            println!("Pending:");
            if status.pending.is_empty() {
                println!("  (none)");
            }
            for file in &status.pending {
                println!("  {:<16} {}", file.version(), file.name());
            }
        }
        Command::Apply { n } => {
            let dir = migration_dir(&dir_path, &config, false)?;
            let mut conn = open_sqlite(&database_url(&args, &config)?)?;
            let report = migrator(dir, &config).upgrade(&ApplyContext::new(), &mut conn, *n)?;
            for version in &report.applied {
                println!("Applied {version}");
            }
            if report.applied.is_empty() && report.failing.is_none() {
                println!("Database is up to date");
            }
            if let Some(failure) = report.failing {
                eprintln!("Failed to apply {}: {}", failure.file_name, failure.error);
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Write an empty migration file and return the path it was written to.
fn new_file(
    dir: MigrationDir,
    name: &str,
    comment: Option<&str>,
) -> Result<PathBuf, datamig::Error> {
    let mut writer = MigrationWriter::new(dir);
    let version = match comment {
        Some(comment) => writer.flush_with_comment(name, comment)?,
        None => writer.flush(name)?,
    };
    let file = writer.dir().file(&version)?.ok_or_else(|| {
        datamig::Error::Generic(format!("migration file for version {version} was not written"))
    })?;
    Ok(writer.dir().path().join(file.file_name()))
}

fn migrator(dir: MigrationDir, config: &DatamigConfig) -> DirMigrator {
    let migrator = DirMigrator::new(dir);
    match &config.revision_table {
        Some(table) => migrator.with_revision_table_name(table),
        None => migrator,
    }
}
