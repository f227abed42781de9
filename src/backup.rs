//! Binary and database backups with per-kind rotation.
//!
//! Binary backups are zip archives of the install directory; schema
//! snapshots are `VACUUM INTO` copies of the database. File names start with
//! a UTC timestamp so sorting by name sorts by age:
//!
//! - `updraft-{ts}-v{version}-{platform}.zip`
//! - `database-{ts}-{label}.db`

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::db::Database;
use crate::error::{Result, UpdateError};
use crate::update::installer::{ensure_path_segment, staged_sibling, swap_into_place};
use crate::version::platform_string;

const BINARY_PREFIX: &str = "updraft-";
const BINARY_EXT: &str = ".zip";
const SCHEMA_PREFIX: &str = "database-";
const SCHEMA_EXT: &str = ".db";

/// Directory names never copied into a binary backup.
const SKIPPED_DIRS: &[&str] = &[".git", "temp", "tmp", "backup", "logs"];

/// What a backup artifact contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Zip of the install directory.
    BinaryArchive,
    /// Copy of the database.
    SchemaSnapshot,
}

impl BackupKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::BinaryArchive => BINARY_PREFIX,
            Self::SchemaSnapshot => SCHEMA_PREFIX,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::BinaryArchive => BINARY_EXT,
            Self::SchemaSnapshot => SCHEMA_EXT,
        }
    }

    fn matches(self, file_name: &str) -> bool {
        file_name.starts_with(self.prefix()) && file_name.ends_with(self.extension())
    }
}

/// A backup file on disk.
#[derive(Debug, Clone, Serialize)]
pub struct BackupArtifact {
    /// Absolute path of the backup file.
    pub path: PathBuf,
    /// Application version (binary) or label (snapshot) the backup was taken from.
    pub source_version: String,
    /// When the file was written.
    pub created_at: DateTime<Utc>,
    /// Artifact kind.
    pub kind: BackupKind,
}

impl BackupArtifact {
    fn from_path(path: &Path, kind: BackupKind) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name
            .strip_prefix(kind.prefix())?
            .strip_suffix(kind.extension())?;
        // `{ts}-{rest}`
        let (_, rest) = stem.split_once('-')?;
        let source_version = match kind {
            BackupKind::BinaryArchive => {
                let rest = rest.strip_prefix('v').unwrap_or(rest);
                let platform_suffix = format!("-{}", platform_string());
                rest.strip_suffix(platform_suffix.as_str())
                    .unwrap_or(rest)
                    .to_owned()
            }
            BackupKind::SchemaSnapshot => rest.to_owned(),
        };
        let created_at = fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Some(Self {
            path: path.to_path_buf(),
            source_version,
            created_at,
            kind,
        })
    }
}

/// Owns the backup directory.
pub struct BackupVault {
    dir: PathBuf,
    keep: usize,
    db: Option<Arc<Database>>,
}

impl BackupVault {
    /// Create a vault rooted at `dir`, keeping `keep` artifacts per kind.
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            keep,
            db: None,
        }
    }

    /// Attach the database used for schema snapshots.
    #[must_use]
    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    /// Backup directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Zip `install_dir` into a timestamped binary backup, then prune.
    ///
    /// A failure here must block the install that follows: without this
    /// archive there is no way back to `version`.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Io`] if the directory cannot be read or the
    /// archive cannot be written. A partially written archive is removed.
    pub fn backup_binary(&self, install_dir: &Path, version: &str) -> Result<BackupArtifact> {
        let name = format!(
            "{BINARY_PREFIX}{}-v{version}-{}{BINARY_EXT}",
            timestamp(),
            platform_string()
        );
        ensure_path_segment("backup name", &name)?;
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);

        tracing::info!(
            source = %install_dir.display(),
            dest = %path.display(),
            "backing up install directory"
        );
        if let Err(e) = self.write_archive(install_dir, &path) {
            let _ = fs::remove_file(&path);
            return Err(e.with_phase("backup"));
        }

        self.prune(BackupKind::BinaryArchive, self.keep)?;
        BackupArtifact::from_path(&path, BackupKind::BinaryArchive)
            .ok_or_else(|| UpdateError::Io(format!("backup {} vanished", path.display())))
    }

    fn write_archive(&self, install_dir: &Path, dest: &Path) -> Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)?;
        let mut zip = ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        add_directory_to_zip(&mut zip, install_dir, "", options, &self.dir)?;
        zip.finish()
            .map_err(|e| UpdateError::Io(format!("zip finish error: {e}")))?;
        Ok(())
    }

    /// Snapshot the attached database as `database-{ts}-{label}.db`, then prune.
    ///
    /// # Errors
    ///
    /// Returns an error if no database is attached or `VACUUM INTO` fails.
    pub fn backup_database(&self, label: &str) -> Result<BackupArtifact> {
        let db = self
            .db
            .as_ref()
            .ok_or_else(|| UpdateError::Config("no database attached to backup vault".into()))?;
        let label: String = label
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let path = self
            .dir
            .join(format!("{SCHEMA_PREFIX}{}-{label}{SCHEMA_EXT}", timestamp()));

        db.backup_to(&path)?;
        tracing::info!(path = %path.display(), "database snapshot written");

        self.prune(BackupKind::SchemaSnapshot, self.keep)?;
        BackupArtifact::from_path(&path, BackupKind::SchemaSnapshot)
            .ok_or_else(|| UpdateError::Io(format!("snapshot {} vanished", path.display())))
    }

    /// List artifacts of one kind, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backup directory exists but cannot be read.
    pub fn list(&self, kind: BackupKind) -> Result<Vec<BackupArtifact>> {
        Ok(self
            .sorted_paths(kind)?
            .iter()
            .filter_map(|p| BackupArtifact::from_path(p, kind))
            .collect())
    }

    /// Delete artifacts of `kind` beyond the `keep` most recent.
    ///
    /// Returns the number of deleted files. Individual deletion failures are
    /// logged and do not stop the rotation.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn prune(&self, kind: BackupKind, keep: usize) -> Result<usize> {
        let mut deleted = 0;
        for old in self.sorted_paths(kind)?.iter().skip(keep) {
            match fs::remove_file(old) {
                Ok(()) => {
                    deleted += 1;
                    tracing::debug!(path = %old.display(), "pruned old backup");
                }
                Err(e) => {
                    tracing::warn!(path = %old.display(), error = %e, "failed to delete old backup");
                }
            }
        }
        Ok(deleted)
    }

    /// Extract a binary backup over `target_dir`.
    ///
    /// Every file is first written to a hidden sibling of its destination;
    /// only when all of them are staged are they renamed into place, so a
    /// running executable is swapped rather than written through.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Conflict`] for a schema snapshot,
    /// [`UpdateError::Security`] if an entry escapes `target_dir`, and
    /// [`UpdateError::Io`] for read/write failures. A failure while staging
    /// leaves the existing files in `target_dir` untouched.
    pub fn restore_binary(&self, artifact: &BackupArtifact, target_dir: &Path) -> Result<usize> {
        if artifact.kind != BackupKind::BinaryArchive {
            return Err(UpdateError::Conflict(format!(
                "{} is not a binary backup",
                artifact.path.display()
            )));
        }
        let file = fs::File::open(&artifact.path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| UpdateError::Io(format!("cannot open backup: {e}")))?;

        fs::create_dir_all(target_dir)?;
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();
        if let Err(e) = stage_entries(&mut archive, target_dir, &mut staged) {
            for (tmp, _) in &staged {
                let _ = fs::remove_file(tmp);
            }
            return Err(e.with_phase("restore"));
        }

        let restored = staged.len();
        let mut swaps = staged.into_iter();
        while let Some((tmp, out)) = swaps.next() {
            if let Err(e) = swap_into_place(&tmp, &out) {
                for (rest, _) in swaps {
                    let _ = fs::remove_file(rest);
                }
                return Err(e.with_phase("restore"));
            }
        }
        tracing::info!(
            backup = %artifact.path.display(),
            target = %target_dir.display(),
            files = restored,
            "binary backup restored"
        );
        Ok(restored)
    }

    fn sorted_paths(&self, kind: BackupKind) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_string_lossy().to_string();
                kind.matches(&name).then(|| entry.path())
            })
            .collect();
        // Newest first; names start with the timestamp.
        paths.sort_by(|a, b| b.cmp(a));
        Ok(paths)
    }
}

/// Write every file entry of `archive` next to its destination under
/// `target_dir`, pushing `(staged, destination)` pairs as they land.
fn stage_entries<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    target_dir: &Path,
    staged: &mut Vec<(PathBuf, PathBuf)>,
) -> Result<()> {
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| UpdateError::Io(format!("cannot read backup entry {i}: {e}")))?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            UpdateError::Security(format!("backup entry {} escapes target", entry.name()))
        })?;
        let out = target_dir.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = staged_sibling(&out);
        let mut file = fs::File::create(&tmp)?;
        staged.push((tmp.clone(), out));
        std::io::copy(&mut entry, &mut file)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&tmp, fs::Permissions::from_mode(mode & 0o7777))?;
            }
        }
    }
    Ok(())
}

/// UTC timestamp with milliseconds, sortable as a string.
fn timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%3f").to_string()
}

/// Recursively add `dir` to the archive under `prefix`, skipping scratch
/// directories and the vault itself.
fn add_directory_to_zip<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    dir: &Path,
    prefix: &str,
    options: SimpleFileOptions,
    vault_dir: &Path,
) -> Result<()> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(fs::DirEntry::file_name);

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let zip_name = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };

        if path.is_dir() {
            if SKIPPED_DIRS.contains(&name.as_str())
                || name.starts_with("extract-")
                || path == vault_dir
            {
                continue;
            }
            zip.add_directory(zip_name.as_str(), options)
                .map_err(|e| UpdateError::Io(format!("zip error: {e}")))?;
            add_directory_to_zip(zip, &path, &zip_name, options, vault_dir)?;
        } else if path.is_file() {
            let mut file_options = options;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = entry.metadata()?.permissions().mode();
                file_options = file_options.unix_permissions(mode);
            }
            zip.start_file(zip_name.as_str(), file_options)
                .map_err(|e| UpdateError::Io(format!("zip error: {e}")))?;
            let mut buf = Vec::new();
            fs::File::open(&path)?.read_to_end(&mut buf)?;
            zip.write_all(&buf)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
