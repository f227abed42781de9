//! Package installation.
//!
//! A verified package is extracted into a quarantine directory
//! (`<root>/extract-<version>`) first; nothing is written to the live
//! install until every entry has been checked and extracted. Then either the
//! package's own install script runs, or its files are copied over the
//! install directory, leaving user data alone.
//!
//! There is no automatic rollback here. If the script or the copy fails the
//! binary backup taken earlier is the recovery path.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use serde::Serialize;

use crate::error::{Result, UpdateError};

/// Install script looked for at the package root.
#[cfg(not(target_os = "windows"))]
const INSTALL_SCRIPT: &str = "install.sh";
#[cfg(target_os = "windows")]
const INSTALL_SCRIPT: &str = "install.bat";

/// Files in the install directory that belong to the user, never overwritten.
const RETAINED_FILES: &[&str] = &[
    "config.json",
    "config.toml",
    ".env",
    "database.db",
    "database.sqlite",
    "updraft.db",
];

/// Directories in the install directory that belong to the user.
const RETAINED_DIRS: &[&str] = &["logs", "backup", "data"];

/// How the package was installed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum InstallMethod {
    /// The package's install script ran; its combined output is kept.
    Script { output: String },
    /// Files were copied over the install directory.
    Copy { files: usize },
}

/// Outcome of [`InstallStager::install`].
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub quarantine_dir: PathBuf,
    pub extracted: usize,
    pub method: InstallMethod,
}

/// Extracts packages into quarantine and swaps them into place.
pub struct InstallStager {
    quarantine_root: PathBuf,
}

impl InstallStager {
    pub fn new(quarantine_root: impl Into<PathBuf>) -> Self {
        Self {
            quarantine_root: quarantine_root.into(),
        }
    }

    /// Quarantine directory used for `version`.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Security`] if `version` is not a plain path
    /// segment.
    pub fn quarantine_dir(&self, version: &str) -> Result<PathBuf> {
        let dir_name = format!("extract-{version}");
        ensure_path_segment("release version", &dir_name)?;
        Ok(self.quarantine_root.join(dir_name))
    }

    /// Extract `archive` into quarantine, then install it into `target_dir`.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::Security`] if `version` is not a plain path segment
    ///   or any entry would land outside the quarantine directory; nothing
    ///   has been written at that point
    /// - [`UpdateError::Integrity`] if the archive cannot be read
    /// - [`UpdateError::Io`] if extraction, the script or the copy fails
    pub fn install(&self, archive: &Path, target_dir: &Path, version: &str) -> Result<InstallReport> {
        let quarantine = self.quarantine_dir(version)?;
        let extracted = extract_to_quarantine(archive, &quarantine)?;
        tracing::info!(
            quarantine = %quarantine.display(),
            entries = extracted,
            "package extracted"
        );

        fs::create_dir_all(target_dir)?;
        let script = quarantine.join(INSTALL_SCRIPT);
        let method = if script.is_file() {
            let output = run_install_script(&script, target_dir, &quarantine)?;
            InstallMethod::Script { output }
        } else {
            let files = copy_tree(&quarantine, target_dir)?;
            clear_quarantine_attribute(target_dir);
            InstallMethod::Copy { files }
        };

        tracing::info!(version, target = %target_dir.display(), "package installed");
        Ok(InstallReport {
            quarantine_dir: quarantine,
            extracted,
            method,
        })
    }

    /// Remove the quarantine directory for `version`. Best-effort.
    pub fn cleanup(&self, version: &str) {
        let dir = match self.quarantine_dir(version) {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(version, error = %e, "refusing to clean up quarantine dir");
                return;
            }
        };
        if let Err(e) = fs::remove_dir_all(&dir)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %dir.display(), error = %e, "failed to remove quarantine dir");
        }
    }
}

/// Reject `value` unless it is exactly one normal path component.
///
/// Feed-supplied names (versions, asset names) are joined onto local
/// directories that later get deleted, so separators, `.`/`..`, drive
/// prefixes and empty names are all refused.
///
/// # Errors
///
/// Returns [`UpdateError::Security`] naming `what` on rejection.
pub(crate) fn ensure_path_segment(what: &str, value: &str) -> Result<()> {
    let mut components = Path::new(value).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == std::ffi::OsStr::new(value)
    );
    if single && !value.contains(['/', '\\']) {
        Ok(())
    } else {
        Err(UpdateError::Security(format!(
            "{what} {value:?} is not a plain file name"
        )))
    }
}

/// Resolve an archive entry name against `root`.
///
/// Returns `None` unless the result is a strict descendant of `root`:
/// absolute names, drive prefixes, and `..` climbing above the root are
/// rejected, as is a name resolving to the root itself.
fn resolve_entry(root: &Path, name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    let mut resolved = root.to_path_buf();
    resolved.extend(parts);
    Some(resolved)
}

/// Validate every entry, then extract. Returns the number of files written.
fn extract_to_quarantine(archive_path: &Path, quarantine: &Path) -> Result<usize> {
    let file = fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| UpdateError::Integrity(format!("cannot open package: {e}")))?;

    let mut targets = Vec::with_capacity(archive.len());
    for name in archive.file_names() {
        let target = resolve_entry(quarantine, name).ok_or_else(|| {
            UpdateError::Security(format!("archive entry {name:?} escapes the extraction root"))
        })?;
        targets.push((name.to_owned(), target));
    }

    if quarantine.exists() {
        fs::remove_dir_all(quarantine)?;
    }
    fs::create_dir_all(quarantine)?;

    let mut written = 0;
    for (name, target) in targets {
        let mut entry = archive
            .by_name(&name)
            .map_err(|e| UpdateError::Integrity(format!("cannot read entry {name}: {e}")))?;
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| UpdateError::Io(format!("cannot extract {name}: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
            }
        }
        written += 1;
    }
    Ok(written)
}

fn run_install_script(script: &Path, target_dir: &Path, quarantine: &Path) -> Result<String> {
    tracing::info!(script = %script.display(), "running install script");

    #[cfg(not(target_os = "windows"))]
    let mut command = {
        let mut c = Command::new("bash");
        c.arg(script);
        c
    };
    #[cfg(target_os = "windows")]
    let mut command = {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(script);
        c
    };

    let output = command
        .arg(target_dir)
        .arg(quarantine)
        .current_dir(quarantine)
        .output()
        .map_err(|e| UpdateError::Io(format!("cannot run install script: {e}")))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(UpdateError::Io(format!(
            "install script exited with {}: {}",
            output.status,
            combined.trim()
        )));
    }
    tracing::debug!(output = %combined, "install script finished");
    Ok(combined)
}

fn is_retained(name: &str, is_dir: bool) -> bool {
    if is_dir {
        RETAINED_DIRS.contains(&name)
    } else {
        RETAINED_FILES.contains(&name) || name.starts_with("install.") || name == ".DS_Store"
    }
}

/// Recursively copy `src` over `dst`, skipping retained user data.
///
/// Existing files are replaced by copy-then-rename so a running executable
/// is swapped rather than written in place.
fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0;
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(src)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(fs::DirEntry::file_name);

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        let from = entry.path();
        let to = dst.join(&name);
        let is_dir = entry.file_type()?.is_dir();

        if is_retained(&name, is_dir) {
            tracing::debug!(path = %from.display(), "skipping retained path");
            continue;
        }
        if is_dir {
            fs::create_dir_all(&to)?;
            copied += copy_tree(&from, &to)?;
        } else {
            replace_file(&from, &to)?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn replace_file(from: &Path, to: &Path) -> Result<()> {
    let staged = staged_sibling(to);
    fs::copy(from, &staged).map_err(|e| {
        UpdateError::Io(format!("cannot copy {} into place: {e}", from.display()))
    })?;
    swap_into_place(&staged, to)
}

/// Hidden sibling of `to` that new content is written to before the swap.
pub(crate) fn staged_sibling(to: &Path) -> PathBuf {
    to.with_file_name(format!(
        ".{}.updraft-new",
        to.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ))
}

/// Rename `staged` over `to`, removing `staged` if the rename fails.
///
/// A rename replaces the directory entry, so an executable that is running
/// keeps its old inode instead of failing with "text file busy".
pub(crate) fn swap_into_place(staged: &Path, to: &Path) -> Result<()> {
    if let Err(e) = fs::rename(staged, to) {
        let _ = fs::remove_file(staged);
        return Err(UpdateError::Io(format!(
            "cannot replace {}: {e}",
            to.display()
        )));
    }
    Ok(())
}

/// Clear the macOS quarantine attribute on installed files. Best-effort.
#[cfg(target_os = "macos")]
fn clear_quarantine_attribute(target_dir: &Path) {
    let _ = Command::new("xattr")
        .args(["-cr", &target_dir.to_string_lossy()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
}

#[cfg(not(target_os = "macos"))]
fn clear_quarantine_attribute(_target_dir: &Path) {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_package(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, body) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn resolve_entry_rules() {
        let root = Path::new("/q");
        assert_eq!(resolve_entry(root, "bin/app"), Some(PathBuf::from("/q/bin/app")));
        assert_eq!(resolve_entry(root, "a/../b"), Some(PathBuf::from("/q/b")));
        assert_eq!(resolve_entry(root, "./x"), Some(PathBuf::from("/q/x")));
        assert!(resolve_entry(root, "../../evil").is_none());
        assert!(resolve_entry(root, "a/../../evil").is_none());
        assert!(resolve_entry(root, "/etc/passwd").is_none());
        assert!(resolve_entry(root, "..\\..\\evil").is_none());
        assert!(resolve_entry(root, ".").is_none());
    }

    #[test]
    fn path_escape_rejected_before_any_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive = dir.path().join("pkg.zip");
        write_package(&archive, &[("good.txt", b"ok"), ("../../evil", b"pwned")]);

        let stager = InstallStager::new(dir.path().join("cache"));
        let target = dir.path().join("app");
        let err = stager.install(&archive, &target, "2.0.0").unwrap_err();

        assert!(matches!(err, UpdateError::Security(_)));
        assert!(!stager.quarantine_dir("2.0.0").unwrap().exists());
        assert!(!target.exists());
        assert!(!dir.path().join("evil").exists());
    }

    #[test]
    fn copy_install_skips_user_data() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive = dir.path().join("pkg.zip");
        write_package(
            &archive,
            &[
                ("updraft", b"v2"),
                ("web/index.html", b"<html>"),
                ("config.toml", b"shipped defaults"),
                ("logs/shipped.log", b"x"),
            ],
        );
        let target = dir.path().join("app");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("updraft"), b"v1").unwrap();
        fs::write(target.join("config.toml"), b"user config").unwrap();

        let stager = InstallStager::new(dir.path().join("cache"));
        let report = stager.install(&archive, &target, "2.0.0").unwrap();

        assert!(matches!(report.method, InstallMethod::Copy { files: 2 }));
        assert_eq!(report.extracted, 4);
        assert_eq!(fs::read(target.join("updraft")).unwrap(), b"v2");
        assert_eq!(fs::read(target.join("web/index.html")).unwrap(), b"<html>");
        assert_eq!(fs::read(target.join("config.toml")).unwrap(), b"user config");
        assert!(!target.join("logs").exists());

        stager.cleanup("2.0.0");
        assert!(!stager.quarantine_dir("2.0.0").unwrap().exists());
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn install_script_runs_with_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive = dir.path().join("pkg.zip");
        let script: &[u8] = b"#!/bin/bash\nset -e\necho \"installing into $1\"\ncp \"$2/payload.bin\" \"$1/payload.bin\"\n";
        write_package(&archive, &[("install.sh", script), ("payload.bin", b"data")]);

        let target = dir.path().join("app");
        let stager = InstallStager::new(dir.path().join("cache"));
        let report = stager.install(&archive, &target, "2.0.0").unwrap();

        match report.method {
            InstallMethod::Script { output } => assert!(output.contains("installing into")),
            InstallMethod::Copy { .. } => unreachable!("script should have run"),
        }
        assert_eq!(fs::read(target.join("payload.bin")).unwrap(), b"data");
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn failing_script_is_io_error_with_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive = dir.path().join("pkg.zip");
        write_package(&archive, &[("install.sh", b"echo disk full >&2\nexit 3\n")]);

        let stager = InstallStager::new(dir.path().join("cache"));
        let err = stager
            .install(&archive, &dir.path().join("app"), "2.0.0")
            .unwrap_err();
        assert!(matches!(err, UpdateError::Io(_)));
        assert!(err.message().contains("disk full"));
    }

    #[test]
    fn path_segment_rules() {
        assert!(ensure_path_segment("version", "2.0.0").is_ok());
        assert!(ensure_path_segment("asset", "updraft-v2.0.0-linux-amd64.zip").is_ok());
        for bad in ["", ".", "..", "a/b", "2.0.0/../../victim", "..\\victim", "/etc", "C:\\x"] {
            assert!(
                matches!(ensure_path_segment("version", bad), Err(UpdateError::Security(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn traversing_version_never_touches_siblings() {
        let dir = tempfile::TempDir::new().unwrap();
        let victim = dir.path().join("victim");
        fs::create_dir_all(&victim).unwrap();
        fs::write(victim.join("keep.txt"), b"mine").unwrap();
        let archive = dir.path().join("pkg.zip");
        write_package(&archive, &[("updraft", b"v2")]);

        let stager = InstallStager::new(dir.path().join("cache"));
        let version = "2.0.0/../../victim";
        let err = stager.install(&archive, &dir.path().join("app"), version).unwrap_err();
        assert!(matches!(err, UpdateError::Security(_)));
        stager.cleanup(version);

        assert_eq!(fs::read(victim.join("keep.txt")).unwrap(), b"mine");
        assert!(!dir.path().join("app").exists());
    }

    #[cfg(unix)]
    #[test]
    fn replace_swaps_running_executable() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("server");
        fs::copy("/bin/sleep", &target).unwrap();
        let mut running = Command::new(&target).arg("30").spawn().unwrap();

        let from = dir.path().join("new-server");
        fs::write(&from, b"new build").unwrap();
        let result = replace_file(&from, &target);
        running.kill().unwrap();
        running.wait().unwrap();

        result.unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new build");
        assert!(!staged_sibling(&target).exists());
    }

    #[test]
    fn corrupt_package_is_integrity_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive = dir.path().join("pkg.zip");
        fs::write(&archive, b"not a zip").unwrap();
        let stager = InstallStager::new(dir.path().join("cache"));
        assert!(matches!(
            stager.install(&archive, &dir.path().join("app"), "2.0.0"),
            Err(UpdateError::Integrity(_))
        ));
    }
}
