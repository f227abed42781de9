//! Update package integrity verification.
//!
//! A package is accepted only if its size, SHA-256 digest and zip structure
//! all check out. The size and digest checks are skipped when the release
//! descriptor does not carry them.
//!
//! # Example
//!
//! ```rust
//! use updraft::update::integrity::{verify_checksum, IntegrityResult};
//! use std::path::Path;
//!
//! let result = verify_checksum(Path::new("/nonexistent/pkg.zip"), None);
//! assert_eq!(result, IntegrityResult::Missing);
//! ```

use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{Result, UpdateError};

/// Result of a checksum comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityResult {
    /// File exists and (if a checksum was provided) matches the expected hash.
    Ok,
    /// File does not exist at the given path.
    Missing,
    /// File exists but its SHA-256 digest does not match the expected value.
    Corrupt,
    /// File exists but no expected checksum was provided.
    NoChecksum,
}

impl fmt::Display for IntegrityResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Missing => write!(f, "missing"),
            Self::Corrupt => write!(f, "corrupt"),
            Self::NoChecksum => write!(f, "no_checksum"),
        }
    }
}

/// Compare a file against an optional expected SHA-256 hex digest.
///
/// The comparison is case-insensitive.
pub fn verify_checksum(path: &Path, expected_sha256: Option<&str>) -> IntegrityResult {
    if !path.is_file() {
        info!(path = %path.display(), "package integrity: file missing");
        return IntegrityResult::Missing;
    }

    let Some(expected) = expected_sha256.filter(|h| !h.trim().is_empty()) else {
        return IntegrityResult::NoChecksum;
    };

    match sha256_hex(path) {
        Ok(actual) if actual.eq_ignore_ascii_case(expected.trim()) => IntegrityResult::Ok,
        Ok(actual) => {
            warn!(
                path = %path.display(),
                expected,
                actual = %actual,
                "package integrity: checksum mismatch"
            );
            IntegrityResult::Corrupt
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "package integrity: unreadable file");
            IntegrityResult::Corrupt
        }
    }
}

/// Compute the SHA-256 hex digest of a file's contents in 64 KiB chunks.
///
/// # Errors
///
/// Returns the I/O error if the file cannot be opened or read.
pub fn sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 65_536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Open the archive and read every stored (uncompressed) entry in full.
///
/// Deflated entries are checked when they are extracted.
///
/// # Errors
///
/// Returns [`UpdateError::Integrity`] naming the first unreadable entry.
pub fn verify_archive(path: &Path) -> Result<usize> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| UpdateError::Integrity(format!("cannot open archive: {e}")))?;

    let mut stored = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| UpdateError::Integrity(format!("cannot read archive entry {i}: {e}")))?;
        if entry.compression() != zip::CompressionMethod::Stored || entry.is_dir() {
            continue;
        }
        let name = entry.name().to_owned();
        io::copy(&mut entry, &mut io::sink())
            .map_err(|e| UpdateError::Integrity(format!("entry {name} unreadable: {e}")))?;
        stored += 1;
    }
    Ok(stored)
}

/// Full package check: size, then digest, then archive structure.
///
/// # Errors
///
/// Returns [`UpdateError::Integrity`] describing the first failed check.
pub fn verify_package(path: &Path, expected_size: u64, expected_sha256: Option<&str>) -> Result<()> {
    let actual_size = std::fs::metadata(path)
        .map_err(|e| UpdateError::Integrity(format!("cannot stat {}: {e}", path.display())))?
        .len();
    if expected_size > 0 && actual_size != expected_size {
        return Err(UpdateError::Integrity(format!(
            "size mismatch: expected {expected_size} bytes, got {actual_size}"
        )));
    }

    match verify_checksum(path, expected_sha256) {
        IntegrityResult::Ok | IntegrityResult::NoChecksum => {}
        other => {
            return Err(UpdateError::Integrity(format!(
                "checksum verification failed: {other}"
            )));
        }
    }

    verify_archive(path)?;
    info!(path = %path.display(), size = actual_size, "package verified");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
