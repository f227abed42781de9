//! Dotted version comparison and build identity.
//!
//! Versions are compared component-wise as integers after stripping an
//! optional `v` prefix. Missing components count as `0`, so `1.0` equals
//! `1.0.0`. Components that do not parse as integers also count as `0`
//! instead of failing: `1.x.3` compares like `1.0.3`. Release feeds in the
//! wild carry tags such as `1.4.0-rc1`, and a lenient comparison keeps the
//! updater working on them at the cost of treating `rc1` as `0`.

use std::cmp::Ordering;

/// Parse one dotted component, degrading anything non-numeric to `0`.
fn component(raw: &str) -> u64 {
    raw.trim().parse::<u64>().unwrap_or(0)
}

fn components(version: &str) -> Vec<u64> {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    trimmed.split('.').map(component).collect()
}

/// Compare two dotted version strings numerically.
///
/// ```rust
/// use std::cmp::Ordering;
/// use updraft::version::compare_versions;
///
/// assert_eq!(compare_versions("1.2.0", "1.10.0"), Ordering::Less);
/// assert_eq!(compare_versions("v1.0", "1.0.0"), Ordering::Equal);
/// ```
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Returns `true` if `candidate` is strictly newer than `current`.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}

/// Strip a leading `v`/`V` from a release tag.
pub fn normalize_tag(tag: &str) -> String {
    let tag = tag.trim();
    tag.strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .unwrap_or(tag)
        .to_owned()
}

/// Version of the running build.
///
/// `APP_VERSION` overrides the compiled-in package version so packagers can
/// stamp builds without recompiling.
pub fn current_version() -> String {
    match std::env::var("APP_VERSION") {
        Ok(v) if !v.trim().is_empty() => normalize_tag(&v),
        _ => env!("CARGO_PKG_VERSION").to_owned(),
    }
}

/// Platform tag used to pick release assets, e.g. `linux-amd64`.
pub fn platform_string() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    format!("{os}-{arch}")
}
