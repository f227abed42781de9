//! Release feed client.
//!
//! Reads a GitHub-style "latest release" document and turns it into a
//! [`ReleaseDescriptor`] for the running platform. Any failure (transport,
//! non-success status, malformed payload) falls back to a local descriptor
//! that describes the running build, so a dead feed reads as "no update".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::installer::ensure_path_segment;
use crate::config::FeedConfig;
use crate::error::{Result, UpdateError};
use crate::version::{compare_versions, current_version, is_newer, normalize_tag, platform_string};

/// Minimum compatible version assumed when the feed does not name one.
pub const DEFAULT_MIN_VERSION: &str = "1.0.0";

/// Metadata describing an available build. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    pub version: String,
    pub download_url: String,
    /// Hex SHA-256 of the package, when the feed publishes one.
    pub checksum: Option<String>,
    /// Package size; `0` means unknown.
    pub size_bytes: u64,
    pub min_compatible_version: String,
    pub critical: bool,
    pub release_notes: String,
    pub published_at: Option<DateTime<Utc>>,
    /// File name of the selected asset.
    pub asset_name: String,
    /// `true` when the feed was unreachable and this is the local default.
    pub from_fallback: bool,
}

impl ReleaseDescriptor {
    /// Critical if flagged, or if `current` is below the minimum compatible version.
    pub fn is_critical_for(&self, current: &str) -> bool {
        self.critical || compare_versions(current, &self.min_compatible_version).is_lt()
    }

    /// Name for the staged package file.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Security`] if the asset name (or the version it
    /// is derived from) is not a plain file name.
    pub fn package_file_name(&self) -> Result<String> {
        let name = if self.asset_name.is_empty() {
            format!("updraft-v{}-{}.zip", self.version, platform_string())
        } else {
            self.asset_name.clone()
        };
        ensure_path_segment("package name", &name)?;
        Ok(name)
    }
}

/// Result of comparing the feed against the running build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCheck {
    pub has_update: bool,
    pub current_version: String,
    pub latest_version: String,
    pub is_critical: bool,
    pub auto_update_enabled: bool,
    pub checked_at: DateTime<Utc>,
    /// Present only when `has_update` is set.
    pub descriptor: Option<ReleaseDescriptor>,
}

impl UpdateCheck {
    /// Compare `descriptor` with `current`.
    pub fn evaluate(descriptor: ReleaseDescriptor, current: &str, auto_update_enabled: bool) -> Self {
        let has_update = is_newer(&descriptor.version, current);
        Self {
            has_update,
            current_version: current.to_owned(),
            latest_version: descriptor.version.clone(),
            is_critical: has_update && descriptor.is_critical_for(current),
            auto_update_enabled,
            checked_at: Utc::now(),
            descriptor: has_update.then_some(descriptor),
        }
    }
}

// ---------------------------------------------------------------------------
// Feed payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FeedRelease {
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<FeedAsset>,
}

#[derive(Debug, Deserialize)]
struct FeedAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: u64,
}

/// Release notes markers.
#[derive(Debug, Default, PartialEq)]
struct NotesMarkers {
    checksum: Option<String>,
    min_version: Option<String>,
    critical: bool,
}

fn parse_notes(body: &str) -> NotesMarkers {
    let mut markers = NotesMarkers {
        critical: body.to_ascii_lowercase().contains("[critical]"),
        ..NotesMarkers::default()
    };
    for line in body.lines() {
        let line = line.trim().trim_start_matches(['-', '*', ' ']);
        let lower = line.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("sha256:") {
            markers.checksum = parse_digest(rest);
        } else if lower.starts_with("min_version:") {
            let value = line["min_version:".len()..].trim();
            if !value.is_empty() {
                markers.min_version = Some(normalize_tag(value));
            }
        }
    }
    markers
}

/// First whitespace-separated token if it is a 64-char hex digest.
fn parse_digest(text: &str) -> Option<String> {
    let token = text.split_whitespace().next()?;
    (token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| token.to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// ReleaseSource
// ---------------------------------------------------------------------------

/// Fetches the latest release descriptor. No caching across calls.
pub struct ReleaseSource {
    client: reqwest::Client,
    endpoint: String,
    asset_prefix: String,
    platform: String,
}

impl ReleaseSource {
    /// Build a source from feed configuration.
    pub fn new(feed: &FeedConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(feed.user_agent.clone())
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: feed.endpoint.clone(),
            asset_prefix: feed.asset_prefix.clone(),
            platform: platform_string(),
        }
    }

    /// Select assets for another platform string.
    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Shared HTTP client, reused for package downloads.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Fetch the latest descriptor, falling back to [`Self::fallback_descriptor`].
    pub async fn fetch_latest(&self) -> ReleaseDescriptor {
        match self.fetch_remote().await {
            Ok(descriptor) => {
                tracing::info!(
                    version = %descriptor.version,
                    asset = %descriptor.asset_name,
                    "release feed fetched"
                );
                descriptor
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "release feed unavailable, using local descriptor");
                Self::fallback_descriptor()
            }
        }
    }

    /// Descriptor for the running build: never newer, never downloadable.
    pub fn fallback_descriptor() -> ReleaseDescriptor {
        let version = current_version();
        ReleaseDescriptor {
            version,
            download_url: String::new(),
            checksum: None,
            size_bytes: 0,
            min_compatible_version: DEFAULT_MIN_VERSION.to_owned(),
            critical: false,
            release_notes: String::new(),
            published_at: None,
            asset_name: String::new(),
            from_fallback: true,
        }
    }

    async fn fetch_remote(&self) -> Result<ReleaseDescriptor> {
        let response = self
            .client
            .get(&self.endpoint)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| UpdateError::Network(format!("feed request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(UpdateError::Network(format!(
                "feed returned HTTP {}",
                response.status()
            )));
        }

        let release: FeedRelease = response
            .json()
            .await
            .map_err(|e| UpdateError::Network(format!("malformed feed payload: {e}")))?;

        let body = release.body.unwrap_or_default();
        let markers = parse_notes(&body);

        let asset = release.assets.iter().find(|a| {
            a.name.contains(&self.platform)
                && a.name.starts_with(&self.asset_prefix)
                && !a.name.ends_with(".sha256")
        });

        let mut checksum = markers.checksum;
        if let Some(asset) = asset {
            let companion = format!("{}.sha256", asset.name);
            if let Some(sum) = release.assets.iter().find(|a| a.name == companion) {
                match self.fetch_digest(&sum.browser_download_url).await {
                    Ok(digest) => checksum = Some(digest),
                    Err(e) => tracing::warn!(asset = %sum.name, error = %e, "checksum asset unusable"),
                }
            }
        } else {
            tracing::warn!(platform = %self.platform, "no release asset for this platform");
        }

        Ok(ReleaseDescriptor {
            version: normalize_tag(&release.tag_name),
            download_url: asset.map(|a| a.browser_download_url.clone()).unwrap_or_default(),
            checksum,
            size_bytes: asset.map_or(0, |a| a.size),
            min_compatible_version: markers
                .min_version
                .unwrap_or_else(|| DEFAULT_MIN_VERSION.to_owned()),
            critical: markers.critical,
            release_notes: body,
            published_at: release.published_at,
            asset_name: asset.map(|a| a.name.clone()).unwrap_or_default(),
            from_fallback: false,
        })
    }

    async fn fetch_digest(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(UpdateError::Network(format!("HTTP {}", response.status())));
        }
        let text = response
            .text()
            .await
            .map_err(|e| UpdateError::Network(e.to_string()))?;
        parse_digest(&text).ok_or_else(|| UpdateError::Integrity("not a sha256 digest".into()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
