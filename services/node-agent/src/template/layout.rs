//! On-disk layout of the template cache.
//!
//! Every cached (template, version) lives at
//! `<cacheRoot>/templates/<templateId>/<version>/` with three entries:
//! a `contents/` directory holding the extracted archive, a
//! `checksum.sha256` file, and a `metadata.json` sidecar.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

pub const TEMPLATES_DIR: &str = "templates";
pub const CONTENTS_DIR: &str = "contents";
pub const CHECKSUM_FILE: &str = "checksum.sha256";
pub const METADATA_FILE: &str = "metadata.json";

/// A rejected path segment. The field name (`templateId`, `version`,
/// `instanceId`) is carried for the error message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SegmentError {
    #[error("{0} must not be blank")]
    Blank(&'static str),

    #[error("{0} must be a single path segment")]
    NotASegment(&'static str),
}

/// Validates and trims one caller-supplied path segment. Anything that
/// could traverse outside its parent directory (separators, `.`, `..`,
/// absolute paths) is rejected.
pub fn require_segment<'a>(value: &'a str, name: &'static str) -> Result<&'a str, SegmentError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SegmentError::Blank(name));
    }
    let mut components = Path::new(trimmed).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(trimmed),
        _ => Err(SegmentError::NotASegment(name)),
    }
}

/// Path resolution for the template cache rooted at a configured data
/// directory.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    templates_root: PathBuf,
}

impl CacheLayout {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            templates_root: cache_root.into().join(TEMPLATES_DIR),
        }
    }

    pub fn templates_root(&self) -> &Path {
        &self.templates_root
    }

    pub fn template_root(&self, template_id: &str) -> Result<PathBuf, SegmentError> {
        let template_id = require_segment(template_id, "templateId")?;
        Ok(self.templates_root.join(template_id))
    }

    /// Resolves every path belonging to one cached version. Both segments
    /// are validated; a bad id never touches the filesystem.
    pub fn version_paths(
        &self,
        template_id: &str,
        version: &str,
    ) -> Result<CachePaths, SegmentError> {
        let template_root = self.template_root(template_id)?;
        let version = require_segment(version, "version")?;
        let version_root = template_root.join(version);
        Ok(CachePaths {
            contents_dir: version_root.join(CONTENTS_DIR),
            checksum_file: version_root.join(CHECKSUM_FILE),
            metadata_file: version_root.join(METADATA_FILE),
            version_root,
            template_root,
        })
    }
}

/// Resolved on-disk locations for one cached (template, version).
#[derive(Debug, Clone)]
pub struct CachePaths {
    pub template_root: PathBuf,
    pub version_root: PathBuf,
    pub contents_dir: PathBuf,
    pub checksum_file: PathBuf,
    pub metadata_file: PathBuf,
}
