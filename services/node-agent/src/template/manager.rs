//! Cache purge operations.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use super::layout::{CacheLayout, SegmentError};

#[derive(Debug, Error)]
pub enum PurgeError {
    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error("purge target escapes the template cache: {}", .0.display())]
    OutsideCache(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What a purge removed, reported back to the caller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeTotals {
    pub files_deleted: u64,
    pub directories_deleted: u64,
    pub bytes_reclaimed: u64,
}

pub struct CacheManager {
    layout: CacheLayout,
}

impl CacheManager {
    pub fn new(layout: CacheLayout) -> Self {
        Self { layout }
    }

    /// Deletes every cached template and recreates the empty cache root.
    pub fn purge_all(&self) -> Result<PurgeTotals, PurgeError> {
        let root = self.layout.templates_root();
        let totals = delete_tree(root)?;
        fs::create_dir_all(root)?;
        info!(
            files = totals.files_deleted,
            directories = totals.directories_deleted,
            bytes = totals.bytes_reclaimed,
            "Template cache purged"
        );
        Ok(totals)
    }

    /// Deletes every cached version of one template. Purging a template
    /// that was never cached deletes nothing and reports zero totals.
    pub fn purge_template(&self, template_id: &str) -> Result<PurgeTotals, PurgeError> {
        let target = self.layout.template_root(template_id)?;
        // segment validation already rejects traversal; this is the last
        // check before a recursive delete
        if !target.starts_with(self.layout.templates_root()) {
            return Err(PurgeError::OutsideCache(target));
        }
        let totals = delete_tree(&target)?;
        info!(
            template_id = %template_id.trim(),
            files = totals.files_deleted,
            directories = totals.directories_deleted,
            bytes = totals.bytes_reclaimed,
            "Template purged from cache"
        );
        Ok(totals)
    }
}

/// Removes `root` recursively, counting files, directories (the root
/// included), and file bytes. A missing root is a zero-total no-op.
/// Symlinks are never followed; the link itself is removed and counted
/// as a file.
fn delete_tree(root: &Path) -> Result<PurgeTotals, PurgeError> {
    let mut totals = PurgeTotals::default();
    let metadata = match fs::symlink_metadata(root) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(totals),
        Err(e) => return Err(e.into()),
    };
    delete_entry(root, &metadata, &mut totals)?;
    Ok(totals)
}

fn delete_entry(
    path: &Path,
    metadata: &fs::Metadata,
    totals: &mut PurgeTotals,
) -> Result<(), PurgeError> {
    if metadata.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let child_metadata = entry.metadata()?;
            delete_entry(&entry.path(), &child_metadata, totals)?;
        }
        fs::remove_dir(path)?;
        totals.directories_deleted += 1;
    } else {
        totals.bytes_reclaimed += metadata.len();
        fs::remove_file(path)?;
        totals.files_deleted += 1;
    }
    Ok(())
}
