//! Template cache lookup and population.
//!
//! A cached (template, version) is only ever observable in two durable
//! states: absent, or fully valid. Population stages everything in temp
//! paths inside the template's root and promotes with a single atomic
//! rename, so a crash mid-populate leaves temp litter, never a
//! half-extracted entry that looks real. Concurrent populates of the same
//! version race harmlessly: the loser's rename finds the target already
//! present and backs off.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::layout::{
    require_segment, CacheLayout, CachePaths, SegmentError, CHECKSUM_FILE, CONTENTS_DIR,
    METADATA_FILE,
};
use crate::storage::{StorageError, TemplateStorage};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error("{0} must not be blank")]
    MissingField(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("downloaded {received} bytes for {storage_key}, expected {expected}")]
    LengthMismatch {
        storage_key: String,
        expected: u64,
        received: u64,
    },

    #[error("checksum mismatch for {storage_key}: expected {expected}, actual {actual}")]
    ChecksumMismatch {
        storage_key: String,
        expected: String,
        actual: String,
    },

    #[error("archive entry with empty name in {0}")]
    EmptyEntryName(String),

    #[error("archive contains link entry {0}")]
    LinkEntry(String),

    #[error("archive entry escapes destination: {0}")]
    EntryEscapes(String),

    #[error("archive has more than {0} entries")]
    TooManyEntries(u64),

    #[error("archive exceeds extracted size limit of {0} bytes")]
    TooLarge(u64),

    #[error("template cache population failed for {template_id} {version}")]
    PopulationFailed {
        template_id: String,
        version: String,
    },
}

/// Extraction ceilings; a corrupt or hostile archive must not be able to
/// exhaust the node's disk.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_archive_entries: u64,
    pub max_extracted_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_archive_entries: 100_000,
            max_extracted_bytes: 8 * 1024 * 1024 * 1024, // 8 GiB
        }
    }
}

/// Sidecar written next to each cached version.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub template_id: String,
    pub version: String,
    pub checksum: String,
    pub storage_key: String,
    pub cached_at: DateTime<Utc>,
}

/// Why a lookup missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    NotFound,
    ChecksumMismatch,
}

/// Outcome of one cache lookup.
#[derive(Debug)]
pub struct CacheLookup {
    pub template_id: String,
    pub version: String,
    pub contents_dir: PathBuf,
    pub outcome: LookupOutcome,
}

#[derive(Debug)]
pub enum LookupOutcome {
    Hit,
    Miss {
        reason: MissReason,
        /// Stale checksum found on disk, if any.
        cached_checksum: Option<String>,
    },
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self.outcome, LookupOutcome::Hit)
    }
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

fn temp_token() -> String {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", std::process::id(), seq)
}

fn non_blank<'a>(value: &'a str, name: &'static str) -> Result<&'a str, CacheError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CacheError::MissingField(name));
    }
    Ok(trimmed)
}

fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub struct TemplateCache {
    layout: CacheLayout,
    storage: Arc<dyn TemplateStorage>,
    config: CacheConfig,
}

impl TemplateCache {
    pub fn new(
        layout: CacheLayout,
        storage: Arc<dyn TemplateStorage>,
        config: CacheConfig,
    ) -> Self {
        Self {
            layout,
            storage,
            config,
        }
    }

    /// Checks whether a checksum-valid extraction of this version is on
    /// disk. A hit requires the contents directory, the checksum file, and
    /// an exact (trimmed) checksum match; anything else is a miss with a
    /// reason.
    pub fn lookup(
        &self,
        template_id: &str,
        version: &str,
        checksum: &str,
    ) -> Result<CacheLookup, CacheError> {
        let template_id = require_segment(template_id, "templateId")?.to_string();
        let version = require_segment(version, "version")?.to_string();
        let expected = non_blank(checksum, "checksum")?;
        let paths = self.layout.version_paths(&template_id, &version)?;

        let contents_exists = paths.contents_dir.is_dir();
        let checksum_exists = paths.checksum_file.is_file();
        if !contents_exists || !checksum_exists {
            let cached_checksum = if checksum_exists {
                Some(read_checksum(&paths.checksum_file)?)
            } else {
                None
            };
            return Ok(CacheLookup {
                template_id,
                version,
                contents_dir: paths.contents_dir,
                outcome: LookupOutcome::Miss {
                    reason: MissReason::NotFound,
                    cached_checksum,
                },
            });
        }

        let cached = read_checksum(&paths.checksum_file)?;
        if cached != expected {
            return Ok(CacheLookup {
                template_id,
                version,
                contents_dir: paths.contents_dir,
                outcome: LookupOutcome::Miss {
                    reason: MissReason::ChecksumMismatch,
                    cached_checksum: Some(cached),
                },
            });
        }

        Ok(CacheLookup {
            template_id,
            version,
            contents_dir: paths.contents_dir,
            outcome: LookupOutcome::Hit,
        })
    }

    /// Returns a checksum-valid cache entry, populating on any miss.
    pub async fn ensure_cached(
        &self,
        template_id: &str,
        version: &str,
        checksum: &str,
        storage_key: &str,
    ) -> Result<CacheLookup, CacheError> {
        let lookup = self.lookup(template_id, version, checksum)?;
        match &lookup.outcome {
            LookupOutcome::Hit => {
                debug!(
                    template_id = %lookup.template_id,
                    version = %lookup.version,
                    "Template cache hit"
                );
                Ok(lookup)
            }
            LookupOutcome::Miss {
                reason,
                cached_checksum,
            } => {
                info!(
                    template_id = %lookup.template_id,
                    version = %lookup.version,
                    reason = ?reason,
                    cached_checksum = ?cached_checksum,
                    "Template cache miss; populating"
                );
                self.populate(template_id, version, checksum, storage_key)
                    .await
            }
        }
    }

    /// Rebuilds the cached version from object storage: deletes any stale
    /// entry, downloads and verifies the archive, extracts into a temp
    /// directory, and promotes it with an atomic rename. Returns the
    /// verified lookup.
    pub async fn populate(
        &self,
        template_id: &str,
        version: &str,
        checksum: &str,
        storage_key: &str,
    ) -> Result<CacheLookup, CacheError> {
        let template_id = require_segment(template_id, "templateId")?.to_string();
        let version = require_segment(version, "version")?.to_string();
        let checksum = non_blank(checksum, "checksum")?.to_string();
        let storage_key = non_blank(storage_key, "storageKey")?.to_string();

        let paths = self.layout.version_paths(&template_id, &version)?;
        remove_dir_all_if_exists(&paths.version_root)?;
        fs::create_dir_all(&paths.template_root)?;

        // Temp artifacts stay inside the template root so the final rename
        // never crosses a filesystem boundary.
        let token = temp_token();
        let temp_tar = paths.template_root.join(format!("template-{token}.tar"));
        let temp_dir = paths.template_root.join(format!(".cache-{token}"));
        fs::create_dir_all(&temp_dir)?;

        let outcome = self
            .populate_into(
                &paths,
                &temp_tar,
                &temp_dir,
                &template_id,
                &version,
                &checksum,
                &storage_key,
            )
            .await;
        cleanup_temp(&temp_tar, &temp_dir);
        outcome?;

        let lookup = self.lookup(&template_id, &version, &checksum)?;
        if !lookup.is_hit() {
            return Err(CacheError::PopulationFailed {
                template_id,
                version,
            });
        }
        Ok(lookup)
    }

    async fn populate_into(
        &self,
        paths: &CachePaths,
        temp_tar: &Path,
        temp_dir: &Path,
        template_id: &str,
        version: &str,
        checksum: &str,
        storage_key: &str,
    ) -> Result<(), CacheError> {
        self.download(storage_key, checksum, temp_tar).await?;

        let temp_contents = temp_dir.join(CONTENTS_DIR);
        fs::create_dir_all(&temp_contents)?;
        self.extract(temp_tar, &temp_contents, storage_key)?;

        fs::write(temp_dir.join(CHECKSUM_FILE), checksum)?;
        let metadata = CacheMetadata {
            template_id: template_id.to_string(),
            version: version.to_string(),
            checksum: checksum.to_string(),
            storage_key: storage_key.to_string(),
            cached_at: Utc::now(),
        };
        fs::write(
            temp_dir.join(METADATA_FILE),
            serde_json::to_string_pretty(&metadata)?,
        )?;

        // The rename is the only ABSENT -> VALID transition.
        match fs::rename(temp_dir, &paths.version_root) {
            Ok(()) => {
                info!(template_id = %template_id, version = %version, "Template cached");
                Ok(())
            }
            Err(_) if paths.version_root.exists() => {
                info!(
                    template_id = %template_id,
                    version = %version,
                    "Another populate won the race; keeping the existing entry"
                );
                Ok(())
            }
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    /// Streams the archive to `dest` through a SHA-256 hasher, then checks
    /// the byte count against the declared Content-Length and the digest
    /// against the expected checksum. Any disagreement fails before
    /// extraction begins.
    async fn download(
        &self,
        storage_key: &str,
        expected_checksum: &str,
        dest: &Path,
    ) -> Result<(), CacheError> {
        let archive = self.storage.fetch(storage_key).await?;
        let mut stream = archive.stream;

        let mut hasher = Sha256::new();
        let mut file = File::create(dest)?;
        let mut received: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk)?;
            received += chunk.len() as u64;
        }
        file.sync_all()?;
        drop(file);

        if let Some(expected) = archive.content_length {
            if expected > 0 && expected != received {
                return Err(CacheError::LengthMismatch {
                    storage_key: storage_key.to_string(),
                    expected,
                    received,
                });
            }
        }

        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected_checksum) {
            return Err(CacheError::ChecksumMismatch {
                storage_key: storage_key.to_string(),
                expected: expected_checksum.to_string(),
                actual,
            });
        }

        debug!(storage_key = %storage_key, bytes = received, "Template archive downloaded");
        Ok(())
    }

    fn extract(&self, tar_path: &Path, dest: &Path, storage_key: &str) -> Result<(), CacheError> {
        let file = File::open(tar_path)?;
        let reader = BufReader::new(file);

        if should_gunzip(storage_key, tar_path)? {
            let decoder = GzDecoder::new(reader);
            let mut archive = Archive::new(decoder);
            self.extract_archive(&mut archive, dest, storage_key)
        } else {
            let mut archive = Archive::new(reader);
            self.extract_archive(&mut archive, dest, storage_key)
        }
    }

    /// Stream-extracts entry by entry. Link entries and entries resolving
    /// outside `dest` are rejected outright; entry-count and
    /// extracted-bytes ceilings bound the damage a hostile archive can do.
    /// Directory modes are applied deepest-first after all files land so a
    /// read-only directory cannot block its own children.
    fn extract_archive<R: Read>(
        &self,
        archive: &mut Archive<R>,
        dest: &Path,
        storage_key: &str,
    ) -> Result<(), CacheError> {
        let mut entries: u64 = 0;
        let mut extracted_bytes: u64 = 0;
        let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            entries += 1;
            if entries > self.config.max_archive_entries {
                return Err(CacheError::TooManyEntries(self.config.max_archive_entries));
            }

            let path = entry.path()?.into_owned();
            if path.as_os_str().is_empty() {
                return Err(CacheError::EmptyEntryName(storage_key.to_string()));
            }

            let entry_type = entry.header().entry_type();
            if entry_type.is_symlink() || entry_type.is_hard_link() {
                return Err(CacheError::LinkEntry(path.display().to_string()));
            }

            let contained = path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !contained {
                return Err(CacheError::EntryEscapes(path.display().to_string()));
            }

            let target = dest.join(&path);
            let mode = entry.header().mode().unwrap_or(0o755);
            if entry_type.is_dir() {
                fs::create_dir_all(&target)?;
                dir_modes.push((target, mode));
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let remaining = self
                    .config
                    .max_extracted_bytes
                    .saturating_sub(extracted_bytes);
                extracted_bytes +=
                    copy_limited(&mut entry, &target, remaining, self.config.max_extracted_bytes)?;
                apply_mode(&target, mode)?;
            }
        }

        dir_modes.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (dir, mode) in dir_modes {
            apply_mode(&dir, mode)?;
        }

        Ok(())
    }

    /// Startup diagnostic: walks every cached version and logs whether it
    /// still looks valid (contents present, checksum file readable, and
    /// matching the metadata sidecar when one exists).
    pub fn check_cached_versions(&self) -> Result<(), CacheError> {
        let templates = match fs::read_dir(self.layout.templates_root()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for template_entry in templates {
            let template_entry = template_entry?;
            if !template_entry.file_type()?.is_dir() {
                continue;
            }
            let template_id = template_entry.file_name().to_string_lossy().into_owned();

            for version_entry in fs::read_dir(template_entry.path())? {
                let version_entry = version_entry?;
                if !version_entry.file_type()?.is_dir() {
                    continue;
                }
                let version = version_entry.file_name().to_string_lossy().into_owned();
                if version.starts_with(".cache-") {
                    // in-flight temp directory, not an entry
                    continue;
                }

                let version_root = version_entry.path();
                let contents_ok = version_root.join(CONTENTS_DIR).is_dir();
                let checksum = fs::read_to_string(version_root.join(CHECKSUM_FILE))
                    .ok()
                    .map(|s| s.trim().to_string());
                let metadata: Option<CacheMetadata> =
                    fs::read_to_string(version_root.join(METADATA_FILE))
                        .ok()
                        .and_then(|s| serde_json::from_str(&s).ok());

                let valid = contents_ok
                    && checksum.is_some()
                    && metadata
                        .as_ref()
                        .map_or(true, |m| Some(&m.checksum) == checksum.as_ref());
                info!(
                    template_id = %template_id,
                    version = %version,
                    valid,
                    "Template cache entry checked"
                );
            }
        }

        Ok(())
    }
}

fn read_checksum(path: &Path) -> Result<String, CacheError> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

fn cleanup_temp(temp_tar: &Path, temp_dir: &Path) {
    if let Err(e) = fs::remove_file(temp_tar) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %temp_tar.display(), error = %e, "Could not remove temp archive");
        }
    }
    if temp_dir.exists() {
        if let Err(e) = fs::remove_dir_all(temp_dir) {
            warn!(path = %temp_dir.display(), error = %e, "Could not remove temp directory");
        }
    }
}

/// Gzip is detected by storage-key extension or, failing that, the
/// two-byte magic at the start of the file.
fn should_gunzip(storage_key: &str, archive: &Path) -> io::Result<bool> {
    let lower = storage_key.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") || lower.ends_with(".gz") {
        return Ok(true);
    }
    is_gzip(archive)
}

fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    if file.read_exact(&mut magic).is_ok() {
        Ok(magic == [0x1f, 0x8b])
    } else {
        Ok(false)
    }
}

fn copy_limited<R: Read>(
    reader: &mut R,
    target: &Path,
    remaining: u64,
    limit: u64,
) -> Result<u64, CacheError> {
    let mut file = File::create(target)?;
    let mut copied: u64 = 0;
    let mut buf = [0u8; 8192];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        copied += read as u64;
        if copied > remaining {
            return Err(CacheError::TooLarge(limit));
        }
        file.write_all(&buf[..read])?;
    }
    Ok(copied)
}

#[cfg(unix)]
fn apply_mode(target: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = mode & 0o777;
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(target, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn apply_mode(_target: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
