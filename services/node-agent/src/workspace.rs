//! Per-instance working directories.
//!
//! Each instance gets `<data_root>/instances/<instance_id>/` with `merged/`
//! (the assembled server files), `logs/`, and `temp/`. The directory count
//! under `instances/` doubles as the node's used-slot figure.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use warren_id::InstanceId;

pub const INSTANCES_DIR: &str = "instances";
pub const MERGED_DIR: &str = "merged";
pub const LOGS_DIR: &str = "logs";
pub const TEMP_DIR: &str = "temp";

/// On-disk locations for one instance.
#[derive(Debug, Clone)]
pub struct InstancePaths {
    pub root: PathBuf,
    pub merged_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub temp_dir: PathBuf,
}

pub struct Workspace {
    instances_root: PathBuf,
}

impl Workspace {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            instances_root: data_root.into().join(INSTANCES_DIR),
        }
    }

    pub fn instances_root(&self) -> &Path {
        &self.instances_root
    }

    pub fn resolve(&self, instance_id: InstanceId) -> InstancePaths {
        let root = self.instances_root.join(instance_id.to_string());
        InstancePaths {
            merged_dir: root.join(MERGED_DIR),
            logs_dir: root.join(LOGS_DIR),
            temp_dir: root.join(TEMP_DIR),
            root,
        }
    }

    /// Creates the instance's directory tree; reusing an existing tree is
    /// fine, a re-prepare overwrites the merged contents anyway.
    pub fn prepare(&self, instance_id: InstanceId) -> io::Result<InstancePaths> {
        let paths = self.resolve(instance_id);
        fs::create_dir_all(&paths.merged_dir)?;
        fs::create_dir_all(&paths.logs_dir)?;
        fs::create_dir_all(&paths.temp_dir)?;
        debug!(
            instance_id = %instance_id,
            root = %paths.root.display(),
            "Instance workspace ready"
        );
        Ok(paths)
    }

    /// Removes the instance's directory tree. Returns whether anything was
    /// there to remove.
    pub fn delete(&self, instance_id: InstanceId) -> io::Result<bool> {
        let root = self.resolve(instance_id).root;
        match fs::remove_dir_all(&root) {
            Ok(()) => {
                info!(instance_id = %instance_id, "Instance workspace removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Number of instance workspaces on disk.
    pub fn instance_count(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.instances_root) else {
            return 0;
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .count()
    }
}
