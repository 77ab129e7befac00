//! Layer merging.
//!
//! Layers land in ascending `order_index`; a later layer overwrites earlier
//! ones file by file. The merged directory is reset on every merge so a
//! re-prepare never inherits files from the previous run.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("at least one layer is required")]
    NoLayers,

    #[error("duplicate layer orderIndex {0}")]
    DuplicateOrderIndex(i32),

    #[error("layer {template_id} {version} has no cached contents at {}", .path.display())]
    MissingContents {
        template_id: String,
        version: String,
        path: PathBuf,
    },

    #[error("layer entry escapes the merge destination: {}", .0.display())]
    EntryEscapes(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One cached layer feeding a merge.
#[derive(Debug, Clone)]
pub struct LayerSource {
    pub template_id: String,
    pub version: String,
    pub order_index: i32,
    pub contents_dir: PathBuf,
}

/// Overlays the layers into `merged_dir`, lowest `order_index` first.
/// `fs::copy` carries permission bits, so executables stay executable.
pub fn merge_layers(layers: &[LayerSource], merged_dir: &Path) -> Result<(), MergeError> {
    if layers.is_empty() {
        return Err(MergeError::NoLayers);
    }

    let mut ordered = BTreeMap::new();
    for layer in layers {
        if ordered.insert(layer.order_index, layer).is_some() {
            return Err(MergeError::DuplicateOrderIndex(layer.order_index));
        }
    }

    if merged_dir.exists() {
        fs::remove_dir_all(merged_dir)?;
    }
    fs::create_dir_all(merged_dir)?;

    for layer in ordered.values() {
        if !layer.contents_dir.is_dir() {
            return Err(MergeError::MissingContents {
                template_id: layer.template_id.clone(),
                version: layer.version.clone(),
                path: layer.contents_dir.clone(),
            });
        }
        copy_dir(&layer.contents_dir, merged_dir, merged_dir)?;
        debug!(
            template_id = %layer.template_id,
            version = %layer.version,
            order_index = layer.order_index,
            "Layer merged"
        );
    }

    Ok(())
}

/// Recursive overlay copy. When an entry changes kind between layers
/// (file to directory or back), the old entry is removed first.
fn copy_dir(source: &Path, dest: &Path, dest_root: &Path) -> Result<(), MergeError> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if !target.starts_with(dest_root) {
            return Err(MergeError::EntryEscapes(target));
        }
        if entry.file_type()?.is_dir() {
            if target.is_file() {
                fs::remove_file(&target)?;
            }
            fs::create_dir_all(&target)?;
            copy_dir(&entry.path(), &target, dest_root)?;
        } else {
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layer(
        root: &Path,
        name: &str,
        order_index: i32,
        files: &[(&str, &str)],
    ) -> LayerSource {
        let contents_dir = root.join(name).join("contents");
        for (rel, data) in files {
            let path = contents_dir.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }
        fs::create_dir_all(&contents_dir).unwrap();
        LayerSource {
            template_id: name.to_string(),
            version: "1.0.0".to_string(),
            order_index,
            contents_dir,
        }
    }

    #[test]
    fn later_layers_overwrite_earlier_ones() {
        let dir = TempDir::new().unwrap();
        let base = layer(
            dir.path(),
            "base",
            0,
            &[("server.properties", "motd=base"), ("eula.txt", "eula=true")],
        );
        let flavor = layer(
            dir.path(),
            "flavor",
            10,
            &[("server.properties", "motd=flavor")],
        );
        let merged = dir.path().join("merged");

        // deliberately out of order; orderIndex decides, not position
        merge_layers(&[flavor, base], &merged).unwrap();

        assert_eq!(
            fs::read_to_string(merged.join("server.properties")).unwrap(),
            "motd=flavor"
        );
        assert_eq!(fs::read_to_string(merged.join("eula.txt")).unwrap(), "eula=true");
    }

    #[test]
    fn empty_layer_list_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            merge_layers(&[], &dir.path().join("merged")),
            Err(MergeError::NoLayers)
        ));
    }

    #[test]
    fn duplicate_order_index_is_rejected() {
        let dir = TempDir::new().unwrap();
        let a = layer(dir.path(), "a", 3, &[("x", "1")]);
        let b = layer(dir.path(), "b", 3, &[("y", "2")]);
        assert!(matches!(
            merge_layers(&[a, b], &dir.path().join("merged")),
            Err(MergeError::DuplicateOrderIndex(3))
        ));
    }

    #[test]
    fn merge_resets_residue_from_a_previous_run() {
        let dir = TempDir::new().unwrap();
        let base = layer(dir.path(), "base", 0, &[("fresh.txt", "new")]);
        let merged = dir.path().join("merged");
        fs::create_dir_all(&merged).unwrap();
        fs::write(merged.join("stale.txt"), "old").unwrap();

        merge_layers(&[base], &merged).unwrap();

        assert!(!merged.join("stale.txt").exists());
        assert!(merged.join("fresh.txt").exists());
    }

    #[test]
    fn kind_changes_between_layers_replace_the_old_entry() {
        let dir = TempDir::new().unwrap();
        // "plugins" is a file in the base layer, a directory in the overlay
        let base = layer(dir.path(), "base", 0, &[("plugins", "placeholder")]);
        let overlay = layer(
            dir.path(),
            "overlay",
            1,
            &[("plugins/worldedit.jar", "jar-bytes")],
        );
        let merged = dir.path().join("merged");

        merge_layers(&[base, overlay], &merged).unwrap();

        assert!(merged.join("plugins").is_dir());
        assert_eq!(
            fs::read_to_string(merged.join("plugins/worldedit.jar")).unwrap(),
            "jar-bytes"
        );
    }

    #[test]
    fn directory_gives_way_to_a_file_from_a_later_layer() {
        let dir = TempDir::new().unwrap();
        let base = layer(dir.path(), "base", 0, &[("data/seed.txt", "s")]);
        let overlay = layer(dir.path(), "overlay", 1, &[("data", "flat")]);
        let merged = dir.path().join("merged");

        merge_layers(&[base, overlay], &merged).unwrap();

        assert!(merged.join("data").is_file());
        assert_eq!(fs::read_to_string(merged.join("data")).unwrap(), "flat");
    }

    #[cfg(unix)]
    #[test]
    fn permission_bits_survive_the_copy() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let base = layer(dir.path(), "base", 0, &[("bin/run.sh", "#!/bin/sh\n")]);
        let script = base.contents_dir.join("bin/run.sh");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let merged = dir.path().join("merged");

        merge_layers(&[base], &merged).unwrap();

        let mode = fs::metadata(merged.join("bin/run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn missing_layer_contents_fail_the_merge() {
        let dir = TempDir::new().unwrap();
        let ghost = LayerSource {
            template_id: "ghost".to_string(),
            version: "1.0.0".to_string(),
            order_index: 0,
            contents_dir: dir.path().join("ghost/contents"),
        };
        assert!(matches!(
            merge_layers(&[ghost], &dir.path().join("merged")),
            Err(MergeError::MissingContents { .. })
        ));
    }
}
