use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};

/// Base directory for all slimbox state.
/// Defaults to `~/.slimbox` but can be overridden with `SLIMBOX_STATE_DIR`.
pub fn base_dir() -> PathBuf {
    static BASE_DIR: OnceLock<PathBuf> = OnceLock::new();

    BASE_DIR
        .get_or_init(|| {
            let default = "~/.slimbox".to_string();
            let configured = std::env::var("SLIMBOX_STATE_DIR").unwrap_or(default);
            PathBuf::from(shellexpand::tilde(&configured).as_ref())
        })
        .clone()
}

/// Directory holding per-image state trees
pub fn images_dir(state_path: &str) -> PathBuf {
    if state_path.is_empty() {
        base_dir().join("images")
    } else {
        PathBuf::from(shellexpand::tilde(state_path).as_ref()).join("images")
    }
}

/// Per-image state layout, created before the container runs.
///
/// The volume directory is bind-mounted into the target container for the
/// sensor; the artifacts directory is where the harvested data and the
/// generated Dockerfile/profiles end up on the host side.
#[derive(Debug, Clone)]
pub struct ImageStateDirs {
    /// Mounted into the container at the sensor mount point
    pub volume: PathBuf,
    /// Host-side processed artifacts (creport, files tree, Dockerfile, profiles)
    pub artifacts: PathBuf,
    /// Root of this image's state tree
    pub root: PathBuf,
}

/// Create the state directories for one image and return their paths.
pub fn prepare_image_state_dirs(state_path: &str, image_id: &str) -> Result<ImageStateDirs> {
    // image ids look like "sha256:abcd..."; strip the algorithm prefix for the dir name
    let dir_name = image_id.split(':').next_back().unwrap_or(image_id);
    let root = images_dir(state_path).join(dir_name);

    let dirs = ImageStateDirs {
        volume: root.join("volume"),
        artifacts: root.join("artifacts"),
        root,
    };

    std::fs::create_dir_all(&dirs.volume)
        .with_context(|| format!("creating sensor volume directory {}", dirs.volume.display()))?;
    std::fs::create_dir_all(&dirs.artifacts).with_context(|| {
        format!("creating artifacts directory {}", dirs.artifacts.display())
    })?;

    Ok(dirs)
}

/// Location of the sensor payload staged into the container volume.
pub fn sensor_mount_point() -> &'static str {
    "/opt/slimbox"
}

/// Copy one file into a directory, keeping its name.
pub fn copy_into(file: &Path, dest_dir: &Path) -> Result<()> {
    let name = file
        .file_name()
        .with_context(|| format!("no file name in {}", file.display()))?;
    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("creating {}", dest_dir.display()))?;
    std::fs::copy(file, dest_dir.join(name))
        .with_context(|| format!("copying {} to {}", file.display(), dest_dir.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_image_state_dirs() {
        let temp = TempDir::new().unwrap();
        let state = temp.path().to_str().unwrap();

        let dirs = prepare_image_state_dirs(state, "sha256:0123abcd").unwrap();

        assert!(dirs.volume.is_dir());
        assert!(dirs.artifacts.is_dir());
        assert!(dirs.root.ends_with("0123abcd"));
        assert!(dirs.root.starts_with(temp.path()));
    }

    #[test]
    fn test_copy_into() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("creport.json");
        std::fs::write(&src, b"{}").unwrap();

        let dest = temp.path().join("meta");
        copy_into(&src, &dest).unwrap();

        assert!(dest.join("creport.json").is_file());
    }
}
