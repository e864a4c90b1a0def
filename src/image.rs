use std::path::Path;

use crate::error::AgentVirtError;

/// Copy `base` to `disk` unless the disk already exists.
///
/// Returns `true` when a copy was made. The copy goes to a `.part` file first,
/// so an interrupted copy is never mistaken for a finished disk.
pub async fn ensure_disk(base: &Path, disk: &Path) -> Result<bool, AgentVirtError> {
    if disk.exists() {
        tracing::debug!(path = %disk.display(), "reusing existing disk");
        return Ok(false);
    }
    if !base.is_file() {
        return Err(AgentVirtError::BaseImageNotFound {
            path: base.display().to_string(),
        });
    }

    if let Some(parent) = disk.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AgentVirtError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }

    let tmp_path = disk.with_extension("qcow2.part");
    // Remove any stale .part file from an interrupted copy
    let _ = tokio::fs::remove_file(&tmp_path).await;

    tracing::info!(base = %base.display(), disk = %disk.display(), "copying base image");
    if let Err(e) = tokio::fs::copy(base, &tmp_path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(AgentVirtError::Io {
            context: format!("copying {} to {}", base.display(), tmp_path.display()),
            source: e,
        });
    }

    tokio::fs::rename(&tmp_path, disk)
        .await
        .map_err(|e| AgentVirtError::Io {
            context: format!("renaming {} to {}", tmp_path.display(), disk.display()),
            source: e,
        })?;

    Ok(true)
}

/// Create an empty qcow2 image of `size` (e.g. `"40G"`) for a fresh install.
pub async fn create_empty_image(path: &Path, size: &str) -> Result<(), AgentVirtError> {
    if path.exists() {
        return Err(AgentVirtError::BaseImageExists {
            path: path.display().to_string(),
        });
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AgentVirtError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }

    let output = tokio::process::Command::new("qemu-img")
        .args(["create", "-f", "qcow2"])
        .arg(path)
        .arg(size)
        .output()
        .await
        .map_err(|e| AgentVirtError::Io {
            context: "running qemu-img".into(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(AgentVirtError::ExternalCommand {
            command: "qemu-img".into(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    tracing::info!(path = %path.display(), size, "created empty base image");
    Ok(())
}
