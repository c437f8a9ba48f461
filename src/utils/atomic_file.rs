/// Crash-safe JSON side files (temp sibling + fsync + rename)
use std::path::{Path, PathBuf};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::error::{BackfillError, Result};

/// Hidden sibling next to the target so the rename never crosses filesystems
fn temp_sibling(target: &Path) -> Result<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| BackfillError::FileWriteFailed(format!("no file name in {}", target.display())))?
        .to_string_lossy();
    let unique = uuid::Uuid::new_v4().simple().to_string();
    Ok(target.with_file_name(format!(".{}.{}.tmp", name, &unique[..8])))
}

/// Serialize `value` as pretty JSON and atomically replace `target`
pub async fn write_json_atomic<T: Serialize + ?Sized>(target: &Path, value: &T) -> Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let json = serde_json::to_vec_pretty(value)?;
    let temp_path = temp_sibling(target)?;

    let written = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, target).await
    }
    .await;

    if let Err(e) = written {
        error!("Failed to write {}: {}", target.display(), e);
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(BackfillError::FileWriteFailed(format!("{}: {}", target.display(), e)));
    }

    debug!("Wrote {} bytes to {}", json.len(), target.display());
    Ok(())
}
