//! Timestamped copies of the store artifacts.

use crate::store::StorePaths;
use std::path::{Path, PathBuf};

/// Copy whichever store artifacts exist into `dest_dir`, creating it if
/// needed. Returns the paths written.
///
/// Names follow `faces_data_backup_<YYYYmmdd_HHMMSS>.bin` and
/// `face_model_backup_<YYYYmmdd_HHMMSS>.bin` in local time.
pub fn export_backup(paths: &StorePaths, dest_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    std::fs::create_dir_all(dest_dir)?;

    let mut written = Vec::new();
    for (src, stem) in [(&paths.data, "faces_data"), (&paths.model, "face_model")] {
        if !src.exists() {
            tracing::debug!(path = %src.display(), "backup: artifact absent, skipped");
            continue;
        }
        let dest = dest_dir.join(format!("{stem}_backup_{stamp}.bin"));
        std::fs::copy(src, &dest)?;
        written.push(dest);
    }

    tracing::info!(dest = %dest_dir.display(), files = written.len(), "backup exported");
    Ok(written)
}
