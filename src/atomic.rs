//! crash-safe file and directory replacement

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, Result};

/// sync a directory to disk
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}

/// unique sibling name for staging `path`
pub fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}", name, uuid::Uuid::new_v4().simple()))
}

/// replace `path` with `data`: temp -> fsync -> rename -> fsync parent
///
/// readers observe either the old content or the new one, never a mix.
pub fn write_file(path: &Path, data: &[u8], mode: u32) -> std::io::Result<()> {
    let tmp_path = temp_sibling(path);
    let written = (|| {
        let mut tmp_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&tmp_path)?;
        tmp_file.write_all(data)?;
        tmp_file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// rename a fully populated directory into place and persist the rename
pub fn rename_dir(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).with_path(to)?;
    if let Some(parent) = to.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}
