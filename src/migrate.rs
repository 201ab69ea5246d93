//! migration of legacy meta files out of the pulled content
//!
//! legacy layers keep their meta bundle under `fs/`. migration copies the
//! bundle into `block/` for the block backend and into `zdfsmeta/`, which is
//! populated in a staging dir and renamed into place as the last step.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::atomic::rename_dir;
use crate::error::{IoResultExt, Result};
use crate::layout::{LayerDir, MIGRATED_BUNDLE, STAGING_PREFIX};
use crate::probe::path_presence;

/// copy the meta bundle from `src_dir` to `dst_dir`, skipping absent files
///
/// returns the number of files copied.
pub fn copy_meta_files(src_dir: &Path, dst_dir: &Path) -> Result<usize> {
    let mut copied = 0;
    for name in MIGRATED_BUNDLE {
        let src_path = src_dir.join(name);
        if !path_presence(&src_path)?.is_present() {
            continue;
        }

        let data = fs::read(&src_path).with_path(&src_path).inspect_err(|e| {
            error!(src = %src_dir.display(), dst = %dst_dir.display(), file = name, "read failed: {}", e);
        })?;

        let dst_path = dst_dir.join(name);
        fs::write(&dst_path, data).with_path(&dst_path).inspect_err(|e| {
            error!(src = %src_dir.display(), dst = %dst_dir.display(), file = name, "write failed: {}", e);
        })?;
        copied += 1;
    }
    Ok(copied)
}

/// meta files copied into a staging dir, not yet visible as `zdfsmeta`
///
/// dropping a stage without committing leaves the staging dir behind, the
/// same state a crash mid-migration would leave.
#[derive(Debug)]
pub struct StagedMeta {
    path: PathBuf,
    target: PathBuf,
}

impl StagedMeta {
    /// create a staging dir inside `layer` and copy the bundle into it
    pub fn stage(layer: &LayerDir) -> Result<Self> {
        let path = layer.path().join(format!(
            "{}{}",
            STAGING_PREFIX,
            uuid::Uuid::new_v4().simple()
        ));
        fs::create_dir(&path).with_path(&path)?;

        if let Err(e) = copy_meta_files(&layer.fs_path(), &path) {
            if let Err(cleanup) = fs::remove_dir_all(&path) {
                warn!(path = %path.display(), "failed to remove staging dir: {}", cleanup);
            }
            return Err(e);
        }

        Ok(Self {
            path,
            target: layer.meta_path(),
        })
    }

    /// staging dir path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// publish the staged files as the layer's meta dir
    pub fn commit(self) -> Result<PathBuf> {
        rename_dir(&self.path, &self.target)?;
        Ok(self.target)
    }
}

/// remove staging dirs left by interrupted migrations
///
/// must only run while the preparation lock is held.
pub fn sweep_stale_staging(layer: &LayerDir) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(layer.path()).with_path(layer.path())? {
        let entry = entry.with_path(layer.path())?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(STAGING_PREFIX) {
            continue;
        }

        let path = entry.path();
        if !entry.file_type().with_path(&path)?.is_dir() {
            continue;
        }
        warn!(path = %path.display(), "removing stale staging dir");
        fs::remove_dir_all(&path).with_path(&path)?;
        removed += 1;
    }
    Ok(removed)
}

/// migrate a legacy layer: stage meta, copy into `block/`, publish `zdfsmeta`
///
/// `block/` is normally created by the snapshotter and is only created here
/// when missing. existing files in it are kept. the layer dir itself is never
/// created or removed.
pub fn migrate_layer(layer: &LayerDir) -> Result<()> {
    info!(dir = %layer.path().display(), "migrating legacy meta files");

    sweep_stale_staging(layer)?;
    let staged = StagedMeta::stage(layer)?;

    let block_dir = layer.block_path();
    fs::create_dir_all(&block_dir).with_path(&block_dir)?;
    copy_meta_files(&layer.fs_path(), &block_dir)?;

    staged.commit()?;
    Ok(())
}
