//! layer format detection
//!
//! a layer is recognized when it already carries a descriptor under `block/`,
//! or when its pulled content still holds the full legacy meta bundle.

use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::layout::{LayerDir, REQUIRED_BUNDLE};

/// result of inspecting a path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
}

impl Presence {
    pub fn is_present(self) -> bool {
        self == Presence::Present
    }
}

/// stat a path, separating "does not exist" from "could not inspect"
pub fn path_presence(path: &Path) -> Result<Presence> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(Presence::Present),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Presence::Absent),
        Err(source) => Err(Error::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// check that every required legacy meta file exists in `dir`
pub fn has_blob_ref(dir: &Path) -> Result<bool> {
    for name in REQUIRED_BUNDLE {
        let full_path = dir.join(name);
        if !path_presence(&full_path)?.is_present() {
            debug!(path = %full_path.display(), "legacy meta file missing");
            return Ok(false);
        }
    }
    Ok(true)
}

/// whether `layer` belongs to the overlaybd layer family
pub fn is_overlaybd_layer(layer: &LayerDir) -> Result<bool> {
    if path_presence(&layer.config_path())?.is_present() {
        return Ok(true);
    }

    has_blob_ref(&layer.fs_path()).inspect_err(|e| {
        error!(dir = %layer.path().display(), "failed to inspect legacy meta files: {}", e);
    })
}
