use std::path::{Path, PathBuf};

/// meta dir holding the migrated image meta files
pub const META_DIR: &str = "zdfsmeta";
/// pulled layer content
pub const FS_DIR: &str = "fs";
/// block backend working area
pub const BLOCK_DIR: &str = "block";
/// backing-store descriptor, inside the block dir
pub const CONFIG_FILE: &str = "config.v1.json";
/// optional image reference override
pub const IMAGE_REF_FILE: &str = "image_ref";
/// prefix of the staging dir used while migrating meta files
pub const STAGING_PREFIX: &str = "temp_for_prepare_dadimeta";

/// characteristic file of a dadi layer
pub const FORMAT_MARKER: &str = ".aaaaaaaaaaaaaaaa.lsmt";
/// per-layer checksum data
pub const CHECKSUM_FILE: &str = ".checksum_file";
/// remote address of the layer blob
pub const BLOB_URL_FILE: &str = ".oss_url";
/// size of the layer blob
pub const BLOB_SIZE_FILE: &str = ".data_size";
/// layer type (layern, commit, oss)
pub const BLOB_TYPE_FILE: &str = ".type";
/// access trace, optional
pub const TRACE_FILE: &str = ".trace";

/// files that must all be present for a legacy layer
pub const REQUIRED_BUNDLE: [&str; 5] = [
    FORMAT_MARKER,
    CHECKSUM_FILE,
    BLOB_URL_FILE,
    BLOB_SIZE_FILE,
    BLOB_TYPE_FILE,
];

/// files carried over by migration
pub const MIGRATED_BUNDLE: [&str; 6] = [
    FORMAT_MARKER,
    CHECKSUM_FILE,
    BLOB_URL_FILE,
    BLOB_SIZE_FILE,
    BLOB_TYPE_FILE,
    TRACE_FILE,
];

/// one snapshot directory (image layer or active layer)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerDir {
    path: PathBuf,
}

impl LayerDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// layer root path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// path to pulled content
    pub fn fs_path(&self) -> PathBuf {
        self.path.join(FS_DIR)
    }

    /// path to block backend dir
    pub fn block_path(&self) -> PathBuf {
        self.path.join(BLOCK_DIR)
    }

    /// path to migrated meta dir
    pub fn meta_path(&self) -> PathBuf {
        self.path.join(META_DIR)
    }

    /// path to the backing-store descriptor
    pub fn config_path(&self) -> PathBuf {
        self.block_path().join(CONFIG_FILE)
    }

    /// path to the diagnostic log named `name` under the meta dir
    pub fn result_file(&self, name: &str) -> PathBuf {
        self.meta_path().join(name)
    }

    /// path to the image reference override
    pub fn image_ref_path(&self) -> PathBuf {
        self.path.join(IMAGE_REF_FILE)
    }
}

impl From<&Path> for LayerDir {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for LayerDir {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}
