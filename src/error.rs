use std::path::PathBuf;

/// error type for layer preparation
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("can't parse sha256 from url {0}")]
    InvalidBlobUrl(String),

    #[error("invalid blob size {value:?} in {path}")]
    InvalidBlobSize {
        path: PathBuf,
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("invalid repo url {reference}: {message}")]
    InvalidImageRef { reference: String, message: String },

    #[error("failed to read config of snapshot {dir}: {source}")]
    ConfigRead {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to unmarshal config {path}: {source}")]
    ConfigDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to marshal config for {path}: {source}")]
    ConfigEncode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to commit the overlaybd config on {path}: {source}")]
    ConfigCommit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("failed to prepare snapshot layer {dir}: {source}")]
    Prepare {
        dir: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("settings error: {0}")]
    Settings(#[from] toml::de::Error),

    #[error("settings serialization error: {0}")]
    SettingsSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// whether the error came out of the layer walk (the snapshot was recognized)
    pub fn is_handled(&self) -> bool {
        matches!(self, Error::Prepare { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
