//! overlaybd backing-store descriptor (`block/config.v1.json`)
//!
//! each layer's descriptor lists every lower blob from the base layer up to
//! and including the layer itself. a child inherits its parent's `lowers`
//! verbatim and appends one entry of its own.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::atomic;
use crate::error::{Error, Result};
use crate::layout::LayerDir;

/// descriptor file mode
pub const CONFIG_MODE: u32 = 0o600;

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// one lower layer of the chain
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lower {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gzip_index: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_digest: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,
}

impl Lower {
    /// entry pointing at a local commit file
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            file: path.into(),
            ..Default::default()
        }
    }

    /// entry for a remote blob cached in `dir`
    pub fn blob(digest: impl Into<String>, size: i64, dir: impl Into<String>) -> Self {
        Self {
            digest: digest.into(),
            size,
            dir: dir.into(),
            ..Default::default()
        }
    }
}

/// writable layer of the chain
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upper {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub index: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gzip_index: String,
}

/// backing-store descriptor of one layer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackingStoreConfig {
    #[serde(default)]
    pub repo_blob_url: String,
    #[serde(default)]
    pub lowers: Vec<Lower>,
    /// always written, as `{}` when unset
    #[serde(default)]
    pub upper: Upper,
    #[serde(default)]
    pub result_file: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub acceleration_layer: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub record_trace_path: String,
}

/// read the descriptor of `layer`
pub fn load(layer: &LayerDir) -> Result<BackingStoreConfig> {
    let path = layer.config_path();
    let data = fs::read(&path).map_err(|source| Error::ConfigRead {
        dir: layer.path().to_path_buf(),
        source,
    })?;

    serde_json::from_slice(&data).map_err(|source| Error::ConfigDecode { path, source })
}

/// persist the descriptor of `layer` atomically
pub fn atomic_write(layer: &LayerDir, config: &BackingStoreConfig) -> Result<()> {
    let path = layer.config_path();
    let data = serde_json::to_vec(config).map_err(|source| Error::ConfigEncode {
        path: path.clone(),
        source,
    })?;

    atomic::write_file(&path, &data, CONFIG_MODE)
        .map_err(|source| Error::ConfigCommit { path, source })
}

/// inputs for a fresh descriptor
#[derive(Clone, Debug)]
pub struct ConstructOptions<'a> {
    /// parent layer; `None` for the base layer
    pub parent: Option<&'a LayerDir>,
    /// blob listing url; empty inherits the parent's
    pub repo_url: &'a str,
    pub digest: &'a str,
    pub size: u64,
    pub record_trace_path: &'a str,
    /// first lower of a base layer
    pub base_layer: &'a Path,
    /// diagnostic log name under the meta dir
    pub result_file_name: &'a str,
}

/// build and write the descriptor of `layer` on top of its parent's chain
pub fn construct(layer: &LayerDir, opts: &ConstructOptions<'_>) -> Result<BackingStoreConfig> {
    let mut config = BackingStoreConfig {
        repo_blob_url: opts.repo_url.to_string(),
        result_file: layer
            .result_file(opts.result_file_name)
            .to_string_lossy()
            .into_owned(),
        record_trace_path: opts.record_trace_path.to_string(),
        ..Default::default()
    };

    match opts.parent {
        None => {
            config
                .lowers
                .push(Lower::file(opts.base_layer.to_string_lossy()));
        }
        Some(parent) => {
            let parent_config = load(parent)?;
            if config.repo_blob_url.is_empty() {
                config.repo_blob_url = parent_config.repo_blob_url;
            }
            config.lowers = parent_config.lowers;
        }
    }

    // sizes are carried as int64 in the descriptor
    let size = i64::try_from(opts.size).unwrap_or(i64::MAX);
    config.lowers.push(Lower::blob(
        opts.digest,
        size,
        layer.block_path().to_string_lossy(),
    ));

    info!(
        dir = %layer.path().display(),
        lowers = config.lowers.len(),
        "writing backing-store config"
    );
    atomic_write(layer, &config)?;
    Ok(config)
}

/// set the trace path of an existing descriptor
///
/// returns whether the descriptor was rewritten.
pub fn update(layer: &LayerDir, record_trace_path: &str) -> Result<bool> {
    let mut config = load(layer)?;
    if config.record_trace_path == record_trace_path {
        debug!(dir = %layer.path().display(), "backing-store config up to date");
        return Ok(false);
    }

    config.record_trace_path = record_trace_path.to_string();
    atomic_write(layer, &config)?;
    Ok(true)
}
