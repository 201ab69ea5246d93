//! remote blob location of a layer

use std::fs;
use std::path::Path;

use oci_client::Reference;
use tracing::info;

use crate::error::{Error, IoResultExt, Result};
use crate::layout::{LayerDir, BLOB_SIZE_FILE, BLOB_URL_FILE};
use crate::probe::path_presence;

/// digest algorithm prefix expected at the end of a blob url
pub const DIGEST_PREFIX: &str = "sha256";

/// where a layer blob lives and how large it is
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobRef {
    /// blob listing base url, e.g. `https://host/v2/repo/blobs`
    pub repo_url: String,
    /// content digest, e.g. `sha256:...`
    pub digest: String,
    pub size: u64,
}

fn read_trimmed(path: &Path) -> Result<String> {
    let data = fs::read_to_string(path).with_path(path)?;
    Ok(data.trim().to_string())
}

/// split the blob url file in `dir` into (repo url, digest)
///
/// both parts must be non-empty and the digest must start with `sha256`.
pub fn blob_repo_digest(dir: &Path) -> Result<(String, String)> {
    let url = read_trimmed(&dir.join(BLOB_URL_FILE))?;

    let Some((repo, digest)) = url.rsplit_once('/') else {
        return Err(Error::InvalidBlobUrl(url));
    };
    if repo.is_empty() || !digest.starts_with(DIGEST_PREFIX) {
        return Err(Error::InvalidBlobUrl(url));
    }

    Ok((repo.to_string(), digest.to_string()))
}

/// read the blob size file in `dir`
pub fn blob_size(dir: &Path) -> Result<u64> {
    let path = dir.join(BLOB_SIZE_FILE);
    let value = read_trimmed(&path)?;
    value
        .parse::<u64>()
        .map_err(|source| Error::InvalidBlobSize {
            path,
            value,
            source,
        })
}

/// blob listing url for the repository named by an image reference
///
/// tags and digests are dropped; references without a registry resolve to
/// the default domain.
pub fn image_blob_url(reference: &str) -> Result<String> {
    let parsed = reference
        .parse::<Reference>()
        .map_err(|e| Error::InvalidImageRef {
            reference: reference.to_string(),
            message: e.to_string(),
        })?;

    Ok(format!(
        "https://{}/v2/{}/blobs",
        parsed.registry(),
        parsed.repository()
    ))
}

/// image reference stored next to the layer, if any
pub fn read_image_ref(layer: &LayerDir) -> Result<Option<String>> {
    let path = layer.image_ref_path();
    if !path_presence(&path)?.is_present() {
        return Ok(None);
    }
    let data = fs::read_to_string(&path).with_path(&path)?;
    Ok(Some(data.trim().to_string()))
}

/// resolve the blob of a migrated layer
///
/// digest and size come from the meta files under `block/`; the repository
/// url is recomputed from the image reference override when one exists.
pub fn locate_blob(layer: &LayerDir) -> Result<BlobRef> {
    let block_dir = layer.block_path();
    let (mut repo_url, digest) = blob_repo_digest(&block_dir)?;

    if let Some(image_ref) = read_image_ref(layer)? {
        info!(image_ref = %image_ref, "read image ref override");
        repo_url = image_blob_url(&image_ref)?;
    }
    info!(repo_blob_url = %repo_url, "construct repoBlobUrl");

    let size = blob_size(&block_dir)?;
    Ok(BlobRef {
        repo_url,
        digest,
        size,
    })
}
