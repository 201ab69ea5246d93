//! zdfs - overlaybd backing-store config synthesis
//!
//! prepares the per-layer block backend descriptors of a containerd snapshot
//! whose image layers are served from remote blob storage.
//!
//! # Layer layout
//!
//! every snapshot directory may contain:
//!
//! - `fs/`: pulled content; legacy layers keep their meta bundle here
//! - `block/`: block backend working area, holding `config.v1.json`
//! - `zdfsmeta/`: migrated meta bundle and the backend's diagnostic log
//! - `image_ref`: optional image reference overriding the blob repository
//!
//! # Descriptor chain
//!
//! the descriptor of layer N lists the lowers of layer N-1 followed by the
//! blob of layer N. the base layer starts from a fixed commit file.
//!
//! # Example usage
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//! use zdfs::{Config, Preparer, SnapshotInfo, StaticParents};
//!
//! let root = Path::new("/var/lib/containerd/io.containerd.snapshotter.v1.overlaybd");
//! let preparer = Preparer::new(Config::default());
//! let parents = StaticParents::new().with("default/12/sha256:abc", vec!["11".into(), "3".into()]);
//!
//! let sn_path = |id: &str| -> PathBuf { root.join("snapshots").join(id) };
//! let handled = preparer
//!     .prepare_backing_store_spec(
//!         "default/12/sha256:abc",
//!         "12",
//!         &sn_path("12"),
//!         &SnapshotInfo::default(),
//!         &parents,
//!         sn_path,
//!     )
//!     .unwrap();
//! ```

mod atomic;
mod config;
mod error;
mod prepare;

pub mod blob;
pub mod descriptor;
pub mod layout;
pub mod migrate;
pub mod probe;
pub mod snapshot;

pub use blob::{blob_repo_digest, blob_size, image_blob_url, locate_blob, BlobRef};
pub use config::{Config, DEFAULT_BASE_LAYER, DEFAULT_RESULT_FILE};
pub use descriptor::{BackingStoreConfig, Lower, Upper};
pub use error::{Error, Result};
pub use layout::LayerDir;
pub use migrate::{copy_meta_files, migrate_layer, StagedMeta};
pub use prepare::{PrepareGuard, Preparer};
pub use probe::{is_overlaybd_layer, path_presence, Presence};
pub use snapshot::{Kind, ParentResolver, SnapshotInfo, StaticParents};
