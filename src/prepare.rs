//! snapshot preparation: walks a snapshot's layers from the base up and
//! makes sure each one carries a backing-store descriptor chained to its
//! parent's.
//!
//! per layer:
//! - `zdfsmeta/` and descriptor present: confirm the trace path only
//! - `zdfsmeta/` present, descriptor missing: build the descriptor
//! - descriptor present without `zdfsmeta/`: native layer, nothing to do
//! - otherwise: migrate the legacy meta files, then build the descriptor
//!
//! the whole walk runs under one lock so snapshots sharing ancestors never
//! mutate the same layer concurrently.

use std::fs::{File, OpenOptions};
use std::iter;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, error, info, info_span};

use crate::blob::locate_blob;
use crate::config::Config;
use crate::descriptor::{self, ConstructOptions};
use crate::error::{Error, IoResultExt, Result};
use crate::layout::LayerDir;
use crate::migrate::migrate_layer;
use crate::probe::{is_overlaybd_layer, path_presence};
use crate::snapshot::{ParentResolver, SnapshotInfo};

/// prepares overlaybd layer chains, one snapshot at a time
pub struct Preparer {
    config: Config,
    serial: Mutex<()>,
}

/// guard that holds the preparation lock until dropped
pub struct PrepareGuard<'a> {
    #[allow(dead_code)]
    serial: MutexGuard<'a, ()>,
    #[allow(dead_code)]
    flock: Option<Flock<File>>,
}
// both locks are released automatically on drop

impl Preparer {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            serial: Mutex::new(()),
        }
    }

    /// preparation settings
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// acquire the preparation lock, blocking until it is free
    ///
    /// serializes callers in this process and, when `lock_file` is
    /// configured, across processes.
    pub fn lock(&self) -> Result<PrepareGuard<'_>> {
        // guarded state is on disk, poisoning carries no information
        let serial = self.serial.lock().unwrap_or_else(PoisonError::into_inner);

        let flock = match &self.config.lock_file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(path)
                    .with_path(path)?;
                let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, source)| {
                    Error::Lock {
                        path: path.clone(),
                        source,
                    }
                })?;
                Some(flock)
            }
            None => None,
        };

        Ok(PrepareGuard { serial, flock })
    }

    /// make sure every layer of snapshot `key` has a backing-store descriptor
    ///
    /// `dir` is probed to decide whether the snapshot is an overlaybd one;
    /// `Ok(false)` means it is not and the caller should fall back to its
    /// default handling. the walk covers the ancestors of `key`, oldest first,
    /// then the layer of `id`. failures during the walk come back as
    /// [`Error::Prepare`].
    pub fn prepare_backing_store_spec<R, P>(
        &self,
        key: &str,
        id: &str,
        dir: &Path,
        info: &SnapshotInfo,
        resolver: &R,
        sn_path: P,
    ) -> Result<bool>
    where
        R: ParentResolver + ?Sized,
        P: Fn(&str) -> PathBuf,
    {
        let _span = info_span!("prepare", key, id, snapshot = %info.name, kind = ?info.kind)
            .entered();

        if !is_overlaybd_layer(&LayerDir::new(dir))? {
            debug!(dir = %dir.display(), "not an overlaybd layer");
            return Ok(false);
        }

        let _guard = self.lock()?;

        let active = LayerDir::new(sn_path(id));
        let parent_ids = resolver.parent_ids(key).map_err(|e| Error::Prepare {
            dir: active.path().to_path_buf(),
            source: Box::new(e),
        })?;
        let lowers: Vec<LayerDir> = parent_ids
            .iter()
            .rev()
            .map(|id| LayerDir::new(sn_path(id)))
            .collect();

        let mut parent = None;
        for layer in lowers.iter().chain(iter::once(&active)) {
            if let Err(e) = self.prepare_layer(layer, parent) {
                error!(dir = %layer.path().display(), "failed to prepare layer: {}", e);
                return Err(Error::Prepare {
                    dir: layer.path().to_path_buf(),
                    source: Box::new(e),
                });
            }
            parent = Some(layer);
        }

        Ok(true)
    }

    /// bring one layer up to date; `parent` is the previous layer of the walk
    fn prepare_layer(&self, layer: &LayerDir, parent: Option<&LayerDir>) -> Result<()> {
        info!(
            dir = %layer.path().display(),
            parent = %parent.map(|p| p.path().display().to_string()).unwrap_or_default(),
            "prepare layer"
        );

        let config_path = layer.config_path();
        if path_presence(&layer.meta_path())?.is_present() {
            if path_presence(&config_path)?.is_present() {
                debug!(path = %config_path.display(), "config already created");
                descriptor::update(layer, &self.config.record_trace_path)?;
                return Ok(());
            }
            // early pulled layers were migrated before descriptors existed
            return self.make_config(layer, parent);
        }

        if path_presence(&config_path)?.is_present() {
            debug!(path = %config_path.display(), "native overlaybd layer");
            return Ok(());
        }

        migrate_layer(layer)?;
        self.make_config(layer, parent)
    }

    fn make_config(&self, layer: &LayerDir, parent: Option<&LayerDir>) -> Result<()> {
        let blob = locate_blob(layer)?;
        descriptor::construct(
            layer,
            &ConstructOptions {
                parent,
                repo_url: &blob.repo_url,
                digest: &blob.digest,
                size: blob.size,
                record_trace_path: &self.config.record_trace_path,
                base_layer: &self.config.base_layer,
                result_file_name: &self.config.result_file_name,
            },
        )?;
        Ok(())
    }
}

impl Default for Preparer {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BASE_LAYER;
    use crate::descriptor::{load, Lower};
    use crate::layout::{
        BLOB_SIZE_FILE, BLOB_URL_FILE, FORMAT_MARKER, REQUIRED_BUNDLE, STAGING_PREFIX,
    };
    use crate::snapshot::StaticParents;
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const REPO: &str = "https://registry.example.com/v2/team/app/blobs";

    fn digest(n: u8) -> String {
        format!("sha256:{}", format!("{n:02x}").repeat(32))
    }

    /// snapshotter root with one dir per snapshot id
    struct Fixture {
        root: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                root: tempdir().unwrap(),
            }
        }

        fn path(&self, id: &str) -> PathBuf {
            self.root.path().join("snapshots").join(id)
        }

        fn layer(&self, id: &str) -> LayerDir {
            LayerDir::new(self.path(id))
        }

        /// legacy layer with its meta bundle still under fs/
        fn legacy(&self, id: &str, n: u8, size: u64) -> LayerDir {
            let layer = self.layer(id);
            fs::create_dir_all(layer.fs_path()).unwrap();
            for name in REQUIRED_BUNDLE {
                fs::write(layer.fs_path().join(name), b"").unwrap();
            }
            fs::write(
                layer.fs_path().join(BLOB_URL_FILE),
                format!("{REPO}/{}\n", digest(n)),
            )
            .unwrap();
            fs::write(layer.fs_path().join(BLOB_SIZE_FILE), format!("{size}\n")).unwrap();
            layer
        }

        fn sn_path(&self) -> impl Fn(&str) -> PathBuf + '_ {
            move |id: &str| self.path(id)
        }

        fn prepare(
            &self,
            preparer: &Preparer,
            parents: &StaticParents,
            key: &str,
            id: &str,
        ) -> Result<bool> {
            preparer.prepare_backing_store_spec(
                key,
                id,
                &self.path(id),
                &SnapshotInfo {
                    name: key.to_string(),
                    ..Default::default()
                },
                parents,
                self.sn_path(),
            )
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn block_dir(layer: &LayerDir) -> String {
        layer.block_path().to_string_lossy().into_owned()
    }

    #[test]
    fn test_not_applicable() {
        let fx = Fixture::new();
        let layer = fx.layer("1");
        fs::create_dir_all(layer.fs_path()).unwrap();
        let parents = StaticParents::new().with("k", vec![]);

        let handled = fx.prepare(&Preparer::default(), &parents, "k", "1").unwrap();

        assert!(!handled);
        assert!(!layer.meta_path().exists());
        assert!(!layer.block_path().exists());
    }

    #[test]
    fn test_not_applicable_skips_resolver() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.layer("1").fs_path()).unwrap();

        // unknown key: the resolver would fail if consulted
        let handled = fx
            .prepare(&Preparer::default(), &StaticParents::new(), "k", "1")
            .unwrap();
        assert!(!handled);
    }

    #[test]
    fn test_single_base_layer() {
        let fx = Fixture::new();
        let base = fx.legacy("1", 1, 100);
        let parents = StaticParents::new().with("k", vec![]);

        assert!(fx.prepare(&Preparer::default(), &parents, "k", "1").unwrap());

        let config = load(&base).unwrap();
        assert_eq!(config.repo_blob_url, REPO);
        assert_eq!(
            config.lowers,
            vec![
                Lower::file(DEFAULT_BASE_LAYER),
                Lower::blob(digest(1), 100, block_dir(&base)),
            ]
        );
        assert!(base.meta_path().join(FORMAT_MARKER).is_file());
        assert!(base.block_path().join(FORMAT_MARKER).is_file());
    }

    #[test]
    fn test_two_layer_chain() {
        let fx = Fixture::new();
        let base = fx.legacy("1", 0, 100);
        let child = fx.legacy("2", 1, 200);
        let parents = StaticParents::new().with("k", ids(&["1"]));

        assert!(fx.prepare(&Preparer::default(), &parents, "k", "2").unwrap());

        assert_eq!(
            load(&child).unwrap().lowers,
            vec![
                Lower::file(DEFAULT_BASE_LAYER),
                Lower::blob(digest(0), 100, block_dir(&base)),
                Lower::blob(digest(1), 200, block_dir(&child)),
            ]
        );
    }

    #[test]
    fn test_parents_walked_oldest_first() {
        let fx = Fixture::new();
        let l1 = fx.legacy("1", 1, 10);
        let l2 = fx.legacy("2", 2, 20);
        let l3 = fx.legacy("3", 3, 30);
        let active = fx.legacy("4", 4, 40);
        // immediate parent first, as the snapshotter reports them
        let parents = StaticParents::new().with("k", ids(&["3", "2", "1"]));

        assert!(fx.prepare(&Preparer::default(), &parents, "k", "4").unwrap());

        let lowers = load(&active).unwrap().lowers;
        let dirs: Vec<&str> = lowers.iter().skip(1).map(|l| l.dir.as_str()).collect();
        assert_eq!(
            dirs,
            vec![
                block_dir(&l1),
                block_dir(&l2),
                block_dir(&l3),
                block_dir(&active)
            ]
        );
        assert_eq!(load(&l2).unwrap().lowers.len(), 3);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let fx = Fixture::new();
        let base = fx.legacy("1", 0, 100);
        let child = fx.legacy("2", 1, 200);
        let parents = StaticParents::new().with("k", ids(&["1"]));
        let preparer = Preparer::default();

        fx.prepare(&preparer, &parents, "k", "2").unwrap();
        let base_before = fs::read(base.config_path()).unwrap();
        let child_before = fs::read(child.config_path()).unwrap();
        let inode_before = fs::metadata(child.config_path()).unwrap().ino();

        assert!(fx.prepare(&preparer, &parents, "k", "2").unwrap());

        assert_eq!(fs::read(base.config_path()).unwrap(), base_before);
        assert_eq!(fs::read(child.config_path()).unwrap(), child_before);
        // no rewrite happened
        assert_eq!(fs::metadata(child.config_path()).unwrap().ino(), inode_before);
    }

    #[test]
    fn test_meta_dir_without_config_is_synthesized() {
        let fx = Fixture::new();
        let base = fx.legacy("1", 0, 100);
        let parents = StaticParents::new().with("k", vec![]);

        // migrated by an older release: meta in place, no descriptor
        migrate_layer(&base).unwrap();
        let meta_inode = fs::metadata(base.meta_path()).unwrap().ino();

        // a re-migration would pick this up
        fs::write(
            base.fs_path().join(BLOB_URL_FILE),
            format!("{REPO}/{}", digest(7)),
        )
        .unwrap();

        assert!(fx.prepare(&Preparer::default(), &parents, "k", "1").unwrap());

        assert_eq!(load(&base).unwrap().lowers[1].digest, digest(0));
        assert_eq!(fs::metadata(base.meta_path()).unwrap().ino(), meta_inode);
    }

    #[test]
    fn test_native_layer_untouched() {
        let fx = Fixture::new();
        let native = fx.layer("1");
        fs::create_dir_all(native.block_path()).unwrap();
        let native_config = descriptor::BackingStoreConfig {
            repo_blob_url: REPO.to_string(),
            lowers: vec![
                Lower::file(DEFAULT_BASE_LAYER),
                Lower::blob(digest(9), 900, block_dir(&native)),
            ],
            ..Default::default()
        };
        descriptor::atomic_write(&native, &native_config).unwrap();
        let child = fx.legacy("2", 1, 200);
        let parents = StaticParents::new().with("k", ids(&["1"]));

        assert!(fx.prepare(&Preparer::default(), &parents, "k", "2").unwrap());

        assert!(!native.meta_path().exists());
        assert_eq!(load(&native).unwrap(), native_config);
        assert_eq!(
            load(&child).unwrap().lowers[1],
            Lower::blob(digest(9), 900, block_dir(&native))
        );
    }

    #[test]
    fn test_image_ref_override() {
        let fx = Fixture::new();
        let base = fx.legacy("1", 0, 100);
        fs::write(base.image_ref_path(), "mirror.example.org/other/app:v1").unwrap();
        let parents = StaticParents::new().with("k", vec![]);

        fx.prepare(&Preparer::default(), &parents, "k", "1").unwrap();

        assert_eq!(
            load(&base).unwrap().repo_blob_url,
            "https://mirror.example.org/v2/other/app/blobs"
        );
    }

    #[test]
    fn test_failure_is_handled() {
        let fx = Fixture::new();
        let base = fx.legacy("1", 0, 100);
        let child = fx.legacy("2", 1, 200);
        fs::write(child.fs_path().join(BLOB_URL_FILE), format!("{REPO}/md5:00")).unwrap();
        let parents = StaticParents::new().with("k", ids(&["1"]));

        let err = fx
            .prepare(&Preparer::default(), &parents, "k", "2")
            .unwrap_err();

        assert!(err.is_handled());
        match &err {
            Error::Prepare { dir, source } => {
                assert_eq!(dir, child.path());
                assert!(matches!(**source, Error::InvalidBlobUrl(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // the base layer was completed before the failure
        assert!(base.config_path().is_file());
        assert!(!child.config_path().exists());
    }

    #[test]
    fn test_unknown_snapshot_is_handled() {
        let fx = Fixture::new();
        fx.legacy("1", 0, 100);

        let err = fx
            .prepare(&Preparer::default(), &StaticParents::new(), "k", "1")
            .unwrap_err();
        assert!(err.is_handled());
    }

    #[test]
    fn test_probe_failure_is_not_handled() {
        let fx = Fixture::new();
        let layer = fx.layer("1");
        fs::create_dir_all(layer.path()).unwrap();
        fs::write(layer.fs_path(), b"not a dir").unwrap();
        let parents = StaticParents::new().with("k", vec![]);

        let err = fx
            .prepare(&Preparer::default(), &parents, "k", "1")
            .unwrap_err();
        assert!(!err.is_handled());
    }

    #[test]
    fn test_interrupted_migration_recovers() {
        let fx = Fixture::new();
        let base = fx.legacy("1", 0, 100);
        drop(crate::migrate::StagedMeta::stage(&base).unwrap());
        assert!(!base.meta_path().exists());
        let parents = StaticParents::new().with("k", vec![]);

        assert!(fx.prepare(&Preparer::default(), &parents, "k", "1").unwrap());

        assert!(base.meta_path().is_dir());
        let leftovers = fs::read_dir(base.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(STAGING_PREFIX)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_record_trace_path_from_config() {
        let fx = Fixture::new();
        let base = fx.legacy("1", 0, 100);
        let parents = StaticParents::new().with("k", vec![]);
        let preparer = Preparer::new(Config {
            record_trace_path: "/var/trace/app".to_string(),
            ..Default::default()
        });

        fx.prepare(&preparer, &parents, "k", "1").unwrap();
        assert_eq!(load(&base).unwrap().record_trace_path, "/var/trace/app");

        // default settings confirm with an empty trace path
        fx.prepare(&Preparer::default(), &parents, "k", "1").unwrap();
        assert!(load(&base).unwrap().record_trace_path.is_empty());
    }

    #[test]
    fn test_lock_file() {
        let fx = Fixture::new();
        let base = fx.legacy("1", 0, 100);
        let lock_file = fx.root.path().join("prepare.lock");
        let parents = StaticParents::new().with("k", vec![]);
        let preparer = Preparer::new(Config {
            lock_file: Some(lock_file.clone()),
            ..Default::default()
        });

        assert!(fx.prepare(&preparer, &parents, "k", "1").unwrap());
        assert!(lock_file.is_file());
        assert!(base.config_path().is_file());

        // released on return
        drop(preparer.lock().unwrap());
    }

    #[test]
    fn test_concurrent_snapshots_share_parent() {
        let fx = Fixture::new();
        let shared = fx.legacy("1", 0, 100);
        let a = fx.legacy("2", 1, 200);
        let b = fx.legacy("3", 2, 300);
        let parents = StaticParents::new()
            .with("a", ids(&["1"]))
            .with("b", ids(&["1"]));
        let preparer = Preparer::default();
        let barrier = Barrier::new(2);

        std::thread::scope(|s| {
            let fx = &fx;
            let preparer = &preparer;
            let parents = &parents;
            let barrier = &barrier;
            let ha = s.spawn(move || {
                barrier.wait();
                fx.prepare(preparer, parents, "a", "2")
            });
            let hb = s.spawn(move || {
                barrier.wait();
                fx.prepare(preparer, parents, "b", "3")
            });
            assert!(ha.join().unwrap().unwrap());
            assert!(hb.join().unwrap().unwrap());
        });

        let shared_lower = Lower::blob(digest(0), 100, block_dir(&shared));
        assert_eq!(load(&a).unwrap().lowers[1], shared_lower);
        assert_eq!(load(&b).unwrap().lowers[1], shared_lower);

        // the shared parent is not rewritten by later preparations
        let inode = fs::metadata(shared.config_path()).unwrap().ino();
        fx.prepare(&preparer, &parents, "a", "2").unwrap();
        fx.prepare(&preparer, &parents, "b", "3").unwrap();
        assert_eq!(fs::metadata(shared.config_path()).unwrap().ino(), inode);
    }

    /// start a walk of `key` while `held` is locked, check it makes no
    /// change until the guard drops, then let it finish
    fn prepare_blocked_by(
        fx: &Fixture,
        held: &Preparer,
        walker: &Preparer,
        parents: &StaticParents,
        key: &str,
        id: &str,
        untouched: &[&LayerDir],
    ) {
        let guard = held.lock().unwrap();
        thread::scope(|s| {
            let handle = s.spawn(|| fx.prepare(walker, parents, key, id));

            thread::sleep(Duration::from_millis(200));
            assert!(!handle.is_finished());
            for layer in untouched {
                assert!(!layer.meta_path().exists(), "{}", layer.path().display());
                assert!(!layer.config_path().exists(), "{}", layer.path().display());
            }

            drop(guard);
            assert!(handle.join().unwrap().unwrap());
        });
    }

    #[test]
    fn test_walk_waits_for_held_lock() {
        let fx = Fixture::new();
        let shared = fx.legacy("1", 0, 100);
        let a = fx.legacy("2", 1, 200);
        let b = fx.legacy("3", 2, 300);
        let parents = StaticParents::new()
            .with("a", ids(&["1"]))
            .with("b", ids(&["1"]));
        let preparer = Preparer::default();

        prepare_blocked_by(&fx, &preparer, &preparer, &parents, "a", "2", &[&shared, &a]);
        let inode = fs::metadata(shared.config_path()).unwrap().ino();
        let written = fs::read(shared.config_path()).unwrap();

        prepare_blocked_by(&fx, &preparer, &preparer, &parents, "b", "3", &[&b]);
        assert_eq!(fs::metadata(shared.config_path()).unwrap().ino(), inode);
        assert_eq!(fs::read(shared.config_path()).unwrap(), written);
        assert_eq!(
            load(&b).unwrap().lowers[1],
            Lower::blob(digest(0), 100, block_dir(&shared))
        );
    }

    #[test]
    fn test_walk_waits_for_lock_file_held_elsewhere() {
        let fx = Fixture::new();
        let base = fx.legacy("1", 0, 100);
        let child = fx.legacy("2", 1, 200);
        let parents = StaticParents::new().with("k", ids(&["1"]));
        let config = Config {
            lock_file: Some(fx.root.path().join("prepare.lock")),
            ..Default::default()
        };
        // separate preparers share only the lock file, like two processes
        let holder = Preparer::new(config.clone());
        let walker = Preparer::new(config);

        prepare_blocked_by(&fx, &holder, &walker, &parents, "k", "2", &[&base, &child]);
        assert_eq!(load(&child).unwrap().lowers.len(), 3);
    }
}
