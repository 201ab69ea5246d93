//! snapshotter collaborators consumed by the layer walk

use std::collections::HashMap;

use crate::error::{Error, Result};

/// kind of a snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Kind {
    View,
    #[default]
    Active,
    Committed,
}

/// snapshot metadata as the snapshotter reports it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    pub parent: String,
    pub kind: Kind,
    pub labels: HashMap<String, String>,
}

/// snapshot bookkeeping lookup
pub trait ParentResolver {
    /// ids of all ancestors of `key`, immediate parent first
    fn parent_ids(&self, key: &str) -> Result<Vec<String>>;
}

impl<F> ParentResolver for F
where
    F: Fn(&str) -> Result<Vec<String>>,
{
    fn parent_ids(&self, key: &str) -> Result<Vec<String>> {
        self(key)
    }
}

/// in-memory parent table
#[derive(Clone, Debug, Default)]
pub struct StaticParents {
    parents: HashMap<String, Vec<String>>,
}

impl StaticParents {
    pub fn new() -> Self {
        Self::default()
    }

    /// record the ancestors of `key`, immediate parent first
    pub fn insert(&mut self, key: impl Into<String>, parent_ids: Vec<String>) {
        self.parents.insert(key.into(), parent_ids);
    }

    pub fn with(mut self, key: impl Into<String>, parent_ids: Vec<String>) -> Self {
        self.insert(key, parent_ids);
        self
    }
}

impl ParentResolver for StaticParents {
    fn parent_ids(&self, key: &str) -> Result<Vec<String>> {
        self.parents
            .get(key)
            .cloned()
            .ok_or_else(|| Error::SnapshotNotFound(key.to_string()))
    }
}
