//! The dataset engine: an in-memory graph of pools, filesystems,
//! volumes, snapshots, and clones with ZFS-shaped semantics.
//!
//! All state lives behind one [`Engine`] value: the node arena, the pool
//! map (the "pools root"), the pool-wide default property map, the mount
//! table, and the transaction-group counter. Tests build a fresh engine
//! (or call [`Engine::reset`]) per case.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use log::info;
use thiserror::Error as ThisError;

use crate::mockfs::{FsError, MockFs};
use crate::name;

mod iter;
mod node;
mod ops;
mod props;

pub use iter::DescendantType;
pub use node::{DatasetKind, DatasetState, Node, NodeId};
pub use props::{PropertySource, PropertyValue};

/// Everything the engine can refuse to do.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid dataset name '{name}': {reason}")]
    DatasetName { name: String, reason: String },

    #[error("'{name}' is a {kind}: {reason}")]
    DatasetType {
        name: String,
        kind: DatasetKind,
        reason: String,
    },

    #[error("dataset '{name}' already exists")]
    DatasetExists { name: String },

    #[error("dataset '{name}' is not active")]
    InactiveDataset { name: String },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("unsupported file type at '{path}'")]
    InvalidFileType { path: String },

    #[error("cannot mount '{name}': {reason}")]
    Unmountable { name: String, reason: String },

    #[error("cannot mount '{name}': '{mountpoint}' is not empty")]
    OverlayMount { name: String, mountpoint: String },

    #[error("cannot unmount '{name}': '{submount}' is still mounted")]
    FilesystemBusy { name: String, submount: String },

    #[error("snapshot '{name}' is held with tag '{tag}'")]
    SnapshotHold { name: String, tag: String },

    #[error("cannot destroy '{name}': dataset has descendants")]
    Descendant { name: String },

    #[error("cannot destroy '{origin}': clone '{clone}' depends on it")]
    Dependant { origin: String, clone: String },

    #[error("property '{property}' is read-only")]
    ReadOnlyProperty { property: String },

    #[error("property '{property}' is not supported on a {kind}")]
    UnsupportedProperty { property: String, kind: DatasetKind },

    #[error("cannot parse '{value}' as a size")]
    BadHumanNumber { value: String },

    #[error("no such pool '{name}'")]
    NoSuchPool { name: String },

    #[error("'{what}' is not implemented")]
    NotImplemented { what: String },

    #[error(transparent)]
    Fs(#[from] FsError),
}

impl Error {
    pub fn exists(name: impl Into<String>) -> Self {
        Error::DatasetExists { name: name.into() }
    }

    pub fn inactive(name: impl Into<String>) -> Self {
        Error::InactiveDataset { name: name.into() }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn not_implemented(what: impl Into<String>) -> Self {
        Error::NotImplemented { what: what.into() }
    }

    pub(crate) fn wrong_kind(
        name: impl Into<String>,
        kind: DatasetKind,
        reason: impl Into<String>,
    ) -> Self {
        Error::DatasetType {
            name: name.into(),
            kind,
            reason: reason.into(),
        }
    }
}

/// The process-wide registry: pools root, mount table, txg counter, and
/// the mock host filesystem, behind one struct.
#[derive(Debug)]
pub struct Engine {
    pub(crate) nodes: Vec<Node>,
    /// Children of the pools root: top-level filesystems.
    pub(crate) pools: BTreeMap<String, NodeId>,
    /// Default property map carried by the pools root.
    pub(crate) defaults: BTreeMap<String, String>,
    /// Mount-point path to mounted dataset. At most one dataset per path.
    pub(crate) mounts: BTreeMap<PathBuf, NodeId>,
    pub(crate) txg: u64,
    /// Open pending-txg windows. While non-zero, created datasets share
    /// the current txg and the counter does not advance.
    pub(crate) pending_txg: u32,
    pub(crate) fs: MockFs,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            nodes: Vec::new(),
            pools: BTreeMap::new(),
            defaults: props::default_properties(),
            mounts: BTreeMap::new(),
            txg: 1,
            pending_txg: 0,
            fs: MockFs::new(),
        }
    }

    /// Drop the entire world: graph, mount table, txg counter, and the
    /// mock filesystem. The sanctioned way to isolate test cases.
    pub fn reset(&mut self) {
        info!("engine reset");
        *self = Engine::new();
    }

    pub fn fs(&self) -> &MockFs {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut MockFs {
        &mut self.fs
    }

    pub fn txg(&self) -> u64 {
        self.txg
    }

    /// Pool names, sorted.
    pub fn pools(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Look up a dataset by full name (`pool/fs`, `pool/fs@snap`, ...).
    /// Destroyed datasets are not reachable.
    pub fn get(&self, fullname: &str) -> Option<NodeId> {
        let (base, snap) = name::split_snapshot(fullname);
        let mut segments = base.split('/');
        let pool = segments.next()?;
        let mut cur = *self.pools.get(pool)?;
        for seg in segments {
            cur = *self.node(cur).children.get(seg)?;
        }
        match snap {
            Some(s) => self.node(cur).snapshots.get(s).copied(),
            None => Some(cur),
        }
    }

    /// Full name of a dataset, built by walking parents up to the pools
    /// root.
    pub fn full_name(&self, id: NodeId) -> String {
        let node = self.node(id);
        match node.parent {
            Some(parent) => format!(
                "{}{}{}",
                self.full_name(parent),
                node.separator(),
                node.name
            ),
            None => node.name.clone(),
        }
    }

    /// Pool a dataset belongs to: the last name walked before reaching
    /// the pools root.
    pub fn pool_of(&self, id: NodeId) -> String {
        let mut cur = id;
        loop {
            let node = self.node(cur);
            match node.parent {
                Some(parent) => cur = parent,
                None => return node.name.clone(),
            }
        }
    }

    /// Tear a pool down: walk every descendant in reverse, unmount on a
    /// best-effort basis, and mark the lot `PoolDestroyed`.
    pub fn destroy_pool(&mut self, pool: &str) -> Result<(), Error> {
        let id = *self
            .pools
            .get(pool)
            .ok_or_else(|| Error::NoSuchPool {
                name: pool.to_string(),
            })?;
        let targets = self.iter_descendants(id, &[DescendantType::All])?;
        for &t in targets.iter().rev() {
            let _ = self.unmount(t);
            self.node_mut(t).state = DatasetState::PoolDestroyed;
        }
        self.pools.remove(pool);
        info!("destroyed pool '{}'", pool);
        Ok(())
    }

    pub(crate) fn ensure_active(&self, id: NodeId) -> Result<(), Error> {
        if self.node(id).is_active() {
            Ok(())
        } else {
            Err(Error::inactive(self.full_name(id)))
        }
    }

    /// Current mount-point set, for archive descent checks.
    pub(crate) fn mountpoints(&self) -> BTreeSet<PathBuf> {
        self.mounts.keys().cloned().collect()
    }

    /// Mount table entry for a dataset, if mounted.
    pub(crate) fn mount_entry(&self, id: NodeId) -> Option<PathBuf> {
        self.mounts
            .iter()
            .find(|(_, &v)| v == id)
            .map(|(k, _)| k.clone())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::HashSet;

    /// Check the structural invariants the operations promise to
    /// maintain. Called after every step of the randomized sequences.
    pub(crate) fn assert_invariants(engine: &Engine) {
        let mut reachable = HashSet::new();
        for &pool in engine.pools.values() {
            collect(engine, pool, &mut reachable);
        }

        for &id in &reachable {
            let node = engine.node(id);
            assert!(
                node.is_active(),
                "reachable dataset '{}' is {:?}",
                engine.full_name(id),
                node.state()
            );

            // Parent registration under the node's own name.
            match node.parent {
                Some(parent) => {
                    let p = engine.node(parent);
                    let registered = match node.kind() {
                        DatasetKind::Snapshot => p.snapshots.get(&node.name),
                        _ => p.children.get(&node.name),
                    };
                    assert_eq!(registered, Some(&id), "parent link broken");
                }
                None => {
                    assert_eq!(engine.pools.get(&node.name), Some(&id));
                    assert_eq!(node.kind(), DatasetKind::Filesystem);
                }
            }

            // Snapshot/clone symmetry.
            for &clone in &node.clones {
                assert_eq!(engine.node(clone).origin, Some(id));
            }
            if let Some(origin) = node.origin {
                assert!(engine.node(origin).clones.contains(&id));
            }

            // Mount table bijectivity.
            let entry = engine.mount_entry(id);
            assert_eq!(node.mounted(), entry.is_some());
        }

        // No mount entry may point outside the reachable graph.
        for &id in engine.mounts.values() {
            assert!(reachable.contains(&id), "mount table leaks a dataset");
        }

        // Visit-once even with clone edges.
        for &pool in engine.pools.values() {
            let all = engine
                .iter_descendants(
                    pool,
                    &[DescendantType::All, DescendantType::Clones],
                )
                .unwrap();
            let unique: HashSet<_> = all.iter().collect();
            assert_eq!(unique.len(), all.len(), "descendant visited twice");
        }
    }

    fn collect(engine: &Engine, id: NodeId, out: &mut HashSet<NodeId>) {
        if !out.insert(id) {
            return;
        }
        let node = engine.node(id);
        for &s in node.snapshots.values() {
            collect(engine, s, out);
        }
        for &c in node.children.values() {
            collect(engine, c, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_engine_is_empty() {
        let engine = Engine::new();
        assert!(engine.pools().is_empty());
        assert_eq!(engine.txg(), 1);
        assert_eq!(engine.get("tank"), None);
    }

    #[test]
    fn test_get_walks_the_graph() {
        let mut engine = Engine::new();
        let pool = engine
            .create(None, "tank", DatasetKind::Filesystem, &[])
            .unwrap();
        let fs = engine
            .create(Some(pool), "data", DatasetKind::Filesystem, &[])
            .unwrap();
        let snap = engine.snapshot(fs, "s1", false, &[]).unwrap();

        assert_eq!(engine.get("tank"), Some(pool));
        assert_eq!(engine.get("tank/data"), Some(fs));
        assert_eq!(engine.get("tank/data@s1"), Some(snap));
        assert_eq!(engine.get("tank/none"), None);
        assert_eq!(engine.get("tank/data@none"), None);
        assert_eq!(engine.full_name(snap), "tank/data@s1");
        assert_eq!(engine.pool_of(snap), "tank");
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut engine = Engine::new();
        engine
            .create(None, "tank", DatasetKind::Filesystem, &[])
            .unwrap();
        engine.fs_mut().add_root("/m").unwrap();
        engine.reset();
        assert!(engine.pools().is_empty());
        assert!(!engine.fs().is_mock("/m"));
        assert_eq!(engine.txg(), 1);
    }

    #[test]
    fn test_destroy_pool() {
        let mut engine = Engine::new();
        let pool = engine
            .create(None, "tank", DatasetKind::Filesystem, &[])
            .unwrap();
        let fs = engine
            .create(Some(pool), "data", DatasetKind::Filesystem, &[])
            .unwrap();
        engine.snapshot(fs, "s1", false, &[]).unwrap();

        engine.destroy_pool("tank").unwrap();
        assert!(engine.pools().is_empty());
        assert_eq!(engine.get("tank"), None);
        assert_eq!(engine.node(fs).state(), DatasetState::PoolDestroyed);
        assert!(engine.mounts.is_empty());

        assert!(matches!(
            engine.destroy_pool("tank"),
            Err(Error::NoSuchPool { .. })
        ));
    }
}
