//! The dataset node entity.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use crate::archive::ArchiveEntry;

/// Index into the engine's node arena. Links between datasets (parent,
/// children, snapshots, clones, origin, mount table) are all ids, so the
/// snapshot/clone cycle needs no reference counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Filesystem,
    Volume,
    Snapshot,
}

impl DatasetKind {
    /// Filesystems and volumes own snapshots.
    pub fn supports_snapshots(self) -> bool {
        matches!(self, DatasetKind::Filesystem | DatasetKind::Volume)
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DatasetKind::Filesystem => "filesystem",
            DatasetKind::Volume => "volume",
            DatasetKind::Snapshot => "snapshot",
        };
        write!(f, "{}", s)
    }
}

/// Dataset lifecycle. Only `Active` datasets accept operations;
/// property reads are the one exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetState {
    Creating,
    Active,
    Destroyed,
    PoolDestroyed,
}

/// One dataset in the engine graph.
///
/// The variant-specific collections are always present but only used for
/// the matching kind: `children` on filesystems, `snapshots` on
/// filesystems and volumes, `holds`/`clones` on snapshots, `origin` on
/// cloned filesystems and volumes.
#[derive(Debug)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) kind: DatasetKind,
    pub(crate) state: DatasetState,
    pub(crate) creation: i64,
    pub(crate) createtxg: u64,
    pub(crate) guid: u64,
    pub(crate) local: BTreeMap<String, String>,
    pub(crate) mounted: bool,
    pub(crate) fscontent: Option<Rc<ArchiveEntry>>,
    pub(crate) children: BTreeMap<String, NodeId>,
    pub(crate) snapshots: BTreeMap<String, NodeId>,
    pub(crate) holds: BTreeSet<String>,
    pub(crate) clones: Vec<NodeId>,
    pub(crate) origin: Option<NodeId>,
}

impl Node {
    pub(crate) fn new(
        name: String,
        parent: Option<NodeId>,
        kind: DatasetKind,
        creation: i64,
        createtxg: u64,
        guid: u64,
    ) -> Self {
        Node {
            name,
            parent,
            kind,
            state: DatasetState::Creating,
            creation,
            createtxg,
            guid,
            local: BTreeMap::new(),
            mounted: false,
            fscontent: None,
            children: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            holds: BTreeSet::new(),
            clones: Vec::new(),
            origin: None,
        }
    }

    /// Final name component (not the full path).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn state(&self) -> DatasetState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == DatasetState::Active
    }

    pub fn mounted(&self) -> bool {
        self.mounted
    }

    pub fn creation(&self) -> i64 {
        self.creation
    }

    pub fn createtxg(&self) -> u64 {
        self.createtxg
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn origin(&self) -> Option<NodeId> {
        self.origin
    }

    pub fn fscontent(&self) -> Option<&Rc<ArchiveEntry>> {
        self.fscontent.as_ref()
    }

    /// Separator placed between the parent's full name and this node's.
    pub(crate) fn separator(&self) -> char {
        match self.kind {
            DatasetKind::Snapshot => '@',
            _ => '/',
        }
    }
}
