//! Descendant traversal.
//!
//! Clone edges make the dataset graph cyclic: a clone's subtree can lead
//! back into its origin's ancestry. Traversal therefore keeps a visited
//! set and yields each dataset at most once, in a deterministic
//! pre-order: self, then snapshots (each followed by its clones when
//! requested), then children.

use std::collections::HashSet;

use super::{DatasetKind, Engine, Error, NodeId};

/// Filter for [`Engine::iter_descendants`]. `All` expands to the three
/// dataset kinds; `Clones` additionally follows snapshot-to-clone edges
/// and must be combined with at least one dataset kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescendantType {
    Filesystem,
    Volume,
    Snapshot,
    Clones,
    All,
}

struct TypeFilter {
    filesystems: bool,
    volumes: bool,
    snapshots: bool,
    clones: bool,
}

impl TypeFilter {
    fn new(types: &[DescendantType]) -> Result<Self, Error> {
        let mut filter = TypeFilter {
            filesystems: false,
            volumes: false,
            snapshots: false,
            clones: false,
        };
        for t in types {
            match t {
                DescendantType::Filesystem => filter.filesystems = true,
                DescendantType::Volume => filter.volumes = true,
                DescendantType::Snapshot => filter.snapshots = true,
                DescendantType::Clones => filter.clones = true,
                DescendantType::All => {
                    filter.filesystems = true;
                    filter.volumes = true;
                    filter.snapshots = true;
                }
            }
        }
        if !filter.filesystems && !filter.volumes && !filter.snapshots {
            return Err(Error::invalid_argument(
                "descendant iteration needs at least one dataset type",
            ));
        }
        Ok(filter)
    }

    fn matches(&self, kind: DatasetKind) -> bool {
        match kind {
            DatasetKind::Filesystem => self.filesystems,
            DatasetKind::Volume => self.volumes,
            DatasetKind::Snapshot => self.snapshots,
        }
    }
}

impl Engine {
    /// Collect `id` and its descendants in pre-order, filtered by type.
    /// Descent is independent of the filter: asking for snapshots only
    /// still walks through intermediate filesystems.
    pub fn iter_descendants(
        &self,
        id: NodeId,
        types: &[DescendantType],
    ) -> Result<Vec<NodeId>, Error> {
        let filter = TypeFilter::new(types)?;
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        self.visit(id, &filter, &mut visited, &mut out);
        Ok(out)
    }

    fn visit(
        &self,
        id: NodeId,
        filter: &TypeFilter,
        visited: &mut HashSet<NodeId>,
        out: &mut Vec<NodeId>,
    ) {
        if !visited.insert(id) {
            return;
        }
        let node = self.node(id);
        if filter.matches(node.kind()) {
            out.push(id);
        }
        for &snap in node.snapshots.values() {
            self.visit(snap, filter, visited, out);
        }
        if node.kind() == DatasetKind::Snapshot && filter.clones {
            for &clone in &node.clones {
                self.visit(clone, filter, visited, out);
            }
        }
        for &child in node.children.values() {
            self.visit(child, filter, visited, out);
        }
    }

    /// Check-then-act over a target list: every precondition runs before
    /// the first mutation, so a failure leaves the graph untouched.
    pub(crate) fn walk(
        &mut self,
        targets: &[NodeId],
        check: impl Fn(&Engine, NodeId) -> Result<(), Error>,
        mut act: impl FnMut(&mut Engine, NodeId) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for &t in targets {
            check(self, t)?;
        }
        for &t in targets {
            act(self, t)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Engine, NodeId) {
        let mut engine = Engine::new();
        let pool = engine
            .create(None, "tank", DatasetKind::Filesystem, &[])
            .unwrap();
        let a = engine
            .create(Some(pool), "a", DatasetKind::Filesystem, &[])
            .unwrap();
        engine
            .create(Some(pool), "b", DatasetKind::Filesystem, &[])
            .unwrap();
        engine
            .create(Some(a), "vol", DatasetKind::Volume, &[])
            .unwrap();
        engine.snapshot(a, "s1", false, &[]).unwrap();
        (engine, pool)
    }

    fn names(engine: &Engine, ids: &[NodeId]) -> Vec<String> {
        ids.iter().map(|&id| engine.full_name(id)).collect()
    }

    #[test]
    fn test_pre_order_snapshots_before_children() {
        let (engine, pool) = sample();
        let all = engine
            .iter_descendants(pool, &[DescendantType::All])
            .unwrap();
        assert_eq!(
            names(&engine, &all),
            vec!["tank", "tank/a", "tank/a@s1", "tank/a/vol", "tank/b"]
        );
    }

    #[test]
    fn test_type_filters() {
        let (engine, pool) = sample();
        let snaps = engine
            .iter_descendants(pool, &[DescendantType::Snapshot])
            .unwrap();
        assert_eq!(names(&engine, &snaps), vec!["tank/a@s1"]);

        let vols = engine
            .iter_descendants(pool, &[DescendantType::Volume])
            .unwrap();
        assert_eq!(names(&engine, &vols), vec!["tank/a/vol"]);
    }

    #[test]
    fn test_clones_alone_rejected() {
        let (engine, pool) = sample();
        assert!(matches!(
            engine.iter_descendants(pool, &[DescendantType::Clones]),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_clone_edges_followed_once() {
        let (mut engine, pool) = sample();
        let snap = engine.get("tank/a@s1").unwrap();
        engine.clone(snap, "tank/c", false, &[]).unwrap();

        let with_clones = engine
            .iter_descendants(pool, &[DescendantType::All, DescendantType::Clones])
            .unwrap();
        let listed = names(&engine, &with_clones);
        // The clone appears right after its origin snapshot, and only once
        // even though it is also a child of the pool.
        assert_eq!(
            listed,
            vec!["tank", "tank/a", "tank/a@s1", "tank/c", "tank/a/vol", "tank/b"]
        );

        // Without the clones edge the clone is still reached as a child.
        let without = engine
            .iter_descendants(pool, &[DescendantType::All])
            .unwrap();
        assert_eq!(
            names(&engine, &without),
            vec!["tank", "tank/a", "tank/a@s1", "tank/a/vol", "tank/b", "tank/c"]
        );
    }

    #[test]
    fn test_iteration_from_clone_circles_back_safely() {
        let (mut engine, _) = sample();
        let snap = engine.get("tank/a@s1").unwrap();
        let clone = engine.clone(snap, "tank/a/inner", false, &[]).unwrap();
        engine.snapshot(clone, "cs", false, &[]).unwrap();

        // Starting inside the clone and following clone edges cannot loop.
        let a = engine.get("tank/a").unwrap();
        let ids = engine
            .iter_descendants(a, &[DescendantType::All, DescendantType::Clones])
            .unwrap();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }
}
