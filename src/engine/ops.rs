//! The core dataset operations.
//!
//! Recursive operations follow a two-phase shape: collect the targets,
//! run every precondition, and only then mutate. A failed check leaves
//! the graph exactly as it was, so there is no rollback path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::Utc;
use log::debug;

use crate::archive::{archive, clear_dir, restore, ArchiveEntry};
use crate::name;

use super::{DatasetKind, DatasetState, DescendantType, Engine, Error, Node, NodeId};

impl Engine {
    /// Create a filesystem or volume. `parent` of `None` targets the
    /// pools root and is only valid for filesystems. Properties are
    /// applied while the dataset is still in its `Creating` state, so
    /// creation-only setters work here.
    pub fn create(
        &mut self,
        parent: Option<NodeId>,
        name: &str,
        kind: DatasetKind,
        props: &[(&str, &str)],
    ) -> Result<NodeId, Error> {
        if kind == DatasetKind::Snapshot {
            return Err(Error::invalid_argument(
                "snapshots are created with snapshot(), not create()",
            ));
        }
        self.create_node(parent, name, kind, props, None, true)
    }

    pub(crate) fn create_node(
        &mut self,
        parent: Option<NodeId>,
        name: &str,
        kind: DatasetKind,
        props: &[(&str, &str)],
        fscontent: Option<Rc<ArchiveEntry>>,
        auto_mount: bool,
    ) -> Result<NodeId, Error> {
        match parent {
            None => {
                if kind != DatasetKind::Filesystem {
                    return Err(Error::wrong_kind(
                        name,
                        kind,
                        "top-level datasets must be filesystems",
                    ));
                }
            }
            Some(p) => {
                self.ensure_active(p)?;
                let pkind = self.node(p).kind();
                let fits = match kind {
                    DatasetKind::Snapshot => pkind.supports_snapshots(),
                    _ => pkind == DatasetKind::Filesystem,
                };
                if !fits {
                    return Err(Error::wrong_kind(
                        self.full_name(p),
                        pkind,
                        format!("cannot hold a {}", kind),
                    ));
                }
            }
        }
        name::namecheck(name)?;

        let collision = match parent {
            None => self.pools.contains_key(name),
            Some(p) => {
                let pn = self.node(p);
                if kind == DatasetKind::Snapshot {
                    pn.snapshots.contains_key(name)
                } else {
                    pn.children.contains_key(name)
                }
            }
        };
        if collision {
            let full = match parent {
                None => name.to_string(),
                Some(p) => {
                    let sep = if kind == DatasetKind::Snapshot { '@' } else { '/' };
                    format!("{}{}{}", self.full_name(p), sep, name)
                }
            };
            return Err(Error::exists(full));
        }

        let id = NodeId(self.nodes.len());
        let mut node = Node::new(
            name.to_string(),
            parent,
            kind,
            Utc::now().timestamp(),
            self.txg,
            rand::random(),
        );
        node.fscontent = fscontent;
        if kind == DatasetKind::Volume {
            node.local
                .insert("volblocksize".to_string(), "8192".to_string());
        }
        self.nodes.push(node);

        for (prop, value) in props {
            if let Err(e) = self.set_property(id, prop, value) {
                // Never registered, so the arena slot just goes away.
                self.nodes.pop();
                return Err(e);
            }
        }

        self.node_mut(id).state = DatasetState::Active;
        match parent {
            None => {
                self.pools.insert(name.to_string(), id);
            }
            Some(p) => {
                if kind == DatasetKind::Snapshot {
                    self.node_mut(p).snapshots.insert(name.to_string(), id);
                } else {
                    self.node_mut(p).children.insert(name.to_string(), id);
                }
            }
        }
        if self.pending_txg == 0 {
            self.txg += 1;
        }
        debug!("created {} '{}'", kind, self.full_name(id));

        if auto_mount && kind == DatasetKind::Filesystem {
            let canmount = self.inheritable_value(id, "canmount").map(|pv| pv.value);
            if canmount.as_deref() == Some("on") {
                self.mount(id, true)?;
            }
        }
        Ok(id)
    }

    /// Mount a filesystem at its computed mountpoint. With
    /// `ignore_not_mountable`, the usual reasons a dataset cannot mount
    /// return quietly; an overlay of a non-empty directory is an error
    /// either way.
    pub fn mount(&mut self, id: NodeId, ignore_not_mountable: bool) -> Result<(), Error> {
        self.ensure_active(id)?;
        let full = self.full_name(id);

        let reason = self.not_mountable_reason(id);
        if let Some(reason) = reason {
            if ignore_not_mountable {
                debug!("not mounting '{}': {}", full, reason);
                return Ok(());
            }
            return Err(Error::Unmountable { name: full, reason });
        }

        // The reason check guarantees an absolute mountpoint here.
        let mp = match self.mountpoint_of(id) {
            Some(mp) => PathBuf::from(mp),
            None => return Ok(()),
        };
        if self.fs.exists(&mp) && !self.fs.read_dir(&mp)?.is_empty() {
            return Err(Error::OverlayMount {
                name: full,
                mountpoint: mp.display().to_string(),
            });
        }
        self.fs.mkdir_p(&mp)?;
        self.mounts.insert(mp.clone(), id);
        self.node_mut(id).mounted = true;
        if let Some(content) = self.node_mut(id).fscontent.take() {
            restore(&mut self.fs, &mp, &content)?;
        }
        debug!("mounted '{}' at '{}'", full, mp.display());
        Ok(())
    }

    fn not_mountable_reason(&self, id: NodeId) -> Option<String> {
        let node = self.node(id);
        if node.kind() != DatasetKind::Filesystem {
            return Some(format!("'{}' is not a filesystem", node.kind()));
        }
        if node.mounted {
            return Some("already mounted".to_string());
        }
        let canmount = self.inheritable_value(id, "canmount").map(|pv| pv.value);
        if canmount.as_deref() == Some("off") {
            return Some("canmount is off".to_string());
        }
        match self.mountpoint_of(id) {
            Some(mp) if mp.starts_with('/') => {
                if self.fs.is_mock(Path::new(&mp)) {
                    None
                } else {
                    Some(format!("'{}' is not under a mock filesystem", mp))
                }
            }
            Some(mp) => Some(format!("mountpoint is '{}'", mp)),
            None => Some("no mountpoint".to_string()),
        }
    }

    /// Unmount a filesystem, capturing its content into `fscontent`.
    /// A no-op when not mounted; refuses while anything is mounted
    /// strictly below.
    pub fn unmount(&mut self, id: NodeId) -> Result<(), Error> {
        self.ensure_active(id)?;
        if !self.node(id).mounted {
            return Ok(());
        }
        let mp = match self.mount_entry(id) {
            Some(mp) => mp,
            None => return Ok(()),
        };
        if let Some(sub) = self
            .mounts
            .keys()
            .find(|p| p.starts_with(&mp) && **p != mp)
        {
            return Err(Error::FilesystemBusy {
                name: self.full_name(id),
                submount: sub.display().to_string(),
            });
        }

        let mounts = self.mountpoints();
        let content = archive(&self.fs, &mp, &mounts)?;
        clear_dir(&mut self.fs, &mp, &mounts)?;
        self.node_mut(id).fscontent = Some(content);
        self.mounts.remove(&mp);
        self.node_mut(id).mounted = false;
        debug!("unmounted '{}' from '{}'", self.full_name(id), mp.display());
        Ok(())
    }

    /// Snapshot a filesystem or volume, or with `recursive` every
    /// filesystem/volume below it. All snapshots created by one call
    /// share a `createtxg`. Returns the snapshot of `id` itself.
    pub fn snapshot(
        &mut self,
        id: NodeId,
        snapname: &str,
        recursive: bool,
        props: &[(&str, &str)],
    ) -> Result<NodeId, Error> {
        self.ensure_active(id)?;
        let kind = self.node(id).kind();
        if !kind.supports_snapshots() {
            return Err(Error::wrong_kind(
                self.full_name(id),
                kind,
                "cannot be snapshotted",
            ));
        }
        name::namecheck(snapname)?;

        let targets = if recursive {
            self.iter_descendants(
                id,
                &[DescendantType::Filesystem, DescendantType::Volume],
            )?
        } else {
            vec![id]
        };

        for &t in &targets {
            if self.node(t).snapshots.contains_key(snapname) {
                return Err(Error::exists(format!(
                    "{}@{}",
                    self.full_name(t),
                    snapname
                )));
            }
        }

        // Capture content before creating anything so a failed archive
        // leaves no partial snapshot set behind.
        let mut contents = Vec::with_capacity(targets.len());
        for &t in &targets {
            let content = match self.node(t).fscontent.clone() {
                Some(c) => Some(c),
                None => match self.mount_entry(t) {
                    Some(mp) => Some(archive(&self.fs, &mp, &self.mountpoints())?),
                    None => None,
                },
            };
            contents.push(content);
        }

        self.pending_txg += 1;
        let result = self.create_snapshots(&targets, snapname, props, contents);
        self.pending_txg -= 1;
        if self.pending_txg == 0 {
            self.txg += 1;
        }
        result
    }

    fn create_snapshots(
        &mut self,
        targets: &[NodeId],
        snapname: &str,
        props: &[(&str, &str)],
        contents: Vec<Option<Rc<ArchiveEntry>>>,
    ) -> Result<NodeId, Error> {
        let mut first = None;
        for (&t, content) in targets.iter().zip(contents) {
            let snap =
                self.create_node(Some(t), snapname, DatasetKind::Snapshot, props, content, false)?;
            first.get_or_insert(snap);
        }
        first.ok_or_else(|| Error::invalid_argument("nothing to snapshot"))
    }

    /// Create a filesystem or volume from a snapshot. The new dataset
    /// takes the kind of the snapshot's parent, shares the snapshot's
    /// content, and keeps an origin back-edge.
    pub fn clone(
        &mut self,
        snap: NodeId,
        newname: &str,
        parents: bool,
        props: &[(&str, &str)],
    ) -> Result<NodeId, Error> {
        self.ensure_active(snap)?;
        let kind = self.node(snap).kind();
        if kind != DatasetKind::Snapshot {
            return Err(Error::wrong_kind(
                self.full_name(snap),
                kind,
                "only snapshots can be cloned",
            ));
        }
        if newname.contains('@') {
            return Err(Error::invalid_argument(format!(
                "clone target '{}' must not name a snapshot",
                newname
            )));
        }
        let pool = self.pool_of(snap);
        if name::pool_of_name(newname) != pool {
            return Err(Error::invalid_argument(format!(
                "clone target '{}' must stay in pool '{}'",
                newname, pool
            )));
        }
        let (parent_path, leaf) = newname.rsplit_once('/').ok_or_else(|| {
            Error::invalid_argument(format!(
                "clone target '{}' cannot be a top-level dataset",
                newname
            ))
        })?;
        let parent = match self.get(parent_path) {
            Some(p) => p,
            None if parents => self.create_ancestors(parent_path)?,
            None => {
                return Err(Error::invalid_argument(format!(
                    "parent '{}' does not exist",
                    parent_path
                )))
            }
        };

        let origin_parent = match self.node(snap).parent {
            Some(p) => p,
            None => {
                return Err(Error::invalid_argument(
                    "snapshot has no parent dataset",
                ))
            }
        };
        let new_kind = self.node(origin_parent).kind();
        let content = self.node(snap).fscontent.clone();
        let id = self.create_node(Some(parent), leaf, new_kind, props, content, true)?;
        self.node_mut(id).origin = Some(snap);
        self.node_mut(snap).clones.push(id);
        debug!(
            "cloned '{}' to '{}'",
            self.full_name(snap),
            self.full_name(id)
        );
        Ok(id)
    }

    fn create_ancestors(&mut self, path: &str) -> Result<NodeId, Error> {
        let mut segments = path.split('/');
        let pool = segments.next().unwrap_or(path);
        let mut cur = match self.pools.get(pool) {
            Some(&id) => id,
            None => {
                return Err(Error::NoSuchPool {
                    name: pool.to_string(),
                })
            }
        };
        for seg in segments {
            cur = match self.node(cur).children.get(seg) {
                Some(&child) => child,
                None => self.create(Some(cur), seg, DatasetKind::Filesystem, &[])?,
            };
        }
        Ok(cur)
    }

    /// Rename a dataset. Snapshot renames (`…@new`) rekey within the
    /// same parent; plain renames may re-parent within the pool.
    /// Mounted filesystems move their mount along.
    pub fn rename(&mut self, id: NodeId, newname: &str) -> Result<(), Error> {
        self.ensure_active(id)?;
        if self.get(newname).is_some() {
            return Err(Error::exists(newname));
        }
        let kind = self.node(id).kind();
        let (base, snap) = name::split_snapshot(newname);

        if let Some(snapname) = snap {
            if kind != DatasetKind::Snapshot {
                return Err(Error::wrong_kind(
                    self.full_name(id),
                    kind,
                    "only snapshots take an '@' name",
                ));
            }
            name::namecheck(snapname)?;
            let parent = match self.node(id).parent {
                Some(p) => p,
                None => return Err(Error::invalid_argument("snapshot has no parent")),
            };
            if base != self.full_name(parent) {
                return Err(Error::invalid_argument(format!(
                    "snapshot rename cannot move from '{}' to '{}'",
                    self.full_name(parent),
                    base
                )));
            }
            let old = self.node(id).name.clone();
            self.node_mut(parent).snapshots.remove(&old);
            self.node_mut(parent)
                .snapshots
                .insert(snapname.to_string(), id);
            self.node_mut(id).name = snapname.to_string();
            return Ok(());
        }

        if kind == DatasetKind::Snapshot {
            return Err(Error::wrong_kind(
                self.full_name(id),
                kind,
                "snapshots are renamed with an '@' name",
            ));
        }
        if name::pool_of_name(newname) != self.pool_of(id) {
            return Err(Error::invalid_argument(
                "rename cannot move a dataset to another pool",
            ));
        }
        let (parent_path, leaf) = newname.rsplit_once('/').ok_or_else(|| {
            Error::invalid_argument(format!(
                "rename target '{}' cannot be a top-level dataset",
                newname
            ))
        })?;
        name::namecheck(leaf)?;
        let new_parent = self.get(parent_path).ok_or_else(|| {
            Error::invalid_argument(format!("parent '{}' does not exist", parent_path))
        })?;
        if self.node(new_parent).kind() != DatasetKind::Filesystem {
            return Err(Error::wrong_kind(
                parent_path,
                self.node(new_parent).kind(),
                "cannot hold child datasets",
            ));
        }
        // Moving under the renamed dataset itself would orphan the subtree.
        let mut cur = Some(new_parent);
        while let Some(c) = cur {
            if c == id {
                return Err(Error::invalid_argument(
                    "cannot move a dataset beneath itself",
                ));
            }
            cur = self.node(c).parent;
        }

        let was_mounted = self.node(id).mounted;
        if was_mounted {
            self.unmount(id)?;
        }
        let old = self.node(id).name.clone();
        match self.node(id).parent {
            Some(p) => {
                self.node_mut(p).children.remove(&old);
            }
            None => {
                self.pools.remove(&old);
            }
        }
        self.node_mut(new_parent)
            .children
            .insert(leaf.to_string(), id);
        self.node_mut(id).parent = Some(new_parent);
        self.node_mut(id).name = leaf.to_string();
        if was_mounted {
            self.mount(id, false)?;
        }
        Ok(())
    }

    /// Destroy a dataset, or with `recursive` its entire subtree.
    /// Preconditions run over every target before the first mutation:
    /// held snapshots, surviving clones of target snapshots, and
    /// non-recursive destruction of non-leaves all refuse.
    pub fn destroy(&mut self, id: NodeId, recursive: bool) -> Result<(), Error> {
        self.ensure_active(id)?;
        let targets = if recursive {
            self.iter_descendants(id, &[DescendantType::All])?
        } else {
            vec![id]
        };
        let target_set: HashSet<NodeId> = targets.iter().copied().collect();

        for &t in &targets {
            let node = self.node(t);
            match node.kind() {
                DatasetKind::Snapshot => {
                    if let Some(tag) = node.holds.iter().next() {
                        return Err(Error::SnapshotHold {
                            name: self.full_name(t),
                            tag: tag.clone(),
                        });
                    }
                    for &clone in &node.clones {
                        if !target_set.contains(&clone) {
                            return Err(Error::Dependant {
                                origin: self.full_name(t),
                                clone: self.full_name(clone),
                            });
                        }
                    }
                }
                _ => {
                    if !recursive
                        && (!node.children.is_empty() || !node.snapshots.is_empty())
                    {
                        return Err(Error::Descendant {
                            name: self.full_name(t),
                        });
                    }
                }
            }
        }

        // Reverse pre-order: leaves go first, so every unmount is clean
        // and parents shed their children one by one.
        for &t in targets.iter().rev() {
            let full = self.full_name(t);
            if self.node(t).mounted {
                self.unmount(t)?;
            }
            let node_name = self.node(t).name.clone();
            let parent = self.node(t).parent;
            match self.node(t).kind() {
                DatasetKind::Snapshot => {
                    let clones = std::mem::take(&mut self.node_mut(t).clones);
                    for clone in clones {
                        self.node_mut(clone).origin = None;
                    }
                    if let Some(p) = parent {
                        self.node_mut(p).snapshots.remove(&node_name);
                    }
                }
                _ => {
                    if let Some(origin) = self.node(t).origin {
                        self.node_mut(origin).clones.retain(|&c| c != t);
                        self.node_mut(t).origin = None;
                    }
                    match parent {
                        Some(p) => {
                            self.node_mut(p).children.remove(&node_name);
                        }
                        None => {
                            self.pools.remove(&node_name);
                        }
                    }
                }
            }
            self.node_mut(t).state = DatasetState::Destroyed;
            debug!("destroyed '{}'", full);
        }
        Ok(())
    }

    /// Place a hold on a snapshot; with `recursive`, on every
    /// same-named snapshot under the snapshot's parent. A duplicate tag
    /// is a collision.
    pub fn hold(&mut self, id: NodeId, tag: &str, recursive: bool) -> Result<(), Error> {
        let targets = self.hold_targets(id, recursive)?;
        let tag_owned = tag.to_string();
        self.walk(
            &targets,
            |engine, t| {
                if engine.node(t).holds.contains(tag) {
                    Err(Error::exists(format!("{}#{}", engine.full_name(t), tag)))
                } else {
                    Ok(())
                }
            },
            |engine, t| {
                engine.node_mut(t).holds.insert(tag_owned.clone());
                Ok(())
            },
        )
    }

    /// Release a hold. Recursively, only snapshots actually holding the
    /// tag participate; non-recursively, a missing tag is an error.
    pub fn release(&mut self, id: NodeId, tag: &str, recursive: bool) -> Result<(), Error> {
        if !recursive {
            self.hold_targets(id, false)?;
            if !self.node(id).holds.contains(tag) {
                return Err(Error::invalid_argument(format!(
                    "no hold '{}' on '{}'",
                    tag,
                    self.full_name(id)
                )));
            }
            self.node_mut(id).holds.remove(tag);
            return Ok(());
        }

        let targets: Vec<NodeId> = self
            .hold_targets(id, true)?
            .into_iter()
            .filter(|&t| self.node(t).holds.contains(tag))
            .collect();
        let tag_owned = tag.to_string();
        self.walk(
            &targets,
            |_, _| Ok(()),
            |engine, t| {
                let removed = engine.node_mut(t).holds.remove(&tag_owned);
                debug_assert!(removed, "release filter admitted a non-holder");
                Ok(())
            },
        )
    }

    /// Current hold tags on a snapshot, sorted.
    pub fn holds(&self, id: NodeId) -> Result<Vec<String>, Error> {
        self.ensure_active(id)?;
        let node = self.node(id);
        if node.kind() != DatasetKind::Snapshot {
            return Err(Error::wrong_kind(
                self.full_name(id),
                node.kind(),
                "holds apply to snapshots",
            ));
        }
        Ok(node.holds.iter().cloned().collect())
    }

    fn hold_targets(&self, id: NodeId, recursive: bool) -> Result<Vec<NodeId>, Error> {
        self.ensure_active(id)?;
        let node = self.node(id);
        if node.kind() != DatasetKind::Snapshot {
            return Err(Error::wrong_kind(
                self.full_name(id),
                node.kind(),
                "holds apply to snapshots",
            ));
        }
        if !recursive {
            return Ok(vec![id]);
        }
        let snapname = node.name.clone();
        let parent = match node.parent {
            Some(p) => p,
            None => return Ok(vec![id]),
        };
        let datasets = self.iter_descendants(
            parent,
            &[DescendantType::Filesystem, DescendantType::Volume],
        )?;
        Ok(datasets
            .iter()
            .filter_map(|&d| self.node(d).snapshots.get(&snapname).copied())
            .collect())
    }
}
