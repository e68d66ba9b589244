//! The mock `zpool`/`zfs` command surface.
//!
//! This is the boundary callers program against: command-shaped methods
//! that run one engine operation and rewrite engine errors into the
//! user-visible messages the real tools print. Engine error types never
//! escape this layer.

use std::cell::{Ref, RefCell, RefMut};

use thiserror::Error as ThisError;

use crate::engine::{DatasetKind, DescendantType, Engine, Error, NodeId};
use crate::name;

/// A failed command, carrying only the message a user would see.
#[derive(Debug, ThisError)]
#[error("{message}")]
pub struct CommandError {
    pub message: String,
}

impl CommandError {
    fn new(message: impl Into<String>) -> Self {
        CommandError {
            message: message.into(),
        }
    }

    fn not_implemented(what: &str) -> Self {
        CommandError::new(format!("{}: not implemented", what))
    }
}

pub type CmdResult<T> = Result<T, CommandError>;

/// Default output fields for `zpool list`.
pub const POOL_FIELDS: &[&str] = &["name", "size", "allocated", "free", "cap", "health", "altroot"];
/// Default output fields for `zfs list`.
pub const DATASET_FIELDS: &[&str] = &["name", "used", "avail", "refer", "type", "mountpoint"];

/// Options for [`MockZfs::zfs_list`].
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Comma-separated dataset types; `all` covers the three kinds.
    pub types: String,
    pub recursive: bool,
    /// Output fields; defaults to [`DATASET_FIELDS`].
    pub fields: Option<Vec<String>>,
    /// Only machine-parseable output is emulated.
    pub parseable: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        ListOptions {
            types: "filesystem,volume".to_string(),
            recursive: false,
            fields: None,
            parseable: true,
        }
    }
}

/// The mock ZFS toolset over one engine instance.
///
/// Interior mutability keeps the call sites shaped like running a
/// command rather than threading `&mut` through test code.
#[derive(Debug, Default)]
pub struct MockZfs {
    engine: RefCell<Engine>,
}

impl MockZfs {
    pub fn new() -> Self {
        MockZfs {
            engine: RefCell::new(Engine::new()),
        }
    }

    /// Direct engine access, for seeding mock filesystem state and for
    /// assertions that look under the hood.
    pub fn engine(&self) -> Ref<'_, Engine> {
        self.engine.borrow()
    }

    pub fn engine_mut(&self) -> RefMut<'_, Engine> {
        self.engine.borrow_mut()
    }

    pub fn reset(&self) {
        self.engine.borrow_mut().reset();
    }

    // ---- zpool ----

    pub fn zpool_create(&self, pool: &str) -> CmdResult<()> {
        let mut engine = self.engine.borrow_mut();
        if engine.get(pool).is_some() {
            return Err(CommandError::new(format!(
                "cannot create '{}': pool already exists",
                pool
            )));
        }
        engine
            .create(None, pool, DatasetKind::Filesystem, &[])
            .map(|_| ())
            .map_err(|e| CommandError::new(format!("cannot create '{}': {}", pool, e)))
    }

    pub fn zpool_destroy(&self, pool: &str) -> CmdResult<()> {
        self.engine
            .borrow_mut()
            .destroy_pool(pool)
            .map_err(|e| match e {
                Error::NoSuchPool { .. } => no_such_pool(pool),
                other => CommandError::new(other.to_string()),
            })
    }

    /// `zpool list`. Only `fields = ["name"]` is emulated; the default
    /// field set includes sizes the engine refuses to fake.
    pub fn zpool_list(
        &self,
        pool: Option<&str>,
        fields: Option<&[&str]>,
    ) -> CmdResult<(Vec<String>, Vec<Vec<String>>)> {
        let fields: Vec<String> = fields
            .unwrap_or(POOL_FIELDS)
            .iter()
            .map(|f| f.to_string())
            .collect();
        if fields != ["name"] {
            return Err(CommandError::not_implemented("zpool list fields"));
        }
        let engine = self.engine.borrow();
        let pools = match pool {
            Some(p) => {
                if engine.get(p).is_none() {
                    return Err(no_such_pool(p));
                }
                vec![p.to_string()]
            }
            None => engine.pools(),
        };
        let rows = pools.into_iter().map(|p| vec![p]).collect();
        Ok((fields, rows))
    }

    /// `zpool status`. Missing pools report `UNKNOWN` rather than
    /// failing; callers historically rely on that.
    pub fn zpool_status(&self, pool: &str) -> CmdResult<&'static str> {
        if self.engine.borrow().get(pool).is_some() {
            Ok("ONLINE")
        } else {
            Ok("UNKNOWN")
        }
    }

    pub fn zpool_upgrade(&self, _pool: Option<&str>) -> CmdResult<()> {
        Err(CommandError::not_implemented("zpool upgrade"))
    }

    pub fn zpool_list_disks(&self) -> CmdResult<Vec<String>> {
        Err(CommandError::not_implemented("zpool listDisks"))
    }

    // ---- zfs ----

    pub fn zfs_create(&self, dataset: &str) -> CmdResult<()> {
        let mut engine = self.engine.borrow_mut();
        let (parent_path, leaf) = match dataset.rsplit_once('/') {
            Some(split) => split,
            None => return Err(CommandError::new("missing dataset name")),
        };
        let parent = match engine.get(parent_path) {
            Some(p) => p,
            None => {
                return Err(CommandError::new(format!(
                    "cannot create '{}': parent does not exist",
                    dataset
                )))
            }
        };
        engine
            .create(Some(parent), leaf, DatasetKind::Filesystem, &[])
            .map(|_| ())
            .map_err(|e| match e {
                Error::DatasetExists { .. } => CommandError::new(format!(
                    "cannot create '{}': dataset already exists",
                    dataset
                )),
                other => CommandError::new(format!("cannot create '{}': {}", dataset, other)),
            })
    }

    pub fn zfs_snapshot(&self, snapshot: &str) -> CmdResult<()> {
        let mut engine = self.engine.borrow_mut();
        let (base, snap) = name::split_snapshot(snapshot);
        let snapname = match snap {
            Some(s) if !s.is_empty() => s,
            _ => {
                return Err(CommandError::new(format!(
                    "cannot create snapshot '{}': empty component or misplaced '@' or '#' \
                     delimiter in name",
                    snapshot
                )))
            }
        };
        let id = match engine.get(base) {
            Some(id) => id,
            None => return Err(no_such_dataset(base)),
        };
        engine
            .snapshot(id, snapname, false, &[])
            .map(|_| ())
            .map_err(|e| match e {
                Error::DatasetExists { .. } => CommandError::new(format!(
                    "cannot create snapshot '{}': dataset already exists",
                    snapshot
                )),
                other => {
                    CommandError::new(format!("cannot create snapshot '{}': {}", snapshot, other))
                }
            })
    }

    pub fn zfs_clone(
        &self,
        snapshot: &str,
        dataset: &str,
        props: &[(&str, &str)],
    ) -> CmdResult<()> {
        let mut engine = self.engine.borrow_mut();
        if dataset.contains('@') {
            return Err(CommandError::new(format!(
                "cannot create '{}': snapshot delimiter '@' is not expected here",
                dataset
            )));
        }
        let snap = match engine.get(snapshot) {
            Some(id) => id,
            None => return Err(no_such_dataset(snapshot)),
        };
        engine
            .clone(snap, dataset, false, props)
            .map(|_| ())
            .map_err(|e| match e {
                Error::DatasetExists { .. } => CommandError::new(format!(
                    "cannot create '{}': dataset already exists",
                    dataset
                )),
                other => CommandError::new(format!("cannot create '{}': {}", dataset, other)),
            })
    }

    pub fn zfs_destroy(&self, dataset: &str) -> CmdResult<()> {
        self.destroy_inner(dataset, false)
    }

    pub fn zfs_destroy_all(&self, dataset: &str) -> CmdResult<()> {
        self.destroy_inner(dataset, true)
    }

    fn destroy_inner(&self, dataset: &str, recursive: bool) -> CmdResult<()> {
        let mut engine = self.engine.borrow_mut();
        let id = match engine.get(dataset) {
            Some(id) => id,
            None => return Err(no_such_dataset(dataset)),
        };
        engine.destroy(id, recursive).map_err(|e| match e {
            Error::SnapshotHold { .. } => {
                CommandError::new(format!("cannot destroy '{}': dataset is busy", dataset))
            }
            Error::Descendant { .. } => CommandError::new(format!(
                "cannot destroy '{}': filesystem has children",
                dataset
            )),
            Error::Dependant { origin, .. } => CommandError::new(format!(
                "cannot destroy '{}': snapshot '{}' has dependent clones",
                dataset, origin
            )),
            other => CommandError::new(format!("cannot destroy '{}': {}", dataset, other)),
        })
    }

    pub fn zfs_set(&self, dataset: &str, props: &[(&str, &str)]) -> CmdResult<()> {
        let mut engine = self.engine.borrow_mut();
        let id = match engine.get(dataset) {
            Some(id) => id,
            None => return Err(no_such_dataset(dataset)),
        };
        for (prop, value) in props {
            engine.set_property(id, prop, value).map_err(|e| {
                CommandError::new(format!("cannot set property for '{}': {}", dataset, e))
            })?;
        }
        Ok(())
    }

    /// `zfs get -p`. Rows are `[dataset, property, value]`; only
    /// parseable output is emulated.
    pub fn zfs_get(
        &self,
        dataset: &str,
        props: &[&str],
        parseable: bool,
    ) -> CmdResult<Vec<Vec<String>>> {
        if !parseable {
            return Err(CommandError::not_implemented("zfs get without -p"));
        }
        let engine = self.engine.borrow();
        let id = match engine.get(dataset) {
            Some(id) => id,
            None => return Err(no_such_dataset(dataset)),
        };
        let mut rows = Vec::new();
        for prop in props {
            let value = engine
                .get_property(id, prop)
                .map_err(|e| map_property_error(prop, e))?;
            rows.push(vec![dataset.to_string(), prop.to_string(), value]);
        }
        Ok(rows)
    }

    /// `zfs list -H`. Returns the field list and one row per dataset in
    /// deterministic pre-order.
    pub fn zfs_list(
        &self,
        dataset: Option<&str>,
        opts: &ListOptions,
    ) -> CmdResult<(Vec<String>, Vec<Vec<String>>)> {
        if !opts.parseable {
            return Err(CommandError::not_implemented("zfs list without -H"));
        }
        let types = parse_types(&opts.types)?;
        let fields: Vec<String> = match &opts.fields {
            Some(fields) => fields.clone(),
            None => DATASET_FIELDS.iter().map(|f| f.to_string()).collect(),
        };

        let engine = self.engine.borrow();
        let mut ids = Vec::new();
        match dataset {
            Some(ds) => {
                let id = match engine.get(ds) {
                    Some(id) => id,
                    None => return Err(no_such_dataset(ds)),
                };
                if opts.recursive {
                    ids.extend(
                        engine
                            .iter_descendants(id, &types)
                            .map_err(|e| CommandError::new(e.to_string()))?,
                    );
                } else {
                    ids.extend(narrow_listing(&engine, id, &types));
                }
            }
            None => {
                for pool in engine.pools() {
                    if let Some(id) = engine.get(&pool) {
                        ids.extend(
                            engine
                                .iter_descendants(id, &types)
                                .map_err(|e| CommandError::new(e.to_string()))?,
                        );
                    }
                }
            }
        }

        let mut rows = Vec::new();
        for id in ids {
            let mut row = Vec::new();
            for field in &fields {
                let value = engine
                    .get_property(id, field)
                    .map_err(|e| map_property_error(field, e))?;
                row.push(value);
            }
            rows.push(row);
        }
        Ok((fields, rows))
    }

    /// `zfs list -t snapshot`, with or without a starting dataset.
    pub fn zfs_list_snapshots(
        &self,
        dataset: Option<&str>,
    ) -> CmdResult<(Vec<String>, Vec<Vec<String>>)> {
        let opts = ListOptions {
            types: "snapshot".to_string(),
            recursive: dataset.is_none(),
            fields: Some(vec!["name".to_string()]),
            parseable: true,
        };
        self.zfs_list(dataset, &opts)
    }

    pub fn zfs_hold(&self, snapshot: &str, tag: &str) -> CmdResult<()> {
        let mut engine = self.engine.borrow_mut();
        let id = match engine.get(snapshot) {
            Some(id) => id,
            None => return Err(no_such_dataset(snapshot)),
        };
        engine.hold(id, tag, false).map_err(|e| match e {
            Error::DatasetExists { .. } => CommandError::new(format!(
                "cannot hold snapshot '{}': tag already exists on this dataset",
                snapshot
            )),
            other => CommandError::new(format!("cannot hold snapshot '{}': {}", snapshot, other)),
        })
    }

    pub fn zfs_release_hold(&self, snapshot: &str, tag: &str) -> CmdResult<()> {
        let mut engine = self.engine.borrow_mut();
        let id = match engine.get(snapshot) {
            Some(id) => id,
            None => return Err(no_such_dataset(snapshot)),
        };
        engine.release(id, tag, false).map_err(|e| {
            CommandError::new(format!("cannot release hold from '{}': {}", snapshot, e))
        })
    }

    pub fn zfs_holds(&self, snapshot: &str) -> CmdResult<Vec<String>> {
        let engine = self.engine.borrow();
        let id = match engine.get(snapshot) {
            Some(id) => id,
            None => return Err(no_such_dataset(snapshot)),
        };
        engine
            .holds(id)
            .map_err(|e| CommandError::new(e.to_string()))
    }

    pub fn zfs_send(&self, _snapshot: &str) -> CmdResult<()> {
        Err(CommandError::not_implemented("zfs send"))
    }

    pub fn zfs_receive(&self, _dataset: &str) -> CmdResult<()> {
        Err(CommandError::not_implemented("zfs receive"))
    }

    pub fn zfs_rollback(&self, _dataset: &str) -> CmdResult<()> {
        Err(CommandError::not_implemented("zfs rollback"))
    }

    pub fn zfs_upgrade(&self, _dataset: Option<&str>) -> CmdResult<()> {
        Err(CommandError::not_implemented("zfs upgrade"))
    }
}

fn no_such_pool(pool: &str) -> CommandError {
    CommandError::new(format!("cannot open '{}': no such pool", pool))
}

fn no_such_dataset(dataset: &str) -> CommandError {
    CommandError::new(format!("cannot open '{}': dataset does not exist", dataset))
}

fn map_property_error(prop: &str, e: Error) -> CommandError {
    match e {
        Error::NotImplemented { .. } => {
            CommandError::new(format!("property '{}': not implemented", prop))
        }
        other => CommandError::new(other.to_string()),
    }
}

fn parse_types(types: &str) -> CmdResult<Vec<DescendantType>> {
    let mut out = Vec::new();
    for t in types.split(',') {
        match t.trim() {
            "all" => out.push(DescendantType::All),
            "filesystem" => out.push(DescendantType::Filesystem),
            "volume" => out.push(DescendantType::Volume),
            "snapshot" => out.push(DescendantType::Snapshot),
            other => {
                return Err(CommandError::new(format!(
                    "invalid type '{}'",
                    other
                )))
            }
        }
    }
    Ok(out)
}

/// Non-recursive listing: the dataset itself when it matches, plus its
/// direct snapshots when snapshots are requested. This is what makes
/// `list_snapshots(name)` equal `list(name, type=snapshot)`.
fn narrow_listing(engine: &Engine, id: NodeId, types: &[DescendantType]) -> Vec<NodeId> {
    let wants = |k: DatasetKind| {
        types.iter().any(|&t| {
            matches!(
                (t, k),
                (DescendantType::All, _)
                    | (DescendantType::Filesystem, DatasetKind::Filesystem)
                    | (DescendantType::Volume, DatasetKind::Volume)
                    | (DescendantType::Snapshot, DatasetKind::Snapshot)
            )
        })
    };
    let mut out = Vec::new();
    if wants(engine.node(id).kind()) {
        out.push(id);
    }
    if wants(DatasetKind::Snapshot) {
        out.extend(engine.node(id).snapshots.values().copied());
    }
    out
}
