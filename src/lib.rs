//! mockzfs: an in-memory mock of a pooled, copy-on-write dataset
//! manager, for deterministic tests of software that drives `zpool`
//! and `zfs`.
//!
//! The [`engine`] module holds the dataset graph and its operations;
//! [`zfs`] is the command-shaped surface most callers want; [`layout`]
//! is the standalone disk-layout planner behind the `disklayout`
//! binary.

pub mod archive;
pub mod engine;
pub mod layout;
pub mod mockfs;
pub mod name;
pub mod zfs;

pub use engine::{
    DatasetKind, DatasetState, DescendantType, Engine, Error, NodeId, PropertySource,
    PropertyValue,
};
pub use mockfs::{FsError, MockFs, MOCK_DEV};
pub use zfs::{CommandError, ListOptions, MockZfs};
