//! The property model.
//!
//! Every dataset carries a `local` map of explicitly-set properties; the
//! pools root carries the default map. Lookups walk parents, so a value
//! is `local`, `inherited from <ancestor>`, or `default`. Setters
//! dispatch through a per-property validator; getters outside the
//! supported set fail loudly with `NotImplemented` so callers relying on
//! unemulated semantics notice immediately.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use super::{DatasetKind, DatasetState, Engine, Error, NodeId};

/// Where a property value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertySource {
    Local,
    Default,
    Inherited { from: String },
}

impl fmt::Display for PropertySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertySource::Local => write!(f, "local"),
            PropertySource::Default => write!(f, "default"),
            PropertySource::Inherited { from } => write!(f, "inherited from {}", from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyValue {
    pub value: String,
    pub source: PropertySource,
}

/// Properties computed from the node itself; never settable.
const READ_ONLY: &[&str] = &[
    "type",
    "name",
    "guid",
    "creation",
    "createtxg",
    "mounted",
    "origin",
];

/// Properties that go through the validator table.
const WRITABLE: &[&str] = &[
    "atime",
    "canmount",
    "checksum",
    "compression",
    "copies",
    "mountpoint",
    "quota",
    "version",
    "volblocksize",
];

/// Validator for one writable property.
enum Validator {
    Choice(&'static [&'static str]),
    Copies,
    Integer,
    Mountpoint,
    Quota,
    Volblocksize,
}

fn validator(prop: &str) -> Option<Validator> {
    let v = match prop {
        "atime" | "compression" => Validator::Choice(&["on", "off"]),
        "canmount" => Validator::Choice(&["on", "off", "noauto"]),
        "checksum" => Validator::Choice(&[
            "on",
            "off",
            "fletcher2",
            "fletcher4",
            "sha256",
            "sha512",
            "skein",
            "edonr",
            "noparity",
        ]),
        "copies" => Validator::Copies,
        "version" => Validator::Integer,
        "mountpoint" => Validator::Mountpoint,
        "quota" => Validator::Quota,
        "volblocksize" => Validator::Volblocksize,
        _ => return None,
    };
    Some(v)
}

/// The default property map carried by the pools root.
pub(crate) fn default_properties() -> BTreeMap<String, String> {
    [
        ("atime", "on"),
        ("canmount", "on"),
        ("checksum", "on"),
        ("compression", "off"),
        ("copies", "1"),
        ("dedup", "off"),
        ("devices", "on"),
        ("encryption", "off"),
        ("exec", "on"),
        ("keyformat", "none"),
        ("keylocation", "none"),
        ("logbias", "latency"),
        ("mlslabel", "none"),
        ("mountpoint", "/"),
        ("nbmand", "off"),
        ("normalization", "none"),
        ("overlay", "off"),
        ("primarycache", "all"),
        ("quota", "none"),
        ("readonly", "off"),
        ("recordsize", "131072"),
        ("redundant_metadata", "all"),
        ("refquota", "none"),
        ("refreservation", "none"),
        ("relatime", "off"),
        ("reservation", "none"),
        ("secondarycache", "all"),
        ("setuid", "on"),
        ("sharenfs", "off"),
        ("sharesmb", "off"),
        ("snapdev", "hidden"),
        ("snapdir", "hidden"),
        ("sync", "standard"),
        ("version", "5"),
        ("volmode", "default"),
        ("vscan", "off"),
        ("xattr", "on"),
        ("zoned", "off"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Parse a human-readable size: digits with an optional
/// `b`/`k`/`m`/`g`/`t`/`p`/`e` suffix.
pub fn parse_human_number(value: &str) -> Result<u64, Error> {
    let bad = || Error::BadHumanNumber {
        value: value.to_string(),
    };

    let (digits, suffix) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => value.split_at(pos),
        None => (value, ""),
    };
    if digits.is_empty() || suffix.len() > 1 {
        return Err(bad());
    }
    let n: u64 = digits.parse().map_err(|_| bad())?;
    let shift = match suffix {
        "" | "b" => 0,
        "k" => 10,
        "m" => 20,
        "g" => 30,
        "t" => 40,
        "p" => 50,
        "e" => 60,
        _ => return Err(bad()),
    };
    Ok(n << shift)
}

impl Engine {
    /// Set a property, validating the value against the per-property
    /// rules. On an active filesystem, changing `mountpoint` unmounts,
    /// rewrites, and remounts (mount failures swallowed).
    pub fn set_property(&mut self, id: NodeId, prop: &str, value: &str) -> Result<(), Error> {
        let node = self.node(id);
        if !matches!(
            node.state(),
            DatasetState::Creating | DatasetState::Active
        ) {
            return Err(Error::inactive(self.full_name(id)));
        }

        if READ_ONLY.contains(&prop) {
            return Err(Error::ReadOnlyProperty {
                property: prop.to_string(),
            });
        }

        let validator = validator(prop).ok_or_else(|| Error::not_implemented(prop))?;
        let kind = node.kind();
        match validator {
            Validator::Choice(choices) => {
                if !choices.contains(&value) {
                    return Err(Error::invalid_argument(format!(
                        "'{}' is not a valid value for property '{}'",
                        value, prop
                    )));
                }
            }
            Validator::Copies => {
                let n: u64 = value.parse().map_err(|_| {
                    Error::invalid_argument(format!("'{}' is not a number", value))
                })?;
                if !(1..=3).contains(&n) {
                    return Err(Error::invalid_argument(format!(
                        "property 'copies' must be between 1 and 3, got {}",
                        n
                    )));
                }
            }
            Validator::Integer => {
                value.parse::<u64>().map_err(|_| {
                    Error::invalid_argument(format!("'{}' is not a number", value))
                })?;
            }
            Validator::Mountpoint => {
                if value != "none" && value != "legacy" && !value.starts_with('/') {
                    return Err(Error::invalid_argument(format!(
                        "mountpoint '{}' must be an absolute path, 'none', or 'legacy'",
                        value
                    )));
                }
            }
            Validator::Quota => {
                if kind != DatasetKind::Filesystem {
                    return Err(Error::UnsupportedProperty {
                        property: prop.to_string(),
                        kind,
                    });
                }
                if value != "none" {
                    parse_human_number(value)?;
                }
            }
            Validator::Volblocksize => {
                if kind != DatasetKind::Volume {
                    return Err(Error::UnsupportedProperty {
                        property: prop.to_string(),
                        kind,
                    });
                }
                // Settable only while the dataset is being created.
                if node.state() != DatasetState::Creating {
                    return Err(Error::ReadOnlyProperty {
                        property: prop.to_string(),
                    });
                }
                value.parse::<u64>().map_err(|_| {
                    Error::invalid_argument(format!("'{}' is not a number", value))
                })?;
            }
        }

        let live_mountpoint_change = prop == "mountpoint"
            && kind == DatasetKind::Filesystem
            && node.state() == DatasetState::Active;
        if live_mountpoint_change {
            self.unmount(id)?;
        }
        self.node_mut(id)
            .local
            .insert(prop.to_string(), value.to_string());
        if live_mountpoint_change {
            self.mount(id, true)?;
        }
        Ok(())
    }

    /// Read a property. Works on datasets in any state. Names outside
    /// the supported set fail with `NotImplemented`.
    pub fn get_property(&self, id: NodeId, prop: &str) -> Result<String, Error> {
        let node = self.node(id);
        match prop {
            "type" => Ok(node.kind().to_string()),
            "name" => Ok(self.full_name(id)),
            "guid" => Ok(node.guid().to_string()),
            "creation" => Ok(node.creation().to_string()),
            "createtxg" => Ok(node.createtxg().to_string()),
            "mounted" => Ok(if node.mounted() { "yes" } else { "no" }.to_string()),
            "origin" => Ok(match node.origin() {
                Some(origin) => self.full_name(origin),
                None => "-".to_string(),
            }),
            "mountpoint" => Ok(self.mountpoint_of(id).unwrap_or_else(|| "-".to_string())),
            _ if WRITABLE.contains(&prop) => Ok(self
                .inheritable_value(id, prop)
                .map(|pv| pv.value)
                .unwrap_or_else(|| "-".to_string())),
            _ => Err(Error::not_implemented(prop)),
        }
    }

    /// Walk from the dataset toward the pools root until some local map
    /// carries `prop`; fall back to the default map.
    pub fn inheritable_value(&self, id: NodeId, prop: &str) -> Option<PropertyValue> {
        if let Some(value) = self.node(id).local.get(prop) {
            return Some(PropertyValue {
                value: value.clone(),
                source: PropertySource::Local,
            });
        }
        let mut cur = self.node(id).parent;
        while let Some(ancestor) = cur {
            if let Some(value) = self.node(ancestor).local.get(prop) {
                return Some(PropertyValue {
                    value: value.clone(),
                    source: PropertySource::Inherited {
                        from: self.full_name(ancestor),
                    },
                });
            }
            cur = self.node(ancestor).parent;
        }
        self.defaults.get(prop).map(|value| PropertyValue {
            value: value.clone(),
            source: PropertySource::Default,
        })
    }

    /// Where a filesystem mounts: the nearest local `mountpoint` joined
    /// with the names collected on the way up (or `/` plus every
    /// segment). `none` and `legacy` pass through literally. Volumes and
    /// snapshots have no mountpoint.
    pub fn mountpoint_of(&self, id: NodeId) -> Option<String> {
        if self.node(id).kind() != DatasetKind::Filesystem {
            return None;
        }
        let mut segments = Vec::new();
        let mut cur = Some(id);
        let anchor = loop {
            match cur {
                Some(c) => {
                    let node = self.node(c);
                    if let Some(mp) = node.local.get("mountpoint") {
                        break mp.clone();
                    }
                    segments.push(node.name.clone());
                    cur = node.parent;
                }
                // Pools root: the default map supplies the anchor.
                None => break self.defaults.get("mountpoint").cloned().unwrap_or_default(),
            }
        };
        if anchor == "none" || anchor == "legacy" {
            return Some(anchor);
        }
        let mut path = PathBuf::from(anchor);
        for seg in segments.iter().rev() {
            path.push(seg);
        }
        Some(path.display().to_string())
    }
}
