//! The disk-layout planner.
//!
//! A pure function over a disk inventory: bucket disks by rounded
//! capacity, pick the dominant bucket as storage, hand SSDs to the
//! log/cache roles when storage is rotational, and arrange the storage
//! disks into single-disk, mirrored, or raidz2 vdevs.

use clap::ValueEnum;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// One disk as reported by the inventory.
#[derive(Debug, Clone, Deserialize)]
pub struct Disk {
    pub name: String,
    #[serde(default)]
    pub vid: String,
    #[serde(default)]
    pub pid: String,
    /// Capacity in megabytes.
    pub size: u64,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub removable: bool,
    #[serde(default)]
    pub solid_state: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LayoutKind {
    /// One vdev per disk; no redundancy.
    Single,
    /// Two-way mirrors.
    Mirror,
    /// Double-parity raidz rows.
    Raidz2,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Vdev {
    #[serde(rename = "type")]
    pub kind: String,
    pub devices: Vec<String>,
}

/// The planner's output: vdevs plus the optional support roles.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Layout {
    pub vdevs: Vec<Vdev>,
    /// Usable capacity in megabytes.
    pub capacity: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spares: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<Vec<String>>,
}

#[derive(Debug, ThisError)]
pub enum LayoutError {
    #[error("no usable disks in the inventory")]
    NoUsableDisks,
}

/// Capacity buckets, in megabytes. Disks within 5% of a threshold are
/// treated as that size so mixed-vendor batches land together.
const CAPACITY_THRESHOLDS: &[u64] = &[500_000, 150_000, 80_000, 20_000, 4_500, 1_000];

/// At most this many SSDs become separate log devices; the rest cache.
const MAX_SLOG_DEVICES: usize = 4;

/// Widest raidz2 row the planner will build.
const MAX_RAIDZ2_WIDTH: usize = 12;
/// Narrowest raidz2 row worth building; smaller leftovers become spares.
const MIN_RAIDZ2_WIDTH: usize = 4;

fn rounded_capacity(size: u64) -> u64 {
    for &threshold in CAPACITY_THRESHOLDS {
        let window = threshold / 20;
        if size.abs_diff(threshold) <= window {
            return threshold;
        }
    }
    size
}

fn auto_layout(storage_disks: usize) -> LayoutKind {
    if storage_disks == 1 {
        LayoutKind::Single
    } else if storage_disks <= 16 {
        LayoutKind::Mirror
    } else {
        LayoutKind::Raidz2
    }
}

/// Compute a pool layout. `choice` forces a layout; otherwise one is
/// picked from the storage disk count.
pub fn plan(disks: &[Disk], choice: Option<LayoutKind>) -> Result<Layout, LayoutError> {
    let eligible: Vec<&Disk> = disks.iter().filter(|d| !d.removable).collect();
    if eligible.is_empty() {
        return Err(LayoutError::NoUsableDisks);
    }

    // Bucket by rounded capacity; the bucket with the most disks (size
    // breaking ties) becomes storage.
    let mut buckets: std::collections::BTreeMap<u64, Vec<&Disk>> = Default::default();
    for disk in &eligible {
        buckets.entry(rounded_capacity(disk.size)).or_default().push(disk);
    }
    let (&storage_size, _) = buckets
        .iter()
        .max_by_key(|(size, members)| (members.len(), **size))
        .expect("buckets cannot be empty");
    let mut storage: Vec<&Disk> = buckets.remove(&storage_size).unwrap_or_default();
    storage.sort_by(|a, b| a.name.cmp(&b.name));

    let mut leftovers: Vec<&Disk> = buckets.into_values().flatten().collect();
    leftovers.sort_by(|a, b| a.name.cmp(&b.name));

    // Rotational storage gets SSD support devices: the first four SSDs
    // as slog, the remainder as cache.
    let mut logs = Vec::new();
    let mut cache = Vec::new();
    let mut spares = Vec::new();
    let storage_is_rotational = storage.iter().all(|d| !d.solid_state);
    for disk in leftovers {
        if storage_is_rotational && disk.solid_state {
            if logs.len() < MAX_SLOG_DEVICES {
                logs.push(disk.name.clone());
            } else {
                cache.push(disk.name.clone());
            }
        } else {
            spares.push(disk.name.clone());
        }
    }

    let kind = choice.unwrap_or_else(|| auto_layout(storage.len()));
    debug!(
        "planning {:?} layout over {} storage disks of {} MB",
        kind,
        storage.len(),
        storage_size
    );

    let mut vdevs = Vec::new();
    let mut capacity = 0u64;
    match kind {
        LayoutKind::Single => {
            for disk in &storage {
                vdevs.push(Vdev {
                    kind: "disk".to_string(),
                    devices: vec![disk.name.clone()],
                });
                capacity += disk.size;
            }
        }
        LayoutKind::Mirror => {
            for pair in storage.chunks(2) {
                if pair.len() == 2 {
                    vdevs.push(Vdev {
                        kind: "mirror".to_string(),
                        devices: pair.iter().map(|d| d.name.clone()).collect(),
                    });
                    capacity += pair.iter().map(|d| d.size).min().unwrap_or(0);
                } else {
                    // Odd disk out keeps the pool balanced as a spare.
                    spares.push(pair[0].name.clone());
                }
            }
        }
        LayoutKind::Raidz2 => {
            for row in storage.chunks(MAX_RAIDZ2_WIDTH) {
                if row.len() >= MIN_RAIDZ2_WIDTH {
                    vdevs.push(Vdev {
                        kind: "raidz2".to_string(),
                        devices: row.iter().map(|d| d.name.clone()).collect(),
                    });
                    let per_disk = row.iter().map(|d| d.size).min().unwrap_or(0);
                    capacity += per_disk * (row.len() as u64 - 2);
                } else {
                    spares.extend(row.iter().map(|d| d.name.clone()));
                }
            }
        }
    }

    spares.sort();
    Ok(Layout {
        vdevs,
        capacity,
        spares: non_empty(spares),
        logs: non_empty(logs),
        cache: non_empty(cache),
    })
}

fn non_empty(v: Vec<String>) -> Option<Vec<String>> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdd(name: &str, size: u64) -> Disk {
        Disk {
            name: name.to_string(),
            vid: "ACME".to_string(),
            pid: "SPINNER".to_string(),
            size,
            kind: "scsi".to_string(),
            removable: false,
            solid_state: false,
        }
    }

    fn ssd(name: &str, size: u64) -> Disk {
        Disk {
            solid_state: true,
            ..hdd(name, size)
        }
    }

    #[test]
    fn test_rounded_capacity_window() {
        assert_eq!(rounded_capacity(500_000), 500_000);
        // Within 5% of a threshold snaps to it.
        assert_eq!(rounded_capacity(510_000), 500_000);
        assert_eq!(rounded_capacity(476_000), 500_000);
        // Outside the window stays as-is.
        assert_eq!(rounded_capacity(540_000), 540_000);
        assert_eq!(rounded_capacity(1_020), 1_000);
    }

    #[test]
    fn test_auto_selection() {
        assert_eq!(auto_layout(1), LayoutKind::Single);
        assert_eq!(auto_layout(2), LayoutKind::Mirror);
        assert_eq!(auto_layout(16), LayoutKind::Mirror);
        assert_eq!(auto_layout(17), LayoutKind::Raidz2);
    }

    #[test]
    fn test_single_disk() {
        let layout = plan(&[hdd("c0t0d0", 80_000)], None).unwrap();
        assert_eq!(
            layout.vdevs,
            vec![Vdev {
                kind: "disk".to_string(),
                devices: vec!["c0t0d0".to_string()]
            }]
        );
        assert_eq!(layout.capacity, 80_000);
        assert_eq!(layout.spares, None);
    }

    #[test]
    fn test_mirror_pairs_and_odd_spare() {
        let disks = vec![
            hdd("d0", 80_000),
            hdd("d1", 80_000),
            hdd("d2", 80_000),
        ];
        let layout = plan(&disks, None).unwrap();
        assert_eq!(layout.vdevs.len(), 1);
        assert_eq!(layout.vdevs[0].kind, "mirror");
        assert_eq!(layout.capacity, 80_000);
        assert_eq!(layout.spares, Some(vec!["d2".to_string()]));
    }

    #[test]
    fn test_raidz2_rows_and_capacity() {
        let disks: Vec<Disk> = (0..20).map(|i| hdd(&format!("d{:02}", i), 20_000)).collect();
        let layout = plan(&disks, None).unwrap();
        // 20 disks: one row of 12 and one of 8.
        assert_eq!(layout.vdevs.len(), 2);
        assert_eq!(layout.vdevs[0].devices.len(), 12);
        assert_eq!(layout.vdevs[1].devices.len(), 8);
        assert_eq!(layout.capacity, 20_000 * (10 + 6));
        assert_eq!(layout.spares, None);
    }

    #[test]
    fn test_raidz2_narrow_leftover_becomes_spares() {
        let disks: Vec<Disk> = (0..14).map(|i| hdd(&format!("d{:02}", i), 20_000)).collect();
        let layout = plan(&disks, Some(LayoutKind::Raidz2)).unwrap();
        assert_eq!(layout.vdevs.len(), 1);
        assert_eq!(layout.spares.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_first_four_ssds_become_logs() {
        let mut disks: Vec<Disk> = (0..6).map(|i| hdd(&format!("d{}", i), 150_000)).collect();
        disks.extend((0..6).map(|i| ssd(&format!("s{}", i), 20_000)));
        let layout = plan(&disks, None).unwrap();
        assert_eq!(
            layout.logs,
            Some(vec![
                "s0".to_string(),
                "s1".to_string(),
                "s2".to_string(),
                "s3".to_string()
            ])
        );
        assert_eq!(
            layout.cache,
            Some(vec!["s4".to_string(), "s5".to_string()])
        );
        // Storage stayed on the rotational bucket.
        assert!(layout.vdevs.iter().all(|v| v.kind == "mirror"));
    }

    #[test]
    fn test_ssd_storage_takes_no_support_devices() {
        let mut disks: Vec<Disk> = (0..4).map(|i| ssd(&format!("s{}", i), 80_000)).collect();
        disks.push(hdd("d0", 20_000));
        let layout = plan(&disks, None).unwrap();
        assert_eq!(layout.logs, None);
        assert_eq!(layout.cache, None);
        assert_eq!(layout.spares, Some(vec!["d0".to_string()]));
    }

    #[test]
    fn test_removable_disks_excluded() {
        let mut usb = hdd("usb0", 4_500);
        usb.removable = true;
        assert!(matches!(
            plan(&[usb.clone()], None),
            Err(LayoutError::NoUsableDisks)
        ));
        let layout = plan(&[usb, hdd("d0", 80_000)], None).unwrap();
        assert_eq!(layout.vdevs.len(), 1);
        assert_eq!(layout.vdevs[0].devices, vec!["d0".to_string()]);
    }

    #[test]
    fn test_serialized_shape() {
        let layout = plan(&[hdd("d0", 80_000)], None).unwrap();
        let json = serde_json::to_value(&layout).unwrap();
        assert_eq!(json["vdevs"][0]["type"], "disk");
        assert_eq!(json["capacity"], 80_000);
        assert!(json.get("spares").is_none());
    }
}
