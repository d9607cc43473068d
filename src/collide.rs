//! Quick-hash collision handling.
//!
//! The quick hash is a pre-filter: two files that differ in their first
//! MiB can never be duplicates, so only rows sharing a quick hash pay for
//! a full read. Promotion fills the missing `sha256` of every row in a
//! collision group, then the group partitions into true duplicates (same
//! full hash, two or more inodes) and false collisions. All of it is
//! idempotent; already-promoted rows are never re-hashed.

use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::catalog::files::FileRow;
use crate::device::Device;
use crate::error::Result;
use crate::hash::full_hash;

/// Active rows sharing one quick hash.
#[derive(Debug, Clone)]
pub struct CollisionGroup {
    pub quick_hash: String,
    pub rows: Vec<FileRow>,
}

/// Result of promoting one collision group.
#[derive(Debug, Default)]
pub struct GroupOutcome {
    pub hashed: u64,
    pub skipped: u64,
    pub errors: u64,
    /// Rows partitioned by their full hash after promotion.
    pub partitions: Vec<(String, Vec<FileRow>)>,
}

impl GroupOutcome {
    /// Partitions spanning at least two inodes are true duplicates.
    pub fn true_duplicates(&self) -> impl Iterator<Item = &(String, Vec<FileRow>)> {
        self.partitions.iter().filter(|(_, rows)| {
            let mut inodes: Vec<u64> = rows.iter().map(|r| r.inode).collect();
            inodes.sort_unstable();
            inodes.dedup();
            inodes.len() >= 2
        })
    }
}

/// Accumulated result of promoting every collision group on a device.
#[derive(Debug, Default)]
pub struct PromotionStats {
    pub groups: usize,
    pub hashed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub true_duplicate_groups: usize,
    pub false_collision_groups: usize,
}

/// Groups of two or more active rows sharing a quick hash.
pub fn find_quick_hash_collisions(
    catalog: &Catalog,
    device_id: u64,
) -> Result<Vec<CollisionGroup>> {
    let groups = catalog.quick_hash_collisions(device_id)?;
    Ok(groups
        .into_iter()
        .filter_map(|rows| {
            let quick_hash = rows.first()?.quick_hash.clone()?;
            Some(CollisionGroup { quick_hash, rows })
        })
        .collect())
}

/// Fill the missing full hashes of one group and partition it.
///
/// Idempotent: rows that already carry a `sha256` are counted as skipped.
/// A row that fails to hash keeps its NULL hash and is left out of the
/// partitions; re-running promotion picks it up again.
pub fn promote_group(
    catalog: &Catalog,
    device: &Device,
    group: &CollisionGroup,
) -> Result<GroupOutcome> {
    let mut outcome = GroupOutcome::default();
    let mut resolved: Vec<FileRow> = Vec::with_capacity(group.rows.len());

    for row in &group.rows {
        if row.sha256.is_some() {
            outcome.skipped += 1;
            resolved.push(row.clone());
            continue;
        }
        let live = device.to_live_path(&row.path);
        match full_hash(&live) {
            Ok(sha) => {
                catalog.set_sha256(device.device_id, &row.path, &sha)?;
                outcome.hashed += 1;
                let mut promoted = row.clone();
                promoted.sha256 = Some(sha);
                resolved.push(promoted);
            }
            Err(err) => {
                warn!(path = %live.display(), %err, "promotion hash failed");
                outcome.errors += 1;
            }
        }
    }

    resolved.sort_by(|a, b| a.sha256.cmp(&b.sha256).then_with(|| a.path.cmp(&b.path)));
    for row in resolved {
        let sha = row.sha256.clone().expect("resolved rows carry a hash");
        match outcome.partitions.last_mut() {
            Some((key, rows)) if *key == sha => rows.push(row),
            _ => outcome.partitions.push((sha, vec![row])),
        }
    }
    Ok(outcome)
}

/// Promote every collision group on the device.
pub fn promote_all(catalog: &Catalog, device: &Device) -> Result<PromotionStats> {
    let groups = find_quick_hash_collisions(catalog, device.device_id)?;
    let mut stats = PromotionStats {
        groups: groups.len(),
        ..Default::default()
    };
    for group in &groups {
        let outcome = promote_group(catalog, device, group)?;
        stats.hashed += outcome.hashed;
        stats.skipped += outcome.skipped;
        stats.errors += outcome.errors;
        let true_dups = outcome.true_duplicates().count();
        stats.true_duplicate_groups += true_dups;
        stats.false_collision_groups += outcome.partitions.len().saturating_sub(true_dups);
    }
    info!(
        groups = stats.groups,
        hashed = stats.hashed,
        skipped = stats.skipped,
        errors = stats.errors,
        "collision promotion done"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::files::{FileRecord, ScanWrite};
    use std::path::PathBuf;

    fn device(id: u64, mount: &str) -> Device {
        Device {
            fs_uuid: "u".into(),
            device_id: id,
            mount_point: PathBuf::from(mount),
            preferred_mount_point: PathBuf::from(mount),
            fs_type: "ext4".into(),
            alias: None,
            registered_at: 0.0,
            updated_at: 0.0,
        }
    }

    fn seed(catalog: &mut Catalog, device_id: u64, rows: &[(&str, u64, &str, Option<&str>)]) {
        catalog.ensure_files_table(device_id).unwrap();
        let writes: Vec<ScanWrite> = rows
            .iter()
            .map(|(path, inode, quick, sha)| {
                ScanWrite::Upsert(FileRecord {
                    path: path.to_string(),
                    size: 8,
                    mtime: 1.0,
                    inode: *inode,
                    quick_hash: Some(quick.to_string()),
                    sha256: sha.map(str::to_string),
                })
            })
            .collect();
        catalog.apply_scan_batch(device_id, 1, &writes).unwrap();
    }

    #[test]
    fn promotion_hashes_real_files_and_partitions() {
        let dir = tempfile::TempDir::new().unwrap();
        let mount = dir.path().to_string_lossy().into_owned();
        let mut catalog = Catalog::open(&dir.path().join("catalog.db")).unwrap();

        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        std::fs::write(&a, b"same-bytes").unwrap();
        std::fs::write(&b, b"same-bytes").unwrap();
        std::fs::write(&c, b"other-bytes").unwrap();

        let (a_path, b_path, c_path) = (
            a.to_string_lossy().into_owned(),
            b.to_string_lossy().into_owned(),
            c.to_string_lossy().into_owned(),
        );
        seed(
            &mut catalog,
            5,
            &[
                (a_path.as_str(), 1, "qq", None),
                (b_path.as_str(), 2, "qq", None),
                (c_path.as_str(), 3, "qq", None),
            ],
        );

        let groups = find_quick_hash_collisions(&catalog, 5).unwrap();
        assert_eq!(groups.len(), 1);

        let dev = device(5, &mount);
        let outcome = promote_group(&catalog, &dev, &groups[0]).unwrap();
        assert_eq!(outcome.hashed, 3);
        assert_eq!(outcome.partitions.len(), 2);
        assert_eq!(outcome.true_duplicates().count(), 1);

        // Second run skips everything already promoted.
        let groups = find_quick_hash_collisions(&catalog, 5).unwrap();
        let again = promote_group(&catalog, &dev, &groups[0]).unwrap();
        assert_eq!(again.hashed, 0);
        assert_eq!(again.skipped, 3);
    }

    #[test]
    fn hardlinked_partition_is_not_a_true_duplicate() {
        let outcome = GroupOutcome {
            partitions: vec![(
                "s".into(),
                vec![
                    FileRow {
                        path: "/m/a".into(),
                        size: 8,
                        mtime: 1.0,
                        inode: 9,
                        quick_hash: Some("q".into()),
                        sha256: Some("s".into()),
                        status: crate::catalog::files::FileStatus::Active,
                        last_seen_scan: None,
                    },
                    FileRow {
                        path: "/m/b".into(),
                        size: 8,
                        mtime: 1.0,
                        inode: 9,
                        quick_hash: Some("q".into()),
                        sha256: Some("s".into()),
                        status: crate::catalog::files::FileStatus::Active,
                        last_seen_scan: None,
                    },
                ],
            )],
            ..Default::default()
        };
        assert_eq!(outcome.true_duplicates().count(), 0);
    }
}
