//! Planner: turn duplicate groups into a persisted, ordered action list.
//!
//! The canonical file of a group is chosen deterministically (lowest
//! inode, then shortest path, then lexicographically smallest), so
//! re-planning an unchanged catalog produces the same plan. Each other
//! inode contributes one `HARDLINK` action against one representative
//! path; paths already on the canonical inode become `NOOP` actions so a
//! plan over an already-optimal group still reports honestly.

use tracing::info;

use crate::analyze::{DuplicateGroup, find_duplicates};
use crate::catalog::Catalog;
use crate::catalog::files::FileRow;
use crate::catalog::plans::{ActionType, NewAction};
use crate::device::Device;
use crate::error::{HashallError, Result};

/// Build and persist a plan for the device. Returns the plan id.
pub fn create_plan(
    catalog: &mut Catalog,
    name: &str,
    device: &Device,
    min_size: u64,
) -> Result<i64> {
    // Planning against a catalog with no full hashes would silently see no
    // duplicates; refuse instead and point at the missing step.
    if catalog.count_full_hashed(device.device_id)? == 0 {
        return Err(HashallError::InvalidArgument(format!(
            "device {} has no full hashes; run a scan with --hash-mode upgrade or \
             `link analyze` first",
            device.device_id
        )));
    }

    let report = find_duplicates(catalog, device.device_id, min_size)?;
    let mut actions = Vec::new();
    for group in &report.groups {
        actions.extend(actions_for_group(group));
    }
    let plan_id = catalog.create_plan(name, device.device_id, &actions)?;
    info!(
        plan_id,
        name,
        device_id = device.device_id,
        actions = actions.len(),
        saveable = report.total_saveable,
        "plan created"
    );
    Ok(plan_id)
}

/// Deterministic keep-file ordering: inode, path length, path.
fn canonical_order(a: &FileRow, b: &FileRow) -> std::cmp::Ordering {
    a.inode
        .cmp(&b.inode)
        .then_with(|| a.path.len().cmp(&b.path.len()))
        .then_with(|| a.path.cmp(&b.path))
}

fn actions_for_group(group: &DuplicateGroup) -> Vec<NewAction> {
    let mut rows: Vec<&FileRow> = group.rows.iter().collect();
    rows.sort_by(|a, b| canonical_order(a, b));
    let canonical = rows[0];

    let mut actions = Vec::new();
    let mut seen_inodes = vec![canonical.inode];
    for row in &rows[1..] {
        if row.inode == canonical.inode {
            // Already linked to the keep file; report it, change nothing.
            actions.push(NewAction {
                action_type: ActionType::Noop,
                sha256: group.sha256.clone(),
                source_path: canonical.path.clone(),
                target_path: row.path.clone(),
                bytes_saveable: 0,
            });
            continue;
        }
        if seen_inodes.contains(&row.inode) {
            // Only one representative per inode is relinked; its hardlink
            // siblings follow on a later re-plan.
            continue;
        }
        seen_inodes.push(row.inode);
        actions.push(NewAction {
            action_type: ActionType::Hardlink,
            sha256: group.sha256.clone(),
            source_path: canonical.path.clone(),
            target_path: row.path.clone(),
            bytes_saveable: group.size,
        });
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::files::FileStatus;

    fn row(path: &str, inode: u64) -> FileRow {
        FileRow {
            path: path.to_string(),
            size: 64,
            mtime: 1.0,
            inode,
            quick_hash: Some("q".into()),
            sha256: Some("sha".into()),
            status: FileStatus::Active,
            last_seen_scan: None,
        }
    }

    fn group(rows: Vec<FileRow>) -> DuplicateGroup {
        let mut inodes: Vec<u64> = rows.iter().map(|r| r.inode).collect();
        inodes.sort_unstable();
        inodes.dedup();
        DuplicateGroup {
            sha256: "sha".into(),
            size: 64,
            file_count: rows.len(),
            inode_count: inodes.len(),
            saveable_bytes: 64 * (inodes.len() as u64 - 1),
            rows,
        }
    }

    #[test]
    fn canonical_is_lowest_inode_then_shortest_then_lexicographic() {
        let g = group(vec![
            row("/m/long/name/b", 2),
            row("/m/zz", 1),
            row("/m/aa", 1),
        ]);
        let actions = actions_for_group(&g);
        // Canonical is /m/aa (inode 1, lexicographically before /m/zz).
        assert!(actions.iter().all(|a| a.source_path == "/m/aa"));
        let hardlinks: Vec<_> = actions
            .iter()
            .filter(|a| a.action_type == ActionType::Hardlink)
            .collect();
        assert_eq!(hardlinks.len(), 1);
        assert_eq!(hardlinks[0].target_path, "/m/long/name/b");
        assert_eq!(hardlinks[0].bytes_saveable, 64);
    }

    #[test]
    fn already_linked_paths_become_noops() {
        let g = group(vec![row("/m/a", 1), row("/m/b", 1), row("/m/c", 2)]);
        let actions = actions_for_group(&g);
        let noops: Vec<_> = actions
            .iter()
            .filter(|a| a.action_type == ActionType::Noop)
            .collect();
        assert_eq!(noops.len(), 1);
        assert_eq!(noops[0].target_path, "/m/b");
        assert_eq!(noops[0].bytes_saveable, 0);
    }

    #[test]
    fn one_representative_per_duplicate_inode() {
        // Inode 2 has two paths; only the shortest becomes a target.
        let g = group(vec![row("/m/a", 1), row("/m/bb", 2), row("/m/bb-twin", 2)]);
        let actions = actions_for_group(&g);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].target_path, "/m/bb");
    }

    #[test]
    fn planning_is_deterministic() {
        let g = group(vec![row("/m/c", 3), row("/m/b", 2), row("/m/a", 1)]);
        let first = actions_for_group(&g);
        let second = actions_for_group(&g);
        let fingerprint = |actions: &[NewAction]| {
            actions
                .iter()
                .map(|a| format!("{}:{}->{}", a.action_type.as_str(), a.source_path, a.target_path))
                .collect::<Vec<_>>()
        };
        assert_eq!(fingerprint(&first), fingerprint(&second));
        // No path appears as both source and target; targets are unique.
        for a in &first {
            assert!(first.iter().all(|b| b.target_path != a.source_path));
        }
        let mut targets: Vec<_> = first.iter().map(|a| a.target_path.clone()).collect();
        targets.sort();
        targets.dedup();
        assert_eq!(targets.len(), first.len());
    }
}
