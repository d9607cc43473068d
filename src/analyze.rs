//! Duplicate analysis over fully-hashed rows.

use crate::catalog::Catalog;
use crate::catalog::files::FileRow;
use crate::error::Result;

/// One dedup opportunity: active rows sharing a full hash across two or
/// more inodes.
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub sha256: String,
    /// Representative size; all members are byte-identical.
    pub size: u64,
    pub file_count: usize,
    pub inode_count: usize,
    /// `size × (inode_count − 1)`: copies already sharing an inode save
    /// nothing.
    pub saveable_bytes: u64,
    pub rows: Vec<FileRow>,
}

#[derive(Debug, Default)]
pub struct AnalyzeReport {
    pub groups: Vec<DuplicateGroup>,
    pub total_saveable: u64,
}

/// Group the device's hashed rows by content and report savings.
pub fn find_duplicates(catalog: &Catalog, device_id: u64, min_size: u64) -> Result<AnalyzeReport> {
    let raw = catalog.duplicate_groups(device_id, min_size)?;
    let mut report = AnalyzeReport::default();
    for rows in raw {
        let Some(sha256) = rows.first().and_then(|r| r.sha256.clone()) else {
            continue;
        };
        let size = rows[0].size;
        let mut inodes: Vec<u64> = rows.iter().map(|r| r.inode).collect();
        inodes.sort_unstable();
        inodes.dedup();
        let inode_count = inodes.len();
        let saveable_bytes = size * (inode_count as u64 - 1);
        report.total_saveable += saveable_bytes;
        report.groups.push(DuplicateGroup {
            sha256,
            size,
            file_count: rows.len(),
            inode_count,
            saveable_bytes,
            rows,
        });
    }
    Ok(report)
}
