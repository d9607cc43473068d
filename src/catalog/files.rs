//! Per-device file table operations.
//!
//! Each registered filesystem gets its own `files_<device_id>` table; the
//! scanner is the only writer during a scan session and flushes its work in
//! internally-transactional batches. Deletion detection is scoped by path
//! range: every observed row is stamped with the current scan id, and after
//! the walk rows under the scanned root with a stale stamp are marked
//! deleted. Rows outside the root are never touched by a partial scan.

use rusqlite::{OptionalExtension, params};

use super::Catalog;
use crate::error::{HashallError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Active,
    Deleted,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Active => "active",
            FileStatus::Deleted => "deleted",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "deleted" => FileStatus::Deleted,
            _ => FileStatus::Active,
        }
    }
}

/// One catalog row of a per-device file table.
#[derive(Debug, Clone)]
pub struct FileRow {
    pub path: String,
    pub size: u64,
    pub mtime: f64,
    pub inode: u64,
    pub quick_hash: Option<String>,
    pub sha256: Option<String>,
    pub status: FileStatus,
    pub last_seen_scan: Option<i64>,
}

/// Payload for a full row insert/replace during a scan.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub mtime: f64,
    pub inode: u64,
    pub quick_hash: Option<String>,
    pub sha256: Option<String>,
}

/// One unit of scanner output, committed in batches.
#[derive(Debug, Clone)]
pub enum ScanWrite {
    /// New or changed file: replace metadata and hashes.
    Upsert(FileRecord),
    /// Unchanged file: stamp the scan id only, hashes untouched.
    Touch { path: String },
    /// Unchanged file whose missing full hash was filled in (upgrade mode).
    SetSha256 { path: String, sha256: String },
}

const FILE_COLS: &str = "path, size, mtime, inode, quick_hash, sha256, status, last_seen_scan";

fn file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRow> {
    Ok(FileRow {
        path: row.get(0)?,
        size: row.get::<_, i64>(1)? as u64,
        mtime: row.get(2)?,
        inode: row.get::<_, i64>(3)? as u64,
        quick_hash: row.get(4)?,
        sha256: row.get(5)?,
        status: FileStatus::parse(&row.get::<_, String>(6)?),
        last_seen_scan: row.get(7)?,
    })
}

/// Half-open path range covering everything under `root`.
///
/// `'0'` is the successor of `'/'` in ASCII, so `[root + "/", root + "0")`
/// captures exactly the subtree in lexicographic order.
pub(crate) fn path_range(root: &str) -> (String, String) {
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() {
        return ("/".to_string(), "0".to_string());
    }
    (format!("{trimmed}/"), format!("{trimmed}0"))
}

impl Catalog {
    pub fn lookup_file(&self, device_id: u64, path: &str) -> Result<Option<FileRow>> {
        let table = Self::files_table(device_id);
        self.conn()
            .query_row(
                &format!("SELECT {FILE_COLS} FROM {table} WHERE path = ?1"),
                params![path],
                file_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Commit one scanner batch in a single transaction.
    pub fn apply_scan_batch(
        &mut self,
        device_id: u64,
        scan_id: i64,
        writes: &[ScanWrite],
    ) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let table = Self::files_table(device_id);
        let tx = self.conn_mut().transaction()?;
        {
            let mut upsert = tx.prepare_cached(&format!(
                "INSERT INTO {table} (path, size, mtime, inode, quick_hash, sha256, status, last_seen_scan)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7)
                 ON CONFLICT (path) DO UPDATE SET
                     size = excluded.size,
                     mtime = excluded.mtime,
                     inode = excluded.inode,
                     quick_hash = excluded.quick_hash,
                     sha256 = excluded.sha256,
                     status = 'active',
                     last_seen_scan = excluded.last_seen_scan"
            ))?;
            let mut touch = tx.prepare_cached(&format!(
                "UPDATE {table} SET status = 'active', last_seen_scan = ?1 WHERE path = ?2"
            ))?;
            let mut fill_sha = tx.prepare_cached(&format!(
                "UPDATE {table} SET sha256 = ?1, status = 'active', last_seen_scan = ?2
                 WHERE path = ?3"
            ))?;

            for write in writes {
                match write {
                    ScanWrite::Upsert(rec) => {
                        upsert.execute(params![
                            rec.path,
                            rec.size as i64,
                            rec.mtime,
                            rec.inode as i64,
                            rec.quick_hash,
                            rec.sha256,
                            scan_id,
                        ])?;
                    }
                    ScanWrite::Touch { path } => {
                        touch.execute(params![scan_id, path])?;
                    }
                    ScanWrite::SetSha256 { path, sha256 } => {
                        fill_sha.execute(params![sha256, scan_id, path])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Mark rows under `root` that were not observed by `scan_id` as deleted.
    pub fn mark_deleted_under(&self, device_id: u64, root: &str, scan_id: i64) -> Result<u64> {
        let table = Self::files_table(device_id);
        let (lo, hi) = path_range(root);
        let affected = self.conn().execute(
            &format!(
                "UPDATE {table} SET status = 'deleted'
                 WHERE path >= ?1 AND path < ?2
                   AND status = 'active'
                   AND (last_seen_scan IS NULL OR last_seen_scan != ?3)"
            ),
            params![lo, hi, scan_id],
        )?;
        Ok(affected as u64)
    }

    /// Persist a promoted full hash outside a scan session.
    pub fn set_sha256(&self, device_id: u64, path: &str, sha256: &str) -> Result<()> {
        let table = Self::files_table(device_id);
        let n = self.conn().execute(
            &format!("UPDATE {table} SET sha256 = ?1 WHERE path = ?2"),
            params![sha256, path],
        )?;
        if n == 0 {
            return Err(HashallError::NotFound(format!(
                "file row '{path}' on device {device_id}"
            )));
        }
        Ok(())
    }

    /// Rewrite a target row after it was hardlinked onto `source`.
    pub fn record_relink(&self, device_id: u64, target_path: &str, source: &FileRow) -> Result<()> {
        let table = Self::files_table(device_id);
        self.conn().execute(
            &format!(
                "UPDATE {table}
                 SET inode = ?1, size = ?2, mtime = ?3, quick_hash = ?4, sha256 = ?5
                 WHERE path = ?6"
            ),
            params![
                source.inode as i64,
                source.size as i64,
                source.mtime,
                source.quick_hash,
                source.sha256,
                target_path,
            ],
        )?;
        Ok(())
    }

    /// Active rows under `root`, ordered by path (ranged prefix iteration).
    pub fn rows_under(&self, device_id: u64, root: &str) -> Result<Vec<FileRow>> {
        let table = Self::files_table(device_id);
        let (lo, hi) = path_range(root);
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {FILE_COLS} FROM {table}
             WHERE path >= ?1 AND path < ?2 AND status = 'active'
             ORDER BY path"
        ))?;
        let rows = stmt.query_map(params![lo, hi], file_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Every active row of the device, ordered by path.
    pub fn active_rows(&self, device_id: u64) -> Result<Vec<FileRow>> {
        let table = Self::files_table(device_id);
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {FILE_COLS} FROM {table} WHERE status = 'active' ORDER BY path"
        ))?;
        let rows = stmt.query_map([], file_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Groups of two or more active rows sharing a quick hash.
    pub fn quick_hash_collisions(&self, device_id: u64) -> Result<Vec<Vec<FileRow>>> {
        let table = Self::files_table(device_id);
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {FILE_COLS} FROM {table}
             WHERE status = 'active' AND quick_hash IN (
                 SELECT quick_hash FROM {table}
                 WHERE status = 'active' AND quick_hash IS NOT NULL
                 GROUP BY quick_hash HAVING COUNT(*) > 1
             )
             ORDER BY quick_hash, path"
        ))?;
        let rows = stmt.query_map([], file_from_row)?;
        let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(group_by_key(rows, |row| row.quick_hash.clone()))
    }

    /// Groups of active, fully-hashed rows spanning two or more inodes, each
    /// row at least `min_size` bytes.
    pub fn duplicate_groups(&self, device_id: u64, min_size: u64) -> Result<Vec<Vec<FileRow>>> {
        let table = Self::files_table(device_id);
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {FILE_COLS} FROM {table}
             WHERE status = 'active' AND size >= ?1 AND sha256 IN (
                 SELECT sha256 FROM {table}
                 WHERE status = 'active' AND sha256 IS NOT NULL AND size >= ?1
                 GROUP BY sha256 HAVING COUNT(DISTINCT inode) > 1
             )
             ORDER BY sha256, inode, LENGTH(path), path"
        ))?;
        let rows = stmt.query_map(params![min_size as i64], file_from_row)?;
        let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(group_by_key(rows, |row| row.sha256.clone()))
    }

    /// How many active rows carry a full hash. Zero means dedup planning
    /// must not run on this device yet.
    pub fn count_full_hashed(&self, device_id: u64) -> Result<u64> {
        let table = Self::files_table(device_id);
        let n: i64 = self.conn().query_row(
            &format!(
                "SELECT COUNT(*) FROM {table} WHERE status = 'active' AND sha256 IS NOT NULL"
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Aggregates for the operator `stats` surface.
    pub fn file_table_stats(&self, device_id: u64) -> Result<FileTableStats> {
        let table = Self::files_table(device_id);
        self.conn()
            .query_row(
                &format!(
                    "SELECT
                         COUNT(*) FILTER (WHERE status = 'active'),
                         COUNT(*) FILTER (WHERE status = 'deleted'),
                         COUNT(*) FILTER (WHERE status = 'active' AND sha256 IS NOT NULL),
                         COALESCE(SUM(size) FILTER (WHERE status = 'active'), 0)
                     FROM {table}"
                ),
                [],
                |row| {
                    Ok(FileTableStats {
                        active: row.get::<_, i64>(0)? as u64,
                        deleted: row.get::<_, i64>(1)? as u64,
                        full_hashed: row.get::<_, i64>(2)? as u64,
                        active_bytes: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .map_err(Into::into)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FileTableStats {
    pub active: u64,
    pub deleted: u64,
    pub full_hashed: u64,
    pub active_bytes: u64,
}

fn group_by_key<K: PartialEq>(rows: Vec<FileRow>, key: impl Fn(&FileRow) -> K) -> Vec<Vec<FileRow>> {
    let mut groups: Vec<Vec<FileRow>> = Vec::new();
    for row in rows {
        match groups.last_mut() {
            Some(group) if key(&group[0]) == key(&row) => group.push(row),
            _ => groups.push(vec![row]),
        }
    }
    groups
}
