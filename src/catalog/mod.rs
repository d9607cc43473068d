//! Persistent catalog store.
//!
//! One SQLite file (default `~/.hashall/catalog.db`, override `HASHALL_DB`)
//! holds every table: devices, scan roots, scan sessions, per-device file
//! tables, plans, and actions. The handle is threaded explicitly through the
//! engine; there is no ambient global.
//!
//! Schema changes are numbered, idempotent migrations applied in order on
//! open, tracked through `PRAGMA user_version`. Per-device file tables are
//! created lazily as `files_<device_id>` and renamed in one transaction when
//! a device's kernel id drifts.
//!
//! Concurrency: WAL keeps readers unblocked while one writer per device
//! table proceeds; a busy timeout absorbs transient contention and expiry
//! surfaces as the retryable `StoreBusy`.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::device::Device;
use crate::error::{HashallError, Result};

pub mod files;
pub mod plans;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Numbered migrations; index + 1 is the schema version they produce.
const MIGRATIONS: &[&str] = &[
    // v1: initial schema
    "
    CREATE TABLE IF NOT EXISTS devices (
        fs_uuid                TEXT PRIMARY KEY,
        device_id              INTEGER NOT NULL UNIQUE,
        mount_point            TEXT NOT NULL,
        preferred_mount_point  TEXT NOT NULL,
        fs_type                TEXT NOT NULL,
        alias                  TEXT UNIQUE,
        registered_at          REAL NOT NULL,
        updated_at             REAL NOT NULL
    );

    CREATE TABLE IF NOT EXISTS scan_roots (
        device_id     INTEGER NOT NULL,
        path          TEXT NOT NULL,
        last_scan_at  REAL,
        PRIMARY KEY (device_id, path)
    );

    CREATE TABLE IF NOT EXISTS scans (
        scan_id      INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id    INTEGER NOT NULL,
        root         TEXT NOT NULL,
        started_at   REAL NOT NULL,
        finished_at  REAL,
        files_seen   INTEGER NOT NULL DEFAULT 0,
        added        INTEGER NOT NULL DEFAULT 0,
        updated      INTEGER NOT NULL DEFAULT 0,
        deleted      INTEGER NOT NULL DEFAULT 0,
        unchanged    INTEGER NOT NULL DEFAULT 0,
        errors       INTEGER NOT NULL DEFAULT 0,
        status       TEXT NOT NULL DEFAULT 'running'
    );

    CREATE TABLE IF NOT EXISTS plans (
        plan_id               INTEGER PRIMARY KEY AUTOINCREMENT,
        name                  TEXT NOT NULL,
        device_id             INTEGER NOT NULL,
        status                TEXT NOT NULL DEFAULT 'pending',
        opportunities         INTEGER NOT NULL DEFAULT 0,
        total_bytes_saveable  INTEGER NOT NULL DEFAULT 0,
        executed              INTEGER NOT NULL DEFAULT 0,
        failed                INTEGER NOT NULL DEFAULT 0,
        skipped               INTEGER NOT NULL DEFAULT 0,
        bytes_saved           INTEGER NOT NULL DEFAULT 0,
        created_at            REAL NOT NULL,
        updated_at            REAL NOT NULL
    );

    CREATE TABLE IF NOT EXISTS actions (
        action_id       INTEGER PRIMARY KEY AUTOINCREMENT,
        plan_id         INTEGER NOT NULL REFERENCES plans(plan_id) ON DELETE CASCADE,
        action_type     TEXT NOT NULL,
        sha256          TEXT NOT NULL,
        source_path     TEXT NOT NULL,
        target_path     TEXT NOT NULL,
        bytes_saveable  INTEGER NOT NULL DEFAULT 0,
        status          TEXT NOT NULL DEFAULT 'pending',
        error_message   TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_actions_plan ON actions(plan_id, action_id);
    ",
];

pub struct Catalog {
    conn: Connection,
    path: PathBuf,
}

impl Catalog {
    /// Open (creating if needed) the catalog at `path` and bring its schema
    /// up to date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        let mut catalog = Self {
            conn,
            path: path.to_path_buf(),
        };
        catalog.migrate()?;
        Ok(catalog)
    }

    /// Open the catalog at `$HASHALL_DB`, falling back to
    /// `~/.hashall/catalog.db`.
    pub fn open_default() -> Result<Self> {
        let path = match std::env::var_os("HASHALL_DB") {
            Some(p) => PathBuf::from(p),
            None => {
                let home = std::env::var_os("HOME").ok_or_else(|| {
                    HashallError::InvalidArgument(
                        "HOME is unset; pass the catalog path via HASHALL_DB".into(),
                    )
                })?;
                PathBuf::from(home).join(".hashall").join("catalog.db")
            }
        };
        Self::open(&path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn migrate(&mut self) -> Result<()> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        for (idx, sql) in MIGRATIONS.iter().enumerate() {
            let target = idx as i64 + 1;
            if version >= target {
                continue;
            }
            let tx = self.conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.pragma_update(None, "user_version", target)?;
            tx.commit()?;
            debug!(version = target, "applied catalog migration");
        }
        Ok(())
    }

    /// Name of the per-device file table. Derived from the integer id only,
    /// never from user input.
    pub(crate) fn files_table(device_id: u64) -> String {
        format!("files_{device_id}")
    }

    /// Create the per-device file table if it does not exist yet.
    pub fn ensure_files_table(&self, device_id: u64) -> Result<()> {
        let table = Self::files_table(device_id);
        self.conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {table} (
                path            TEXT PRIMARY KEY,
                size            INTEGER NOT NULL,
                mtime           REAL NOT NULL,
                inode           INTEGER NOT NULL,
                quick_hash      TEXT,
                sha256          TEXT,
                status          TEXT NOT NULL DEFAULT 'active',
                last_seen_scan  INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_quick ON {table}(quick_hash);
            CREATE INDEX IF NOT EXISTS idx_{table}_sha ON {table}(sha256);
            CREATE INDEX IF NOT EXISTS idx_{table}_inode ON {table}(inode);
            "
        ))?;
        Ok(())
    }

    // ---- devices ----

    pub fn insert_device(&self, device: &Device) -> Result<()> {
        self.conn.execute(
            "INSERT INTO devices
                 (fs_uuid, device_id, mount_point, preferred_mount_point, fs_type,
                  registered_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                device.fs_uuid,
                device.device_id as i64,
                path_str(&device.mount_point),
                path_str(&device.preferred_mount_point),
                device.fs_type,
                now_ts(),
            ],
        )?;
        self.ensure_files_table(device.device_id)?;
        Ok(())
    }

    pub fn device_by_uuid(&self, fs_uuid: &str) -> Result<Option<Device>> {
        self.conn
            .query_row(
                &format!("SELECT {DEVICE_COLS} FROM devices WHERE fs_uuid = ?1"),
                params![fs_uuid],
                device_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn device_by_device_id(&self, device_id: u64) -> Result<Option<Device>> {
        self.conn
            .query_row(
                &format!("SELECT {DEVICE_COLS} FROM devices WHERE device_id = ?1"),
                params![device_id as i64],
                device_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Resolve an operator-supplied device selector: a kernel device id or
    /// an alias.
    pub fn device_by_selector(&self, selector: &str) -> Result<Device> {
        if let Ok(id) = selector.parse::<u64>() {
            if let Some(device) = self.device_by_device_id(id)? {
                return Ok(device);
            }
        }
        let by_alias = self
            .conn
            .query_row(
                &format!("SELECT {DEVICE_COLS} FROM devices WHERE alias = ?1"),
                params![selector],
                device_from_row,
            )
            .optional()?;
        by_alias.ok_or_else(|| HashallError::NotFound(format!("device '{selector}'")))
    }

    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DEVICE_COLS} FROM devices ORDER BY device_id"
        ))?;
        let rows = stmt.query_map([], device_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn set_device_alias(&self, fs_uuid: &str, alias: &str) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE devices SET alias = ?1, updated_at = ?2 WHERE fs_uuid = ?3",
            params![alias, now_ts(), fs_uuid],
        )?;
        if n == 0 {
            return Err(HashallError::NotFound(format!("device '{fs_uuid}'")));
        }
        Ok(())
    }

    pub fn refresh_mount_point(&self, fs_uuid: &str, mount_point: &Path) -> Result<()> {
        self.conn.execute(
            "UPDATE devices SET mount_point = ?1, updated_at = ?2 WHERE fs_uuid = ?3",
            params![path_str(mount_point), now_ts(), fs_uuid],
        )?;
        Ok(())
    }

    /// Track a kernel device-number change: rename `files_<old>` to
    /// `files_<new>` and update the device row, atomically.
    pub fn update_device_id(&mut self, fs_uuid: &str, old_id: u64, new_id: u64) -> Result<()> {
        let old_table = Self::files_table(old_id);
        let new_table = Self::files_table(new_id);
        let tx = self.conn.transaction()?;
        let has_old: Option<String> = tx
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![old_table],
                |row| row.get(0),
            )
            .optional()?;
        if has_old.is_some() {
            tx.execute_batch(&format!("ALTER TABLE {old_table} RENAME TO {new_table}"))?;
        }
        tx.execute(
            "UPDATE devices SET device_id = ?1, updated_at = ?2 WHERE fs_uuid = ?3",
            params![new_id as i64, now_ts(), fs_uuid],
        )?;
        tx.execute(
            "UPDATE scan_roots SET device_id = ?1 WHERE device_id = ?2",
            params![new_id as i64, old_id as i64],
        )?;
        tx.commit()?;
        debug!(fs_uuid, old_id, new_id, "device id drift tracked");
        Ok(())
    }

    // ---- scan roots & sessions ----

    pub fn upsert_scan_root(&self, device_id: u64, path: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO scan_roots (device_id, path, last_scan_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (device_id, path) DO UPDATE SET last_scan_at = excluded.last_scan_at",
            params![device_id as i64, path, now_ts()],
        )?;
        Ok(())
    }

    pub fn scan_roots(&self, device_id: u64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM scan_roots WHERE device_id = ?1 ORDER BY path")?;
        let rows = stmt.query_map(params![device_id as i64], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn create_scan_session(&self, device_id: u64, root: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO scans (device_id, root, started_at) VALUES (?1, ?2, ?3)",
            params![device_id as i64, root, now_ts()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn finish_scan_session(
        &self,
        scan_id: i64,
        status: &str,
        counters: &ScanCounters,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE scans
             SET finished_at = ?1, files_seen = ?2, added = ?3, updated = ?4,
                 deleted = ?5, unchanged = ?6, errors = ?7, status = ?8
             WHERE scan_id = ?9",
            params![
                now_ts(),
                counters.files_seen as i64,
                counters.added as i64,
                counters.updated as i64,
                counters.deleted as i64,
                counters.unchanged as i64,
                counters.errors as i64,
                status,
                scan_id,
            ],
        )?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Counters a scan session reports back into the `scans` table.
#[derive(Debug, Default, Clone)]
pub struct ScanCounters {
    pub files_seen: u64,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    pub unchanged: u64,
    pub errors: u64,
}

const DEVICE_COLS: &str =
    "fs_uuid, device_id, mount_point, preferred_mount_point, fs_type, alias, registered_at, updated_at";

fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        fs_uuid: row.get(0)?,
        device_id: row.get::<_, i64>(1)? as u64,
        mount_point: PathBuf::from(row.get::<_, String>(2)?),
        preferred_mount_point: PathBuf::from(row.get::<_, String>(3)?),
        fs_type: row.get(4)?,
        alias: row.get(5)?,
        registered_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub(crate) fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub(crate) fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
