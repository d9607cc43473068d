//! Device registry: stable filesystem identity.
//!
//! The kernel device number is volatile across reboots and remounts, so a
//! filesystem is identified by a stable `fs_uuid` (ZFS pool GUID, blkid
//! UUID, or a deterministic synthetic UUID when neither probe works). The
//! registry maps a scan root to its device row, renames the per-device file
//! table when the kernel id drifts, and keeps `preferred_mount_point` as
//! the canonical spelling for catalog paths across remount drift.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::error::{HashallError, Result};

#[derive(Debug, Clone)]
pub struct Device {
    pub fs_uuid: String,
    pub device_id: u64,
    pub mount_point: PathBuf,
    pub preferred_mount_point: PathBuf,
    pub fs_type: String,
    pub alias: Option<String>,
    pub registered_at: f64,
    pub updated_at: f64,
}

impl Device {
    /// Rewrite a path observed under the live mount point to the canonical
    /// spelling stored in the catalog.
    pub fn to_catalog_path(&self, path: &Path) -> String {
        if self.mount_point != self.preferred_mount_point {
            if let Ok(rest) = path.strip_prefix(&self.mount_point) {
                return self.preferred_mount_point.join(rest).to_string_lossy().into_owned();
            }
        }
        path.to_string_lossy().into_owned()
    }

    /// Map a stored catalog path back to the live filesystem, honoring
    /// remount drift.
    pub fn to_live_path(&self, catalog_path: &str) -> PathBuf {
        let path = Path::new(catalog_path);
        if self.mount_point != self.preferred_mount_point {
            if let Ok(rest) = path.strip_prefix(&self.preferred_mount_point) {
                return self.mount_point.join(rest);
            }
        }
        path.to_path_buf()
    }

    /// Spellings to try when resolving an operator-supplied path against the
    /// catalog: preferred first, then the live mount.
    pub fn lookup_candidates(&self, path: &Path) -> Vec<String> {
        let mut candidates = vec![self.to_catalog_path(path)];
        let live = path.to_string_lossy().into_owned();
        if !candidates.contains(&live) {
            candidates.push(live);
        }
        candidates
    }
}

/// Mount-table entry backing a path.
#[derive(Debug, Clone)]
struct MountEntry {
    source: String,
    mount_point: PathBuf,
    fs_type: String,
}

/// Kernel device number of the filesystem holding `path`.
pub fn device_number(path: &Path) -> Result<u64> {
    use std::os::unix::fs::MetadataExt;
    let metadata = fs::metadata(path).map_err(|e| crate::error::io_file_error(path, e))?;
    Ok(metadata.dev())
}

/// Resolve `root` to its device row, registering the filesystem on first
/// sight and tracking kernel device-number drift.
pub fn register_or_resolve(catalog: &mut Catalog, root: &Path) -> Result<Device> {
    let canonical = fs::canonicalize(root).map_err(|e| crate::error::io_file_error(root, e))?;
    let dev = device_number(&canonical)?;
    let mount = find_mount(dev, &canonical)?;
    let fs_uuid = probe_fs_uuid(&mount);

    if let Some(existing) = catalog.device_by_uuid(&fs_uuid)? {
        if existing.device_id != dev {
            if let Some(holder) = catalog.device_by_device_id(dev)? {
                return Err(HashallError::AmbiguousDevice(format!(
                    "device number {dev} at {} is already registered as '{}' but probing \
                     yields '{fs_uuid}'",
                    mount.mount_point.display(),
                    holder.fs_uuid,
                )));
            }
            info!(
                fs_uuid = %fs_uuid,
                old = existing.device_id,
                new = dev,
                "kernel device number changed; renaming file table"
            );
            catalog.update_device_id(&fs_uuid, existing.device_id, dev)?;
        }
        catalog.refresh_mount_point(&fs_uuid, &mount.mount_point)?;
        let mut device = existing;
        device.device_id = dev;
        device.mount_point = mount.mount_point;
        return Ok(device);
    }

    if let Some(holder) = catalog.device_by_device_id(dev)? {
        // The device number is taken by a row whose uuid no longer matches
        // what the filesystem reports.
        if holder.mount_point == mount.mount_point {
            return Err(HashallError::UnstableIdentity(format!(
                "{} previously probed as '{}' but now reports '{fs_uuid}'",
                mount.mount_point.display(),
                holder.fs_uuid,
            )));
        }
        return Err(HashallError::AmbiguousDevice(format!(
            "device number {dev} is registered for '{}' mounted at {}, but {} probes as \
             '{fs_uuid}'",
            holder.fs_uuid,
            holder.mount_point.display(),
            mount.mount_point.display(),
        )));
    }

    let device = Device {
        fs_uuid: fs_uuid.clone(),
        device_id: dev,
        mount_point: mount.mount_point.clone(),
        preferred_mount_point: mount.mount_point.clone(),
        fs_type: mount.fs_type.clone(),
        alias: None,
        registered_at: 0.0,
        updated_at: 0.0,
    };
    catalog.insert_device(&device)?;
    info!(
        fs_uuid = %fs_uuid,
        device_id = dev,
        mount = %mount.mount_point.display(),
        fs_type = %mount.fs_type,
        "registered device"
    );
    catalog
        .device_by_uuid(&fs_uuid)?
        .ok_or_else(|| HashallError::NotFound(format!("device '{fs_uuid}'")))
}

/// Longest mount-table entry that contains `path` and stats to `dev`.
fn find_mount(dev: u64, path: &Path) -> Result<MountEntry> {
    let table = fs::read_to_string("/proc/self/mounts")?;
    let mut best: Option<MountEntry> = None;
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(mount_point), Some(fs_type)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let mount_point = PathBuf::from(unescape_mount_field(mount_point));
        if !path.starts_with(&mount_point) {
            continue;
        }
        let Ok(meta) = fs::metadata(&mount_point) else {
            continue;
        };
        use std::os::unix::fs::MetadataExt;
        if meta.dev() != dev {
            continue;
        }
        let longer = best
            .as_ref()
            .is_none_or(|b| mount_point.as_os_str().len() > b.mount_point.as_os_str().len());
        if longer {
            best = Some(MountEntry {
                source: unescape_mount_field(source),
                mount_point,
                fs_type: fs_type.to_string(),
            });
        }
    }
    best.ok_or_else(|| {
        HashallError::NotFound(format!("mount entry for {} (dev {dev})", path.display()))
    })
}

/// Stable filesystem UUID for a mount: ZFS pool GUID, then blkid-style
/// by-uuid symlinks, then a deterministic synthetic UUID.
fn probe_fs_uuid(mount: &MountEntry) -> String {
    if mount.fs_type == "zfs" {
        if let Some(guid) = zpool_guid(&mount.source) {
            return format!("zfs-{guid}");
        }
    }
    if mount.source.starts_with("/dev/") {
        if let Some(uuid) = by_uuid_lookup(&mount.source) {
            return uuid;
        }
    }
    synthetic_uuid(&mount.mount_point, &mount.fs_type)
}

fn zpool_guid(dataset: &str) -> Option<String> {
    let pool = dataset.split('/').next()?;
    let output = Command::new("zpool")
        .args(["get", "-H", "-o", "value", "guid", pool])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let guid = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if guid.is_empty() || guid == "-" {
        return None;
    }
    Some(guid)
}

fn by_uuid_lookup(source: &str) -> Option<String> {
    let source_real = fs::canonicalize(source).ok()?;
    let entries = fs::read_dir("/dev/disk/by-uuid").ok()?;
    for entry in entries.flatten() {
        let Ok(target) = fs::canonicalize(entry.path()) else {
            continue;
        };
        if target == source_real {
            return Some(entry.file_name().to_string_lossy().into_owned());
        }
    }
    None
}

/// Deterministic fallback identity for filesystems without a probeable
/// UUID. Derived from the mount point and type, so re-probing a stable
/// mount yields the same value.
fn synthetic_uuid(mount_point: &Path, fs_type: &str) -> String {
    let seed = format!("hashall:{}:{}", mount_point.display(), fs_type);
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes());
    debug!(mount = %mount_point.display(), fs_type, %uuid, "synthetic fs uuid");
    uuid.to_string()
}

/// `\040`-style octal escapes used by the kernel mount table.
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) => out.push(byte as char),
            Err(_) => {
                out.push('\\');
                out.push_str(&digits);
            }
        }
    }
    out
}
