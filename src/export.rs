//! JSON export for archival: one object per device, stable field names,
//! absent hashes serialized as null.

use std::io::Write;

use serde::Serialize;

use crate::catalog::Catalog;
use crate::device::Device;
use crate::error::Result;

#[derive(Debug, Serialize)]
pub struct DeviceExport {
    pub device_id: u64,
    pub fs_uuid: String,
    pub root: String,
    pub files: Vec<FileExport>,
}

#[derive(Debug, Serialize)]
pub struct FileExport {
    pub path: String,
    pub size: u64,
    pub mtime: f64,
    pub inode: u64,
    pub quick_hash: Option<String>,
    pub sha256: Option<String>,
}

/// Snapshot the device's active rows.
pub fn export_device(catalog: &Catalog, device: &Device) -> Result<DeviceExport> {
    let rows = catalog.active_rows(device.device_id)?;
    Ok(DeviceExport {
        device_id: device.device_id,
        fs_uuid: device.fs_uuid.clone(),
        root: device.preferred_mount_point.to_string_lossy().into_owned(),
        files: rows
            .into_iter()
            .map(|row| FileExport {
                path: row.path,
                size: row.size,
                mtime: row.mtime,
                inode: row.inode,
                quick_hash: row.quick_hash,
                sha256: row.sha256,
            })
            .collect(),
    })
}

pub fn write_json<W: Write>(export: &DeviceExport, writer: W) -> Result<()> {
    serde_json::to_writer_pretty(writer, export)?;
    Ok(())
}
