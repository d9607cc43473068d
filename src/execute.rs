//! Plan executor.
//!
//! Consumes a persisted plan one action at a time, single-threaded so
//! rollback reasoning stays local. Every `HARDLINK` action passes an
//! existence check, a device-boundary check, an already-linked check, and
//! content verification before the filesystem is touched; the replacement
//! itself runs with a `target.bak` hardlink so any mid-flight failure can
//! be rolled back. An action's catalog status is written only after its
//! filesystem step has succeeded or been rolled back, which is what makes
//! a killed execution resumable.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::catalog::plans::{ActionStatus, ActionType, LinkAction, Plan, PlanStatus};
use crate::device::Device;
use crate::error::{HashallError, Result};
use crate::hash::{full_hash, sample_hash};
use crate::scan::{CancelToken, mtime_seconds};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Re-check `(size, mtime)` against the catalog and compare sampled
    /// windows of source and target.
    Fast,
    /// Full SHA-256 of both files, compared to the action's recorded hash.
    Paranoid,
    /// No verification; operator opt-in.
    None,
}

impl FromStr for VerifyMode {
    type Err = HashallError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fast" => Ok(VerifyMode::Fast),
            "paranoid" => Ok(VerifyMode::Paranoid),
            "none" => Ok(VerifyMode::None),
            other => Err(HashallError::InvalidArgument(format!(
                "unknown verify mode '{other}' (expected fast|paranoid|none)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub verify: VerifyMode,
    pub dry_run: bool,
    pub no_backup: bool,
    /// Bound on actions attempted in this invocation; the rest stay
    /// pending and the plan resumes later.
    pub limit: Option<usize>,
    pub cancel: CancelToken,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            verify: VerifyMode::Fast,
            dry_run: false,
            no_backup: false,
            limit: None,
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ExecuteStats {
    pub attempted: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub bytes_saved: u64,
    pub remaining_pending: u64,
    pub dry_run: bool,
    pub plan_status: Option<PlanStatus>,
}

/// What one action resolved to.
enum Outcome {
    Executed { bytes: u64 },
    Skipped(String),
    Failed(String),
}

/// Execute the pending actions of a plan.
pub fn execute(catalog: &mut Catalog, plan_id: i64, options: &ExecuteOptions) -> Result<ExecuteStats> {
    let plan = catalog.get_plan(plan_id)?;
    if plan.status.is_terminal() {
        return Err(HashallError::PlanTerminal(plan_id));
    }
    let device = catalog
        .device_by_device_id(plan.device_id)?
        .ok_or_else(|| {
            HashallError::NotFound(format!(
                "device {} for plan {plan_id}; rescan the filesystem first",
                plan.device_id
            ))
        })?;

    let pending: Vec<LinkAction> = catalog
        .plan_actions(plan_id)?
        .into_iter()
        .filter(|a| a.status == ActionStatus::Pending)
        .collect();

    let mut stats = ExecuteStats {
        dry_run: options.dry_run,
        ..Default::default()
    };
    if pending.is_empty() {
        stats.plan_status = Some(finalize(catalog, &plan, options, false)?);
        return Ok(stats);
    }

    if !options.dry_run {
        catalog.set_plan_status(plan_id, PlanStatus::InProgress)?;
    }
    info!(
        plan_id,
        pending = pending.len(),
        dry_run = options.dry_run,
        verify = ?options.verify,
        "plan execution started"
    );

    let mut cancelled = false;
    for action in &pending {
        if options.cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        if let Some(limit) = options.limit {
            if stats.attempted >= limit as u64 {
                break;
            }
        }
        stats.attempted += 1;

        let outcome = run_action(catalog, &device, action, options)?;
        match &outcome {
            Outcome::Executed { bytes } => {
                stats.executed += 1;
                stats.bytes_saved += bytes;
            }
            Outcome::Skipped(reason) => {
                stats.skipped += 1;
                info!(action_id = action.action_id, reason = %reason, "action skipped");
            }
            Outcome::Failed(reason) => {
                stats.failed += 1;
                warn!(action_id = action.action_id, reason = %reason, "action failed");
            }
        }

        if !options.dry_run {
            let (status, message) = match &outcome {
                Outcome::Executed { .. } => (ActionStatus::Executed, None),
                Outcome::Skipped(reason) => (ActionStatus::Skipped, Some(reason.as_str())),
                Outcome::Failed(reason) => (ActionStatus::Failed, Some(reason.as_str())),
            };
            catalog.set_action_result(action.action_id, status, message)?;
        }
    }

    stats.remaining_pending = catalog
        .plan_actions(plan_id)?
        .iter()
        .filter(|a| a.status == ActionStatus::Pending)
        .count() as u64;
    stats.plan_status = Some(finalize(catalog, &plan, options, cancelled)?);
    info!(
        plan_id,
        executed = stats.executed,
        failed = stats.failed,
        skipped = stats.skipped,
        bytes_saved = stats.bytes_saved,
        remaining = stats.remaining_pending,
        "plan execution finished"
    );
    Ok(stats)
}

/// Settle the plan's status after a run. Dry runs leave it untouched.
fn finalize(
    catalog: &Catalog,
    plan: &Plan,
    options: &ExecuteOptions,
    cancelled: bool,
) -> Result<PlanStatus> {
    if options.dry_run {
        return Ok(plan.status);
    }
    let refreshed = catalog.refresh_plan_counters(plan.plan_id)?;
    let still_pending = catalog
        .plan_actions(plan.plan_id)?
        .iter()
        .any(|a| a.status == ActionStatus::Pending);

    let status = if cancelled || still_pending {
        PlanStatus::InProgress
    } else if refreshed.failed > 0 {
        PlanStatus::Failed
    } else {
        PlanStatus::Completed
    };
    catalog.set_plan_status(plan.plan_id, status)?;
    Ok(status)
}

fn run_action(
    catalog: &Catalog,
    device: &Device,
    action: &LinkAction,
    options: &ExecuteOptions,
) -> Result<Outcome> {
    let source = device.to_live_path(&action.source_path);
    let target = device.to_live_path(&action.target_path);

    if action.action_type == ActionType::Noop {
        return Ok(Outcome::Skipped(
            HashallError::AlreadyLinked(target).to_string(),
        ));
    }

    // 1. Both paths must still exist.
    let (source_meta, target_meta) = match (fs::metadata(&source), fs::metadata(&target)) {
        (Ok(s), Ok(t)) => (s, t),
        (Err(_), _) => {
            return Ok(Outcome::Skipped(
                HashallError::FileVanished(source).to_string(),
            ));
        }
        (_, Err(_)) => {
            return Ok(Outcome::Skipped(
                HashallError::FileVanished(target).to_string(),
            ));
        }
    };

    // 2. Hardlinks cannot span filesystems; both sides must be on the
    // plan's device.
    use std::os::unix::fs::MetadataExt;
    if source_meta.dev() != device.device_id || target_meta.dev() != device.device_id {
        debug!(
            source_dev = source_meta.dev(),
            target_dev = target_meta.dev(),
            plan_dev = device.device_id,
            "device boundary check failed"
        );
        return Ok(Outcome::Failed(
            HashallError::CrossFilesystem {
                source_path: source,
                target_path: target,
            }
            .to_string(),
        ));
    }

    // 3. Nothing to do when the replacement already happened.
    if source_meta.ino() == target_meta.ino() {
        return Ok(Outcome::Skipped(
            HashallError::AlreadyLinked(target).to_string(),
        ));
    }

    // 4. Content verification, filesystem untouched on mismatch.
    if let Err(reason) = verify_action(
        catalog, device, action, &source, &source_meta, &target, &target_meta, options.verify,
    )? {
        return Ok(Outcome::Failed(
            HashallError::VerificationFailed(reason).to_string(),
        ));
    }

    if options.dry_run {
        return Ok(Outcome::Executed {
            bytes: action.bytes_saveable,
        });
    }

    // 5. Atomic replacement with backup/rollback.
    if let Err(err) = replace_with_link(&source, &target, options.no_backup) {
        return Ok(Outcome::Failed(err.to_string()));
    }

    // 6. Bookkeeping only after the filesystem step is settled.
    if let Some(source_row) = catalog.lookup_file(device.device_id, &action.source_path)? {
        catalog.record_relink(device.device_id, &action.target_path, &source_row)?;
    }
    Ok(Outcome::Executed {
        bytes: action.bytes_saveable,
    })
}

/// Step 4: compare content per the requested mode. `Ok(Err(reason))` is a
/// verification mismatch; `Err(_)` is an engine failure.
#[allow(clippy::too_many_arguments)]
fn verify_action(
    catalog: &Catalog,
    device: &Device,
    action: &LinkAction,
    source: &Path,
    source_meta: &fs::Metadata,
    target: &Path,
    target_meta: &fs::Metadata,
    mode: VerifyMode,
) -> Result<std::result::Result<(), String>> {
    match mode {
        VerifyMode::None => Ok(Ok(())),
        VerifyMode::Fast => {
            for (path, meta, catalog_path) in [
                (source, source_meta, &action.source_path),
                (target, target_meta, &action.target_path),
            ] {
                let Some(row) = catalog.lookup_file(device.device_id, catalog_path)? else {
                    return Ok(Err(format!("no catalog row for {}", path.display())));
                };
                if row.size != meta.len() || row.mtime != mtime_seconds(meta) {
                    return Ok(Err(format!(
                        "{} changed since planning (size/mtime drift)",
                        path.display()
                    )));
                }
            }
            let source_sample = match sample_hash(source) {
                Ok(h) => h,
                Err(err) => return Ok(Err(format!("hashing {} failed: {err}", source.display()))),
            };
            let target_sample = match sample_hash(target) {
                Ok(h) => h,
                Err(err) => return Ok(Err(format!("hashing {} failed: {err}", target.display()))),
            };
            if source_sample != target_sample {
                return Ok(Err("sampled content differs".into()));
            }
            Ok(Ok(()))
        }
        VerifyMode::Paranoid => {
            let source_sha = match full_hash(source) {
                Ok(h) => h,
                Err(err) => return Ok(Err(format!("hashing {} failed: {err}", source.display()))),
            };
            if source_sha != action.sha256 {
                return Ok(Err(format!("source hash {source_sha} != plan hash")));
            }
            let target_sha = match full_hash(target) {
                Ok(h) => h,
                Err(err) => return Ok(Err(format!("hashing {} failed: {err}", target.display()))),
            };
            if target_sha != action.sha256 {
                return Ok(Err(format!("target hash {target_sha} != plan hash")));
            }
            Ok(Ok(()))
        }
    }
}

fn backup_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_os_string();
    os.push(".bak");
    PathBuf::from(os)
}

/// Step 5: replace `target` with a hardlink to `source`.
///
/// With a backup: link `target.bak`, unlink `target`, link `target` to the
/// source inode, unlink the backup. Any failure after the unlink attempts
/// a rollback from the backup; whenever the backup stays behind for manual
/// recovery, the action fails with `RollbackLeftBackup`.
fn replace_with_link(source: &Path, target: &Path, no_backup: bool) -> Result<()> {
    let backup = backup_path(target);

    if !no_backup {
        if backup.exists() {
            // A leftover from an earlier run; never clobber the evidence.
            return Err(HashallError::RollbackLeftBackup(backup));
        }
        if let Err(err) = fs::hard_link(target, &backup) {
            return Err(HashallError::Io(io::Error::other(format!(
                "backup link failed: {err}"
            ))));
        }
    }

    if let Err(err) = fs::remove_file(target) {
        // Target is still intact; just drop the backup again.
        if !no_backup {
            let _ = fs::remove_file(&backup);
        }
        return Err(HashallError::Io(io::Error::other(format!(
            "unlink failed: {err}"
        ))));
    }

    if let Err(err) = fs::hard_link(source, target) {
        if no_backup {
            return Err(HashallError::Io(io::Error::other(format!(
                "link failed after unlink, no backup was taken: {err}"
            ))));
        }
        // Roll the target back from the backup.
        return match fs::hard_link(&backup, target) {
            Ok(()) => {
                let _ = fs::remove_file(&backup);
                Err(HashallError::Io(io::Error::other(format!(
                    "link failed, target restored from backup: {err}"
                ))))
            }
            Err(rollback_err) => {
                warn!(
                    link_error = %err,
                    rollback_error = %rollback_err,
                    backup = %backup.display(),
                    "link and rollback both failed"
                );
                Err(HashallError::RollbackLeftBackup(backup))
            }
        };
    }

    if !no_backup {
        if let Err(err) = fs::remove_file(&backup) {
            warn!(
                %err,
                backup = %backup.display(),
                "replacement succeeded but the backup could not be removed"
            );
            return Err(HashallError::RollbackLeftBackup(backup));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn backup_path_appends_suffix() {
        assert_eq!(
            backup_path(Path::new("/m/video.mkv")),
            PathBuf::from("/m/video.mkv.bak")
        );
    }

    #[test]
    fn replace_links_and_clears_backup() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("keep");
        let target = dir.path().join("dup");
        fs::write(&source, b"payload").unwrap();
        fs::write(&target, b"payload").unwrap();

        replace_with_link(&source, &target, false).unwrap();

        let source_ino = fs::metadata(&source).unwrap().ino();
        let target_ino = fs::metadata(&target).unwrap().ino();
        assert_eq!(source_ino, target_ino);
        assert!(!backup_path(&target).exists());
        assert_eq!(fs::read(&target).unwrap(), b"payload");
    }

    #[test]
    fn replace_refuses_leftover_backup() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("keep");
        let target = dir.path().join("dup");
        fs::write(&source, b"x").unwrap();
        fs::write(&target, b"x").unwrap();
        fs::write(backup_path(&target), b"stale").unwrap();

        let err = replace_with_link(&source, &target, false).unwrap_err();
        assert!(matches!(err, HashallError::RollbackLeftBackup(_)));
        assert!(err.to_string().contains(".bak"));
        // Target untouched.
        let (s, t) = (
            fs::metadata(&source).unwrap().ino(),
            fs::metadata(&target).unwrap().ino(),
        );
        assert_ne!(s, t);
    }

    #[test]
    fn missing_source_rolls_back_from_backup() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("gone");
        let target = dir.path().join("dup");
        fs::write(&target, b"precious").unwrap();

        // Source never existed: the link step fails after the unlink and
        // the backup restores the target.
        let err = replace_with_link(&source, &target, false).unwrap_err();
        assert!(err.to_string().contains("restored from backup"));
        assert!(target.exists());
        assert_eq!(fs::read(&target).unwrap(), b"precious");
        assert!(!backup_path(&target).exists());
    }

    #[test]
    fn verify_mode_parses() {
        assert_eq!(VerifyMode::from_str("fast").unwrap(), VerifyMode::Fast);
        assert_eq!(
            VerifyMode::from_str("paranoid").unwrap(),
            VerifyMode::Paranoid
        );
        assert_eq!(VerifyMode::from_str("none").unwrap(), VerifyMode::None);
        assert!(VerifyMode::from_str("careful").is_err());
    }
}
