//! Incremental scanner.
//!
//! Walks a root, canonicalizes every entry, and compares `(size, mtime)`
//! against the catalog so a rescan touches only what changed. Hashing is
//! the parallelism frontier: a bounded worker pool computes digests while
//! the scan thread owns every catalog write and commits batches of ~500
//! rows, each batch one transaction. A crash mid-scan leaves each path at
//! its previous or new state, never half-hashed.
//!
//! Per-file failures (vanished, permission, I/O) are logged and the row
//! keeps its prior state; a catalog commit failure aborts the scan.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::catalog::files::{FileRecord, FileRow, ScanWrite};
use crate::catalog::{Catalog, ScanCounters};
use crate::device::{Device, register_or_resolve};
use crate::error::{HashallError, Result};
use crate::hash::{HashMode, full_hash, quick_hash};

/// Cooperative cancel signal, checked between files.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub hash_mode: HashMode,
    /// Hash worker threads; 0 means one per logical CPU.
    pub workers: usize,
    /// Rows per catalog transaction.
    pub batch_size: usize,
    /// Show an indicatif progress spinner.
    pub progress: bool,
    pub cancel: CancelToken,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            hash_mode: HashMode::Fast,
            workers: 0,
            batch_size: 500,
            progress: false,
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ScanStats {
    pub device_id: u64,
    pub scan_id: i64,
    pub files_seen: u64,
    pub added: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub deleted: u64,
    pub errors: u64,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Added,
    Updated,
    /// Unchanged row whose missing full hash is being filled in.
    FillSha,
}

#[derive(Debug)]
struct HashJob {
    live_path: PathBuf,
    catalog_path: String,
    size: u64,
    mtime: f64,
    inode: u64,
    kind: JobKind,
    wants_full: bool,
}

#[derive(Debug)]
struct HashOutcome {
    job: HashJob,
    quick: Option<String>,
    full: Option<String>,
    error: Option<HashallError>,
}

/// How the scanner treats one observed file.
#[derive(Debug, PartialEq, Eq)]
enum Classification {
    Unchanged { needs_full: bool },
    Updated,
    Added,
}

fn classify(row: Option<&FileRow>, size: u64, mtime: f64, mode: HashMode) -> Classification {
    match row {
        Some(row) if row.quick_hash.is_some() && row.size == size && row.mtime == mtime => {
            let needs_full = row.sha256.is_none()
                && matches!(mode, HashMode::Full | HashMode::Upgrade);
            Classification::Unchanged { needs_full }
        }
        Some(_) => Classification::Updated,
        None => Classification::Added,
    }
}

/// Modification time as unix seconds, the catalog's representation.
///
/// Computed identically everywhere so an unchanged file always compares
/// equal to its stored value.
pub(crate) fn mtime_seconds(metadata: &std::fs::Metadata) -> f64 {
    use std::os::unix::fs::MetadataExt;
    metadata.mtime() as f64 + metadata.mtime_nsec() as f64 * 1e-9
}

/// Scan `root`, updating the catalog. Returns the session counters.
pub fn scan(catalog: &mut Catalog, root: &Path, options: &ScanOptions) -> Result<ScanStats> {
    let device = register_or_resolve(catalog, root)?;
    let canonical_root =
        fs::canonicalize(root).map_err(|e| crate::error::io_file_error(root, e))?;
    let root_catalog = device.to_catalog_path(&canonical_root);

    catalog.ensure_files_table(device.device_id)?;
    catalog.upsert_scan_root(device.device_id, &root_catalog)?;
    let scan_id = catalog.create_scan_session(device.device_id, &root_catalog)?;
    info!(
        root = %canonical_root.display(),
        device_id = device.device_id,
        scan_id,
        mode = ?options.hash_mode,
        "scan started"
    );

    let workers = if options.workers == 0 {
        num_cpus::get()
    } else {
        options.workers
    };
    let (job_tx, job_rx) = bounded::<HashJob>(workers * 2);
    let (result_tx, result_rx) = bounded::<HashOutcome>(workers * 2);
    let pool = spawn_workers(workers, job_rx, result_tx);

    let outcome = run_walk(
        catalog,
        &device,
        &canonical_root,
        scan_id,
        options,
        job_tx,
        &result_rx,
    );
    // Dropping the receiver unblocks any worker still trying to hand back
    // a result after an aborted walk.
    drop(result_rx);
    for handle in pool {
        let _ = handle.join();
    }

    let mut stats = outcome?;
    stats.device_id = device.device_id;
    stats.scan_id = scan_id;

    if !stats.cancelled {
        stats.deleted = catalog.mark_deleted_under(device.device_id, &root_catalog, scan_id)?;
    }

    let status = if stats.cancelled { "cancelled" } else { "completed" };
    catalog.finish_scan_session(scan_id, status, &counters_of(&stats))?;
    info!(
        added = stats.added,
        updated = stats.updated,
        unchanged = stats.unchanged,
        deleted = stats.deleted,
        errors = stats.errors,
        status,
        "scan finished"
    );
    Ok(stats)
}

fn counters_of(stats: &ScanStats) -> ScanCounters {
    ScanCounters {
        files_seen: stats.files_seen,
        added: stats.added,
        updated: stats.updated,
        deleted: stats.deleted,
        unchanged: stats.unchanged,
        errors: stats.errors,
    }
}

fn spawn_workers(
    workers: usize,
    job_rx: Receiver<HashJob>,
    result_tx: Sender<HashOutcome>,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|i| {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            std::thread::Builder::new()
                .name(format!("hash-worker-{i}"))
                .spawn(move || {
                    for job in job_rx.iter() {
                        let outcome = run_hash_job(job);
                        if result_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                })
                .expect("spawn hash worker")
        })
        .collect()
}

fn run_hash_job(job: HashJob) -> HashOutcome {
    let mut quick = None;
    let mut full = None;
    let mut error = None;

    if job.kind != JobKind::FillSha {
        match quick_hash(&job.live_path) {
            Ok(h) => quick = Some(h),
            Err(e) => error = Some(e),
        }
    }
    if error.is_none() && job.wants_full {
        match full_hash(&job.live_path) {
            Ok(h) => full = Some(h),
            Err(e) => error = Some(e),
        }
    }
    HashOutcome {
        job,
        quick,
        full,
        error,
    }
}

struct WalkState<'a> {
    batch: Vec<ScanWrite>,
    stats: ScanStats,
    in_flight: usize,
    device_id: u64,
    scan_id: i64,
    batch_size: usize,
    progress: &'a ProgressBar,
    /// Canonical paths already handled this session. Symlink aliases and
    /// bind-mount replicas resolve to a path that was (or will be) walked
    /// directly; the first observation wins.
    seen: std::collections::HashSet<String>,
}

impl WalkState<'_> {
    fn absorb(&mut self, outcome: HashOutcome) {
        self.in_flight -= 1;
        let job = outcome.job;
        if let Some(err) = outcome.error {
            warn!(path = %job.live_path.display(), %err, "hash failed; row left untouched");
            self.stats.errors += 1;
            // The file was still observed; keep it out of deletion scope.
            if job.kind != JobKind::Added {
                self.batch.push(ScanWrite::Touch {
                    path: job.catalog_path,
                });
            }
            return;
        }
        match job.kind {
            JobKind::FillSha => {
                if let Some(sha) = outcome.full {
                    self.batch.push(ScanWrite::SetSha256 {
                        path: job.catalog_path,
                        sha256: sha,
                    });
                }
            }
            kind => {
                match kind {
                    JobKind::Added => self.stats.added += 1,
                    JobKind::Updated => self.stats.updated += 1,
                    JobKind::FillSha => unreachable!(),
                }
                self.batch.push(ScanWrite::Upsert(FileRecord {
                    path: job.catalog_path,
                    size: job.size,
                    mtime: job.mtime,
                    inode: job.inode,
                    quick_hash: outcome.quick,
                    sha256: outcome.full,
                }));
            }
        }
    }

    fn flush_due(&self) -> bool {
        self.batch.len() >= self.batch_size
    }
}

fn flush(catalog: &mut Catalog, state: &mut WalkState<'_>) -> Result<()> {
    if state.batch.is_empty() {
        return Ok(());
    }
    let writes = std::mem::take(&mut state.batch);
    debug!(rows = writes.len(), "committing scan batch");
    catalog.apply_scan_batch(state.device_id, state.scan_id, &writes)
}

#[allow(clippy::too_many_arguments)]
fn run_walk(
    catalog: &mut Catalog,
    device: &Device,
    canonical_root: &Path,
    scan_id: i64,
    options: &ScanOptions,
    job_tx: Sender<HashJob>,
    result_rx: &Receiver<HashOutcome>,
) -> Result<ScanStats> {
    let progress = if options.progress {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {pos} files {msg}")
                .expect("progress template"),
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut state = WalkState {
        batch: Vec::with_capacity(options.batch_size),
        stats: ScanStats::default(),
        in_flight: 0,
        device_id: device.device_id,
        scan_id,
        batch_size: options.batch_size,
        progress: &progress,
        seen: std::collections::HashSet::new(),
    };

    let walker = ignore::WalkBuilder::new(canonical_root)
        .standard_filters(false)
        .follow_links(true)
        .build();

    for entry in walker {
        if options.cancel.is_cancelled() {
            state.stats.cancelled = true;
            break;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, "walk error");
                state.stats.errors += 1;
                continue;
            }
        };
        // Symlinks are resolved in visit_file; anything that is not a
        // regular file after resolution is dropped there.
        let candidate = entry
            .file_type()
            .is_some_and(|t| t.is_file() || t.is_symlink());
        if !candidate {
            continue;
        }

        if let Err(err) = visit_file(
            catalog,
            device,
            canonical_root,
            options,
            &job_tx,
            result_rx,
            &mut state,
            entry.path(),
        ) {
            if err.is_per_file_recoverable() {
                warn!(path = %entry.path().display(), %err, "skipping file");
                state.stats.errors += 1;
                continue;
            }
            // Commit failures and the like abort the scan.
            let _ = catalog.finish_scan_session(scan_id, "failed", &counters_of(&state.stats));
            return Err(err);
        }

        if state.flush_due() {
            flush(catalog, &mut state)?;
        }
    }

    // No more jobs; drain everything still in flight.
    drop(job_tx);
    while state.in_flight > 0 {
        match result_rx.recv() {
            Ok(outcome) => state.absorb(outcome),
            Err(_) => break,
        }
        if state.flush_due() {
            flush(catalog, &mut state)?;
        }
    }
    flush(catalog, &mut state)?;
    progress.finish_and_clear();
    Ok(state.stats)
}

#[allow(clippy::too_many_arguments)]
fn visit_file(
    catalog: &Catalog,
    device: &Device,
    canonical_root: &Path,
    options: &ScanOptions,
    job_tx: &Sender<HashJob>,
    result_rx: &Receiver<HashOutcome>,
    state: &mut WalkState<'_>,
    path: &Path,
) -> Result<()> {
    let canonical = fs::canonicalize(path).map_err(|e| crate::error::io_file_error(path, e))?;
    // Bind-mount replicas resolve outside the scanned subtree; the first
    // observed spelling wins.
    if !canonical.starts_with(canonical_root) {
        debug!(path = %path.display(), resolved = %canonical.display(), "outside root, skipped");
        return Ok(());
    }

    let metadata = fs::metadata(&canonical).map_err(|e| crate::error::io_file_error(&canonical, e))?;
    if !metadata.is_file() {
        return Ok(());
    }
    use std::os::unix::fs::MetadataExt;
    let size = metadata.len();
    let mtime = mtime_seconds(&metadata);
    let inode = metadata.ino();

    let catalog_path = device.to_catalog_path(&canonical);
    if !state.seen.insert(catalog_path.clone()) {
        return Ok(());
    }

    state.stats.files_seen += 1;
    state.progress.inc(1);
    if let Some(name) = canonical.file_name() {
        state.progress.set_message(name.to_string_lossy().into_owned());
    }

    let row = catalog.lookup_file(device.device_id, &catalog_path)?;

    match classify(row.as_ref(), size, mtime, options.hash_mode) {
        Classification::Unchanged { needs_full } => {
            state.stats.unchanged += 1;
            state.batch.push(ScanWrite::Touch {
                path: catalog_path.clone(),
            });
            if needs_full {
                submit(
                    job_tx,
                    result_rx,
                    state,
                    HashJob {
                        live_path: canonical,
                        catalog_path,
                        size,
                        mtime,
                        inode,
                        kind: JobKind::FillSha,
                        wants_full: true,
                    },
                )?;
            }
        }
        kind @ (Classification::Updated | Classification::Added) => {
            let kind = if kind == Classification::Added {
                JobKind::Added
            } else {
                JobKind::Updated
            };
            submit(
                job_tx,
                result_rx,
                state,
                HashJob {
                    live_path: canonical,
                    catalog_path,
                    size,
                    mtime,
                    inode,
                    kind,
                    wants_full: options.hash_mode == HashMode::Full,
                },
            )?;
        }
    }
    Ok(())
}

/// Hand a job to the pool without deadlocking: when the job queue is full,
/// absorb finished results until a slot frees up.
fn submit(
    job_tx: &Sender<HashJob>,
    result_rx: &Receiver<HashOutcome>,
    state: &mut WalkState<'_>,
    job: HashJob,
) -> Result<()> {
    // Opportunistically drain whatever is already done.
    while let Ok(outcome) = result_rx.try_recv() {
        state.absorb(outcome);
    }

    let mut pending = Some(job);
    while let Some(job) = pending.take() {
        match job_tx.try_send(job) {
            Ok(()) => state.in_flight += 1,
            Err(TrySendError::Full(job)) => {
                if let Ok(outcome) = result_rx.recv_timeout(Duration::from_millis(200)) {
                    state.absorb(outcome);
                }
                pending = Some(job);
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(HashallError::InvalidArgument(
                    "hash worker pool shut down unexpectedly".into(),
                ));
            }
        }
    }
    Ok(())
}
