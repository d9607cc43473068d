//! Scanner end-to-end scenarios: incremental rescan bookkeeping, collision
//! promotion, partial-scan safety, and device-id drift.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use hashall::catalog::Catalog;
use hashall::collide;
use hashall::device::register_or_resolve;
use hashall::hash::HashMode;
use hashall::scan::{ScanOptions, scan};

const SHA256_EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

// ---- Helpers ----

struct Fixture {
    /// Holds the catalog; separate from the scanned tree so the store's
    /// own files never show up in a scan.
    _store: TempDir,
    pub catalog: Catalog,
    pub data: TempDir,
}

fn fixture() -> Fixture {
    let store = TempDir::new().expect("store dir");
    let catalog = Catalog::open(&store.path().join("catalog.db")).expect("open catalog");
    let data = TempDir::new().expect("data dir");
    Fixture {
        _store: store,
        catalog,
        data,
    }
}

fn opts(mode: HashMode) -> ScanOptions {
    ScanOptions {
        hash_mode: mode,
        workers: 2,
        ..Default::default()
    }
}

fn write(dir: &Path, name: &str, bytes: &[u8]) {
    fs::write(dir.join(name), bytes).expect("write fixture file");
}

/// 1 MiB of `prefix` followed by `tail` repeated to 1 MiB.
fn shared_prefix_file(prefix: u8, tail: u8) -> Vec<u8> {
    let mib = 1024 * 1024;
    let mut bytes = vec![prefix; mib];
    bytes.extend(std::iter::repeat_n(tail, mib));
    bytes
}

// ---- Incremental rescan ----

#[test]
fn rescan_with_no_changes_is_a_no_op() {
    let mut fx = fixture();
    for i in 0..20 {
        write(fx.data.path(), &format!("file_{i}.dat"), format!("payload {i}").as_bytes());
    }

    let first = scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Fast)).unwrap();
    assert_eq!(first.added, 20);
    assert_eq!(first.updated, 0);
    assert_eq!(first.deleted, 0);

    let second = scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Fast)).unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.deleted, 0);
    assert_eq!(second.unchanged, 20);
}

#[test]
fn rescan_reports_adds_updates_and_deletes() {
    let mut fx = fixture();
    for i in 0..10 {
        write(fx.data.path(), &format!("f{i}"), b"original");
    }
    scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Fast)).unwrap();

    // mtime granularity is nanoseconds, but don't race the clock.
    std::thread::sleep(std::time::Duration::from_millis(20));
    write(fx.data.path(), "f0", b"rewritten");
    fs::remove_file(fx.data.path().join("f1")).unwrap();
    write(fx.data.path(), "f_new", b"brand new");

    let stats = scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Fast)).unwrap();
    assert_eq!(stats.added, 1);
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.unchanged, 8);
}

#[test]
fn update_clears_stale_full_hash() {
    let mut fx = fixture();
    write(fx.data.path(), "f", b"before");
    let stats = scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Full)).unwrap();

    let device = register_or_resolve(&mut fx.catalog, fx.data.path()).unwrap();
    let path = fs::canonicalize(fx.data.path().join("f")).unwrap();
    let row = fx
        .catalog
        .lookup_file(stats.device_id, &device.to_catalog_path(&path))
        .unwrap()
        .unwrap();
    assert!(row.sha256.is_some());

    std::thread::sleep(std::time::Duration::from_millis(20));
    write(fx.data.path(), "f", b"after, and longer");
    scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Fast)).unwrap();

    let row = fx
        .catalog
        .lookup_file(stats.device_id, &device.to_catalog_path(&path))
        .unwrap()
        .unwrap();
    assert!(row.sha256.is_none(), "stale sha256 must be cleared");
    assert!(row.quick_hash.is_some());
}

#[test]
fn partial_scan_does_not_delete_outside_its_root() {
    let mut fx = fixture();
    fs::create_dir(fx.data.path().join("a")).unwrap();
    fs::create_dir(fx.data.path().join("b")).unwrap();
    write(&fx.data.path().join("a"), "one", b"1");
    write(&fx.data.path().join("b"), "two", b"2");

    scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Fast)).unwrap();

    // Remove a file under b/, then rescan only a/: nothing may be deleted.
    fs::remove_file(fx.data.path().join("b/two")).unwrap();
    let partial = scan(&mut fx.catalog, &fx.data.path().join("a"), &opts(HashMode::Fast)).unwrap();
    assert_eq!(partial.deleted, 0);

    // A rescan of the covering root notices the deletion.
    let full = scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Fast)).unwrap();
    assert_eq!(full.deleted, 1);
}

// ---- Hash tiering ----

#[test]
fn upgrade_mode_fills_missing_full_hashes_without_rehash_churn() {
    let mut fx = fixture();
    write(fx.data.path(), "f", b"some payload");
    let first = scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Fast)).unwrap();

    let upgraded = scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Upgrade)).unwrap();
    assert_eq!(upgraded.added, 0);
    assert_eq!(upgraded.updated, 0);
    assert_eq!(upgraded.unchanged, 1);

    let device = register_or_resolve(&mut fx.catalog, fx.data.path()).unwrap();
    let path = fs::canonicalize(fx.data.path().join("f")).unwrap();
    let row = fx
        .catalog
        .lookup_file(first.device_id, &device.to_catalog_path(&path))
        .unwrap()
        .unwrap();
    assert!(row.sha256.is_some());
    // Files below the quick-hash window hash identically in both tiers.
    assert_eq!(row.quick_hash, row.sha256);
}

#[test]
fn false_and_true_collisions_partition_after_promotion() {
    let mut fx = fixture();
    // A and B share their first MiB but diverge after it; C and D are
    // byte-identical copies.
    write(fx.data.path(), "a", &shared_prefix_file(b'S', b'X'));
    write(fx.data.path(), "b", &shared_prefix_file(b'S', b'Y'));
    write(fx.data.path(), "c", b"some 5 MiB stand-in payload");
    write(fx.data.path(), "d", b"some 5 MiB stand-in payload");

    let stats = scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Fast)).unwrap();
    let device = register_or_resolve(&mut fx.catalog, fx.data.path()).unwrap();

    let groups = collide::find_quick_hash_collisions(&fx.catalog, stats.device_id).unwrap();
    assert_eq!(groups.len(), 2, "expected {{a,b}} and {{c,d}}");

    let promotion = collide::promote_all(&fx.catalog, &device).unwrap();
    assert_eq!(promotion.hashed, 4);
    assert_eq!(promotion.true_duplicate_groups, 1);
    assert_eq!(promotion.false_collision_groups, 2);

    let sha_of = |name: &str| {
        let path = fs::canonicalize(fx.data.path().join(name)).unwrap();
        fx.catalog
            .lookup_file(stats.device_id, &device.to_catalog_path(&path))
            .unwrap()
            .unwrap()
            .sha256
    };
    assert_ne!(sha_of("a"), sha_of("b"));
    assert_eq!(sha_of("c"), sha_of("d"));

    // Promotion is idempotent: a second run does no hash work.
    let again = collide::promote_all(&fx.catalog, &device).unwrap();
    assert_eq!(again.hashed, 0);
}

#[test]
fn zero_byte_files_hash_to_the_empty_digest() {
    let mut fx = fixture();
    write(fx.data.path(), "empty_a", b"");
    write(fx.data.path(), "empty_b", b"");

    let stats = scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Full)).unwrap();
    let device = register_or_resolve(&mut fx.catalog, fx.data.path()).unwrap();
    let path = fs::canonicalize(fx.data.path().join("empty_a")).unwrap();
    let row = fx
        .catalog
        .lookup_file(stats.device_id, &device.to_catalog_path(&path))
        .unwrap()
        .unwrap();
    assert_eq!(row.quick_hash.as_deref(), Some(SHA256_EMPTY));
    assert_eq!(row.sha256.as_deref(), Some(SHA256_EMPTY));
}

// ---- Path identity ----

#[test]
fn symlinks_resolve_to_one_canonical_row() {
    let mut fx = fixture();
    write(fx.data.path(), "real", b"content");
    std::os::unix::fs::symlink(fx.data.path().join("real"), fx.data.path().join("alias"))
        .unwrap();

    let stats = scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Fast)).unwrap();
    // Both names resolve to the same canonical path: one row.
    assert_eq!(stats.added, 1);
    let rows = fx.catalog.active_rows(stats.device_id).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].path.ends_with("/real"));
}

#[test]
fn symlink_escaping_the_root_is_skipped() {
    let mut fx = fixture();
    let outside = TempDir::new().unwrap();
    write(outside.path(), "elsewhere", b"outside content");
    write(fx.data.path(), "inside", b"inside content");
    std::os::unix::fs::symlink(
        outside.path().join("elsewhere"),
        fx.data.path().join("escape"),
    )
    .unwrap();

    let stats = scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Fast)).unwrap();
    assert_eq!(stats.added, 1);
    let rows = fx.catalog.active_rows(stats.device_id).unwrap();
    assert!(rows.iter().all(|r| r.path.ends_with("/inside")));
}

// ---- Device identity ----

#[test]
fn device_id_drift_is_tracked_without_spurious_changes() {
    let mut fx = fixture();
    for i in 0..5 {
        write(fx.data.path(), &format!("f{i}"), format!("data {i}").as_bytes());
    }
    let first = scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Fast)).unwrap();
    let device = register_or_resolve(&mut fx.catalog, fx.data.path()).unwrap();

    // Simulate a remount handing out a different kernel device number.
    let fake_id = device.device_id + 991_373;
    fx.catalog
        .update_device_id(&device.fs_uuid, device.device_id, fake_id)
        .unwrap();

    // The next scan probes the same fs uuid, renames the table back, and
    // sees no changes at all.
    let stats = scan(&mut fx.catalog, fx.data.path(), &opts(HashMode::Fast)).unwrap();
    assert_eq!(stats.device_id, first.device_id);
    assert_eq!(stats.added, 0);
    assert_eq!(stats.updated, 0);
    assert_eq!(stats.deleted, 0);
    assert_eq!(stats.unchanged, 5);
}
