//! Content hashing over files with a fixed 1 MiB buffer.
//!
//! Three tiers share the same SHA-256 primitive:
//! - `quick_hash` digests only the first window and is the cheap pre-filter
//!   the scanner records for every file.
//! - `full_hash` streams the whole file; populated on collision promotion or
//!   in full-mode scans.
//! - `sample_hash` digests the first, middle, and last windows; the executor
//!   uses it for fast pre-link verification.
//!
//! All functions are stateless and thread-safe; the scanner's worker pool
//! calls them concurrently. Files no larger than one window hash identically
//! under all three tiers.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::error::{HashallError, Result, io_file_error};

/// Window size for quick and sample hashing, and the streaming buffer size.
pub const HASH_WINDOW: u64 = 1024 * 1024;

/// How much of each file the scanner hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    /// Quick-hash only; full hashes are left for collision promotion.
    Fast,
    /// Quick-hash and full hash for every file.
    Full,
    /// Fill in missing full hashes; never re-hash existing ones.
    Upgrade,
}

impl FromStr for HashMode {
    type Err = HashallError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fast" => Ok(HashMode::Fast),
            "full" => Ok(HashMode::Full),
            "upgrade" => Ok(HashMode::Upgrade),
            other => Err(HashallError::InvalidArgument(format!(
                "unknown hash mode '{other}' (expected fast|full|upgrade)"
            ))),
        }
    }
}

/// SHA-256 of the first 1 MiB, lowercase hex.
pub fn quick_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| io_file_error(path, e))?;
    let mut hasher = Sha256::new();
    digest_window(&mut file, &mut hasher, HASH_WINDOW).map_err(|e| io_file_error(path, e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of the entire file, lowercase hex.
pub fn full_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| io_file_error(path, e))?;
    let mut hasher = Sha256::new();
    digest_window(&mut file, &mut hasher, u64::MAX).map_err(|e| io_file_error(path, e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 over the first, middle, and last 1 MiB windows, lowercase hex.
///
/// Files up to three windows long are hashed in full instead; the windows
/// would overlap and cost the same.
pub fn sample_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| io_file_error(path, e))?;
    let size = file.metadata().map_err(|e| io_file_error(path, e))?.len();
    if size <= 3 * HASH_WINDOW {
        let mut hasher = Sha256::new();
        digest_window(&mut file, &mut hasher, u64::MAX).map_err(|e| io_file_error(path, e))?;
        return Ok(hex::encode(hasher.finalize()));
    }

    let middle = size / 2 - HASH_WINDOW / 2;
    let last = size - HASH_WINDOW;
    let mut hasher = Sha256::new();
    for offset in [0, middle, last] {
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| io_file_error(path, e))?;
        digest_window(&mut file, &mut hasher, HASH_WINDOW).map_err(|e| io_file_error(path, e))?;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Feed up to `limit` bytes from the current position into `hasher`.
fn digest_window(file: &mut File, hasher: &mut Sha256, limit: u64) -> std::io::Result<()> {
    let mut buf = vec![0u8; HASH_WINDOW as usize];
    let mut remaining = limit;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("create temp file");
        f.write_all(bytes).expect("write temp file");
        f.flush().expect("flush temp file");
        f
    }

    #[test]
    fn small_file_quick_equals_full() {
        let f = write_temp(b"hello hashall");
        let q = quick_hash(f.path()).unwrap();
        let full = full_hash(f.path()).unwrap();
        let sample = sample_hash(f.path()).unwrap();
        assert_eq!(q, full);
        assert_eq!(q, sample);
    }

    #[test]
    fn empty_file_hashes_to_sha256_of_nothing() {
        let f = write_temp(b"");
        let q = quick_hash(f.path()).unwrap();
        assert_eq!(
            q,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(q, full_hash(f.path()).unwrap());
    }

    #[test]
    fn quick_hash_ignores_bytes_past_the_window() {
        let window = HASH_WINDOW as usize;
        let mut a = vec![b'S'; window];
        a.extend_from_slice(&[b'X'; 4096]);
        let mut b = vec![b'S'; window];
        b.extend_from_slice(&[b'Y'; 4096]);

        let fa = write_temp(&a);
        let fb = write_temp(&b);
        assert_eq!(
            quick_hash(fa.path()).unwrap(),
            quick_hash(fb.path()).unwrap()
        );
        assert_ne!(full_hash(fa.path()).unwrap(), full_hash(fb.path()).unwrap());
    }

    #[test]
    fn missing_file_reports_vanished() {
        let err = quick_hash(Path::new("/no/such/file")).unwrap_err();
        assert!(matches!(err, HashallError::FileVanished(_)));
    }

    #[test]
    fn hash_mode_parses() {
        assert_eq!(HashMode::from_str("fast").unwrap(), HashMode::Fast);
        assert_eq!(HashMode::from_str("full").unwrap(), HashMode::Full);
        assert_eq!(HashMode::from_str("upgrade").unwrap(), HashMode::Upgrade);
        assert!(HashMode::from_str("quick").is_err());
    }
}
