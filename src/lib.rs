//! File-catalog and hardlink-deduplication engine for large multi-device
//! storage.
//!
//! The catalog (one SQLite file) tracks file identity per filesystem:
//! content hashes, inodes, and device identity keyed by a stable fs UUID.
//! Rescans are incremental over `(size, mtime)`; hash work is tiered, with
//! a 1 MiB quick hash promoted to a full SHA-256 only on collision.
//! Deduplication is a three-phase analyze → plan → execute pipeline that
//! never mutates the filesystem without a persisted plan, verification,
//! and backup/rollback.

pub mod analyze;
pub mod catalog;
pub mod collide;
pub mod device;
pub mod error;
pub mod execute;
pub mod export;
pub mod hash;
pub mod logging;
pub mod plan;
pub mod scan;

pub use catalog::Catalog;
pub use error::{HashallError, Result};
