//! Minimal block storage engine underneath the batch pipelines: ULID-named
//! immutable block directories, a buffered block writer, and window-aligned
//! compaction.

pub mod chunks;
pub mod db;
pub mod ulid;
pub mod writer;

pub use chunks::{BlockCompaction, BlockMeta, BlockStats};
pub use db::{exponential_block_ranges, Db, DbOptions, DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION};
pub use ulid::Ulid;
pub use writer::BlockWriter;
