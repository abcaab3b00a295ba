//! Database facade shared by the pipelines: staging directory management,
//! block promotion, block duration selection, and access to the append and
//! query managers under one reader/writer lock.

use crate::append::AppendManager;
use crate::error::{ForgeError, Result};
use crate::query::QueryManager;
use crate::tsdb::{exponential_block_ranges, Db, DbOptions, Ulid, DEFAULT_BLOCK_DURATION};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Picks the largest member of the exponential duration ladder not exceeding
/// the requested span; the default duration when the span is no larger.
pub fn compatible_block_duration(max_block_duration: i64) -> i64 {
    let mut block_duration = DEFAULT_BLOCK_DURATION;
    if max_block_duration > DEFAULT_BLOCK_DURATION {
        let ranges = exponential_block_ranges(DEFAULT_BLOCK_DURATION, 10, 3);
        let mut idx = ranges.len() - 1; // largest range if the span is enormous
        for (i, v) in ranges.iter().enumerate() {
            if *v > max_block_duration {
                idx = i - 1;
                break;
            }
        }
        block_duration = ranges[idx];
    }
    block_duration
}

/// Creates the path of a fresh staging directory `{dir}-{ULID}{suffix}` and
/// removes stale siblings left behind by crashed runs (same prefix and
/// suffix, older embedded timestamp).
pub fn new_temp_directory(dir: &Path, suffix: &str) -> Result<PathBuf> {
    let uid = Ulid::generate();
    delete_old_temp_directories(dir, suffix, uid.timestamp_ms())?;
    let name = format!(
        "{}-{}{}",
        dir.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ForgeError::Config(format!("invalid output directory {:?}", dir)))?,
        uid,
        suffix
    );
    let parent = dir.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join(name))
}

fn delete_old_temp_directories(dir: &Path, suffix: &str, newer_than_ms: u64) -> Result<()> {
    let parent = dir.parent().unwrap_or_else(|| Path::new("."));
    let prefix = format!(
        "{}-",
        dir.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let entries = match std::fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) || !name.ends_with(suffix) {
            continue;
        }
        let id_part = &name[prefix.len()..name.len() - suffix.len()];
        let id = Ulid::parse(id_part)?;
        if newer_than_ms > id.timestamp_ms() {
            tracing::info!(dir = %entry.path().display(), "removing stale staging directory");
            std::fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

/// Moves every block-named (ULID) sub-directory from `source_dir` into
/// `dest_dir` by atomic rename, replacing an existing target of the same
/// name, then removes `source_dir`.
pub fn move_blocks(source_dir: &Path, dest_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dest_dir)?;
    for entry in std::fs::read_dir(source_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !Ulid::is_block_dir_name(&name) {
            continue;
        }
        let from = entry.path();
        let to = dest_dir.join(&name);
        if to.exists() {
            std::fs::remove_dir_all(&to)?;
        }
        std::fs::rename(&from, &to)?;
    }
    std::fs::remove_dir_all(source_dir)?;
    Ok(())
}

/// One open store with its shared reader/writer lock. Appends take the read
/// side; flush rotation and compaction take the write side.
#[derive(Debug)]
pub struct Database {
    dir: PathBuf,
    block_duration: i64,
    retention: i64,
    lock: Arc<RwLock<()>>,
}

impl Database {
    pub fn new(dir: impl Into<PathBuf>, block_duration: i64, retention: i64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Database {
            dir,
            block_duration,
            retention,
            lock: Arc::new(RwLock::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn block_duration(&self) -> i64 {
        self.block_duration
    }

    /// Append manager rooted at this store's directory.
    pub fn append_manager(&self) -> Result<AppendManager> {
        Ok(AppendManager::new(
            Arc::clone(&self.lock),
            self.dir.clone(),
            self.block_duration,
        ))
    }

    /// Query manager over this store's blocks.
    pub fn query_manager(&self) -> Result<QueryManager> {
        let db = Db::open(
            &self.dir,
            DbOptions {
                block_duration: self.block_duration,
                retention: self.retention,
                allow_overlapping_blocks: true,
            },
        )?;
        Ok(QueryManager::new(Arc::clone(&self.lock), db))
    }

    /// Runs a compaction cycle under the write lock.
    pub fn compact(&self) -> Result<()> {
        let _guard = self.lock.write()?;
        let db = Db::open(
            &self.dir,
            DbOptions {
                block_duration: self.block_duration,
                retention: self.retention,
                allow_overlapping_blocks: true,
            },
        )?;
        db.compact()
    }
}
