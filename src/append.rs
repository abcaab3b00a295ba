//! Append manager and safe appender: per-worker buffered block writing with
//! commit-on-capacity and flush-on-time, sharing one reader/writer lock with
//! compaction.

use crate::database::move_blocks;
use crate::error::{ForgeError, Result};
use crate::tsdb::BlockWriter;
use crate::types::{Sample, Timestamp};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A block writer never spans more than 72 hours before rotating.
const MAX_BLOCK_FLUSH_DURATION: i64 = 72 * 60 * 60 * 1000;

/// Samples buffered in an open transaction before it is committed.
const MAX_SAMPLES_IN_MEMORY: u64 = 15_000;

/// Hands out one [`SafeAppender`] per consumer, each rooted at its own
/// generation sub-directory of the staging dir.
#[derive(Debug)]
pub struct AppendManager {
    lock: Arc<RwLock<()>>,
    dir: PathBuf,
    block_duration: i64,
    generation: AtomicU64,
}

impl AppendManager {
    pub(crate) fn new(lock: Arc<RwLock<()>>, dir: PathBuf, block_duration: i64) -> Self {
        AppendManager {
            lock,
            dir,
            block_duration,
            generation: AtomicU64::new(0),
        }
    }

    /// Creates a fresh appender writing under `{stagingDir}/{generation}/`.
    pub fn new_appender(&self) -> Result<SafeAppender> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let appender_dir = self.dir.join(generation.to_string());
        let block_flush_duration = self.block_duration.min(MAX_BLOCK_FLUSH_DURATION);
        let writer = BlockWriter::new(&appender_dir, self.block_duration)?;
        Ok(SafeAppender {
            lock: Arc::clone(&self.lock),
            writer,
            dest_dir: self.dir.clone(),
            dir: appender_dir,
            block_start: None,
            block_flush_duration,
            current_sample_count: 0,
            stopped: false,
        })
    }
}

/// One consumer's buffered appender. `add` is cheap under the shared read
/// lock; time-boxed flushes and capacity commits take the write lock so a
/// concurrent compaction never interleaves with an in-progress commit.
#[derive(Debug)]
pub struct SafeAppender {
    lock: Arc<RwLock<()>>,
    writer: BlockWriter,
    dest_dir: PathBuf,
    dir: PathBuf,
    block_start: Option<Timestamp>,
    block_flush_duration: i64,
    current_sample_count: u64,
    stopped: bool,
}

impl SafeAppender {
    /// Appends one sample.
    ///
    /// Transient storage failures (out-of-order, out-of-bounds, duplicate)
    /// drop the sample silently; anything else propagates and cancels the
    /// pipeline. When the sample lands past the flush window the writer is
    /// flushed and the window advanced by exactly one flush duration, which
    /// keeps later flushes block-aligned.
    pub fn add(&mut self, sample: &Sample) -> Result<()> {
        if self.stopped {
            return Err(ForgeError::Internal(
                "cannot append to a closed appender".to_string(),
            ));
        }

        let lock = Arc::clone(&self.lock);
        match self.block_start {
            None => {
                let _read = lock.read()?;
                self.block_start = Some(sample.t);
                self.append_dropping_transient(sample)?;
            }
            Some(block_start) if sample.t > block_start + self.block_flush_duration => {
                let _write = lock.write()?;
                self.writer.commit()?;
                self.writer.flush()?;
                self.block_start = Some(block_start + self.block_flush_duration);
                self.current_sample_count = 0;
                self.append_dropping_transient(sample)?;
                return Ok(());
            }
            Some(_) => {
                let _read = lock.read()?;
                self.append_dropping_transient(sample)?;
            }
        }

        if self.current_sample_count >= MAX_SAMPLES_IN_MEMORY {
            let _write = lock.write()?;
            if self.current_sample_count >= MAX_SAMPLES_IN_MEMORY {
                self.writer.commit()?;
                self.current_sample_count = 0;
            }
        }
        Ok(())
    }

    fn append_dropping_transient(&mut self, sample: &Sample) -> Result<()> {
        match self.writer.append(&sample.metric, sample.t, sample.v) {
            Ok(()) => {
                self.current_sample_count += 1;
                Ok(())
            }
            Err(e) if e.is_transient_append() => {
                tracing::debug!(metric = %sample.metric, t = sample.t, error = %e, "dropping sample");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Commits and flushes outstanding samples, then promotes this worker's
    /// block directories into the staging root for compaction to find.
    pub fn close(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let lock = Arc::clone(&self.lock);
        let _write = lock.write()?;
        self.writer.commit()?;
        self.writer.flush()?;
        move_blocks(&self.dir, &self.dest_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::tsdb::{Db, DbOptions, DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION};
    use crate::types::{Labels, Sample, METRIC_NAME};
    use tempfile::TempDir;

    fn sample(t: i64, v: f64) -> Sample {
        Sample {
            metric: Labels::from_pairs([(METRIC_NAME, "x"), ("job", "test")]),
            t,
            v,
        }
    }

    fn open_manager(dir: &std::path::Path) -> AppendManager {
        Database::new(dir, DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION)
            .unwrap()
            .append_manager()
            .unwrap()
    }

    #[test]
    fn test_appenders_get_distinct_generations() {
        let tmp = TempDir::new().unwrap();
        let manager = open_manager(tmp.path());
        let _a = manager.new_appender().unwrap();
        let _b = manager.new_appender().unwrap();
        assert!(tmp.path().join("0").is_dir());
        assert!(tmp.path().join("1").is_dir());
    }

    #[test]
    fn test_out_of_order_dropped_silently() {
        let tmp = TempDir::new().unwrap();
        let manager = open_manager(tmp.path());
        let mut appender = manager.new_appender().unwrap();
        appender.add(&sample(100, 1.0)).unwrap();
        appender.add(&sample(200, 2.0)).unwrap();
        appender.add(&sample(150, 3.0)).unwrap();
        appender.close().unwrap();

        let db = Db::open(tmp.path(), DbOptions::default()).unwrap();
        let matchers = crate::matchers::parse_selector("x").unwrap();
        let matrix = db.read_series(&matchers, 0, 1_000_000).unwrap();
        let ts: Vec<i64> = matrix[0].points.iter().map(|p| p.t).collect();
        assert_eq!(ts, vec![100, 200], "the 150 sample is silently dropped");
    }

    #[test]
    fn test_close_promotes_blocks_into_staging_root() {
        let tmp = TempDir::new().unwrap();
        let manager = open_manager(tmp.path());
        let mut appender = manager.new_appender().unwrap();
        appender.add(&sample(1_000, 1.0)).unwrap();
        appender.close().unwrap();

        assert!(!tmp.path().join("0").exists(), "generation dir is removed");
        let db = Db::open(tmp.path(), DbOptions::default()).unwrap();
        assert_eq!(db.blocks().unwrap().len(), 1);
    }

    #[test]
    fn test_add_after_close_fails() {
        let tmp = TempDir::new().unwrap();
        let manager = open_manager(tmp.path());
        let mut appender = manager.new_appender().unwrap();
        appender.close().unwrap();
        assert!(appender.add(&sample(1, 1.0)).is_err());
    }

    #[test]
    fn test_time_boxed_flush_advances_window_once() {
        let tmp = TempDir::new().unwrap();
        // Small block duration so the flush window is easy to cross.
        let database = Database::new(tmp.path(), 1_000, DEFAULT_RETENTION).unwrap();
        let manager = database.append_manager().unwrap();
        let mut appender = manager.new_appender().unwrap();

        appender.add(&sample(0, 1.0)).unwrap();
        appender.add(&sample(500, 2.0)).unwrap();
        // Crosses block_start + flush_duration: triggers a flush.
        appender.add(&sample(1_500, 3.0)).unwrap();
        assert_eq!(appender.block_start, Some(1_000), "advances by one window");
        appender.close().unwrap();

        let db = Db::open(tmp.path(), DbOptions { block_duration: 1_000, ..DbOptions::default() }).unwrap();
        let total: u64 = db
            .blocks()
            .unwrap()
            .iter()
            .map(|(_, m)| m.stats.num_samples)
            .sum();
        assert_eq!(total, 3);
    }
}
