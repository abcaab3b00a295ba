//! Block store: opens a directory of ULID-named block directories, reads
//! matcher-filtered series across blocks, and compacts overlapping blocks
//! into aligned parents.

use crate::error::{ForgeError, Result};
use crate::matchers::{matches_labels, Matcher};
use crate::tsdb::chunks::{read_block_series, read_meta, write_block, BlockCompaction, BlockMeta};
use crate::tsdb::ulid::Ulid;
use crate::types::{Matrix, Series, Timestamp};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default width of a freshly cut block: two hours of milliseconds.
pub const DEFAULT_BLOCK_DURATION: i64 = 2 * 60 * 60 * 1000;

/// Default retention period: 90 days of milliseconds.
pub const DEFAULT_RETENTION: i64 = 90 * 24 * 60 * 60 * 1000;

/// Exponential ladder of permissible block durations, seeded at `min_size`
/// and multiplied by `step_size` for each of `steps` rungs.
pub fn exponential_block_ranges(min_size: i64, steps: usize, step_size: i64) -> Vec<i64> {
    let mut ranges = Vec::with_capacity(steps);
    let mut cur = min_size;
    for _ in 0..steps {
        ranges.push(cur);
        cur *= step_size;
    }
    ranges
}

/// Store options mirroring the defaults of the batch pipelines: overlapping
/// blocks allowed, no lockfile or WAL, equal min/max block duration.
#[derive(Debug, Clone)]
pub struct DbOptions {
    pub block_duration: i64,
    pub retention: i64,
    pub allow_overlapping_blocks: bool,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            block_duration: DEFAULT_BLOCK_DURATION,
            retention: DEFAULT_RETENTION,
            allow_overlapping_blocks: true,
        }
    }
}

/// A directory of immutable blocks.
#[derive(Debug)]
pub struct Db {
    dir: PathBuf,
    options: DbOptions,
}

impl Db {
    pub fn open(dir: impl Into<PathBuf>, options: DbOptions) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Db { dir, options })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &DbOptions {
        &self.options
    }

    /// Lists block directories with their metas, oldest first.
    pub fn blocks(&self) -> Result<Vec<(PathBuf, BlockMeta)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !Ulid::is_block_dir_name(&name) {
                continue;
            }
            let path = entry.path();
            let meta = read_meta(&path)?;
            out.push((path, meta));
        }
        out.sort_by(|a, b| a.1.ulid.cmp(&b.1.ulid));
        Ok(out)
    }

    /// Reads every series matching `matchers` with points in `[min, max]`
    /// (both inclusive), merged across blocks and sorted by timestamp.
    /// Overlap duplicates collapse to the first point seen per timestamp.
    pub fn read_series(
        &self,
        matchers: &[Matcher],
        min: Timestamp,
        max: Timestamp,
    ) -> Result<Matrix> {
        if min > max {
            return Err(ForgeError::InvalidTimeRange { start: min, end: max });
        }
        let blocks: Vec<PathBuf> = self
            .blocks()?
            .into_iter()
            .filter(|(_, meta)| meta.min_time <= max && meta.max_time > min)
            .map(|(path, _)| path)
            .collect();

        let per_block: Vec<Result<Vec<Series>>> = blocks
            .par_iter()
            .map(|path| {
                let series = read_block_series(path)?;
                Ok(series
                    .into_iter()
                    .filter(|s| matches_labels(matchers, &s.metric))
                    .map(|s| Series {
                        metric: s.metric,
                        points: s
                            .points
                            .into_iter()
                            .filter(|p| p.t >= min && p.t <= max)
                            .collect(),
                    })
                    .filter(|s| !s.points.is_empty())
                    .collect())
            })
            .collect();

        let mut merged: HashMap<u64, Series> = HashMap::new();
        for block_series in per_block {
            for s in block_series? {
                let hash = s.metric.hash();
                match merged.get_mut(&hash) {
                    Some(existing) => existing.points.extend(s.points),
                    None => {
                        merged.insert(hash, s);
                    }
                }
            }
        }

        let mut matrix: Matrix = merged.into_values().collect();
        for s in &mut matrix {
            s.points.sort_by_key(|p| p.t);
            s.points.dedup_by_key(|p| p.t);
        }
        matrix.sort_by_key(|s| s.metric.hash());
        Ok(matrix)
    }

    /// Compacts the store: drops blocks entirely past retention, then merges
    /// every aligned window holding more than one block into a single
    /// higher-level block.
    pub fn compact(&self) -> Result<()> {
        tracing::info!(dir = %self.dir.display(), "Compacting data");
        self.apply_retention()?;

        let blocks = self.blocks()?;
        let mut windows: HashMap<i64, Vec<(PathBuf, BlockMeta)>> = HashMap::new();
        for (path, meta) in blocks {
            let window = self
                .options
                .block_duration
                .checked_mul(meta.min_time.div_euclid(self.options.block_duration))
                .ok_or_else(|| ForgeError::Internal("block window overflow".to_string()))?;
            windows.entry(window).or_default().push((path, meta));
        }

        for (_window, group) in windows {
            if group.len() < 2 {
                continue;
            }
            self.merge_group(group)?;
        }
        Ok(())
    }

    fn merge_group(&self, group: Vec<(PathBuf, BlockMeta)>) -> Result<()> {
        let mut merged: HashMap<u64, Series> = HashMap::new();
        let mut min_time = i64::MAX;
        let mut max_time = i64::MIN;
        let mut sources = Vec::with_capacity(group.len());
        let mut level = 0;
        for (path, meta) in &group {
            min_time = min_time.min(meta.min_time);
            max_time = max_time.max(meta.max_time);
            level = level.max(meta.compaction.level);
            sources.push(meta.ulid.clone());
            for s in read_block_series(path)? {
                let hash = s.metric.hash();
                match merged.get_mut(&hash) {
                    Some(existing) => existing.points.extend(s.points),
                    None => {
                        merged.insert(hash, s);
                    }
                }
            }
        }

        let mut series: Vec<Series> = merged.into_values().collect();
        for s in &mut series {
            s.points.sort_by_key(|p| p.t);
            s.points.dedup_by_key(|p| p.t);
        }
        series.sort_by_key(|s| s.metric.hash());

        let ulid = Ulid::generate().to_string();
        let meta = write_block(
            &self.dir,
            &ulid,
            &series,
            min_time,
            max_time,
            BlockCompaction {
                level: level + 1,
                sources,
            },
        )?;
        tracing::info!(
            ulid = %meta.ulid,
            level = meta.compaction.level,
            merged = group.len(),
            "compacted blocks"
        );

        for (path, _) in group {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    fn apply_retention(&self) -> Result<()> {
        let cutoff = chrono::Utc::now().timestamp_millis() - self.options.retention;
        for (path, meta) in self.blocks()? {
            if meta.max_time <= cutoff {
                tracing::info!(ulid = %meta.ulid, "removing block past retention");
                std::fs::remove_dir_all(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchers::parse_selector;
    use crate::tsdb::writer::BlockWriter;
    use crate::types::{Labels, METRIC_NAME};
    use tempfile::TempDir;

    fn write_samples(dir: &Path, samples: &[(&str, i64, f64)]) {
        let mut w = BlockWriter::new(dir, DEFAULT_BLOCK_DURATION).unwrap();
        for (name, t, v) in samples {
            let m = Labels::from_pairs([(METRIC_NAME, *name), ("job", "test")]);
            w.append(&m, *t, *v).unwrap();
        }
        w.flush().unwrap();
    }

    #[test]
    fn test_exponential_block_ranges() {
        let ranges = exponential_block_ranges(DEFAULT_BLOCK_DURATION, 10, 3);
        assert_eq!(ranges.len(), 10);
        assert_eq!(ranges[0], DEFAULT_BLOCK_DURATION);
        assert_eq!(ranges[1], DEFAULT_BLOCK_DURATION * 3);
        assert_eq!(ranges[2], DEFAULT_BLOCK_DURATION * 9);
    }

    #[test]
    fn test_read_series_filters_and_clips() {
        let tmp = TempDir::new().unwrap();
        write_samples(
            tmp.path(),
            &[("up", 1000, 1.0), ("up", 2000, 0.0), ("load", 1500, 0.5)],
        );
        let db = Db::open(tmp.path(), DbOptions::default()).unwrap();

        let matchers = parse_selector("up").unwrap();
        let matrix = db.read_series(&matchers, 0, 10_000).unwrap();
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix[0].points.len(), 2);

        let clipped = db.read_series(&matchers, 1500, 10_000).unwrap();
        assert_eq!(clipped[0].points.len(), 1);
        assert_eq!(clipped[0].points[0].t, 2000);
    }

    #[test]
    fn test_read_series_merges_overlapping_blocks() {
        let tmp = TempDir::new().unwrap();
        // Two writers produce overlapping blocks for the same window.
        write_samples(tmp.path(), &[("up", 1000, 1.0), ("up", 3000, 1.0)]);
        write_samples(tmp.path(), &[("up", 2000, 1.0), ("up", 3000, 1.0)]);

        let db = Db::open(tmp.path(), DbOptions::default()).unwrap();
        let matchers = parse_selector("up").unwrap();
        let matrix = db.read_series(&matchers, 0, 10_000).unwrap();
        assert_eq!(matrix.len(), 1);
        let ts: Vec<i64> = matrix[0].points.iter().map(|p| p.t).collect();
        assert_eq!(ts, vec![1000, 2000, 3000], "duplicates collapse");
    }

    #[test]
    fn test_compact_merges_window() {
        let tmp = TempDir::new().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        let base = DEFAULT_BLOCK_DURATION * (now / DEFAULT_BLOCK_DURATION);
        write_samples(tmp.path(), &[("up", base + 1000, 1.0)]);
        write_samples(tmp.path(), &[("up", base + 2000, 2.0)]);

        let db = Db::open(tmp.path(), DbOptions::default()).unwrap();
        assert_eq!(db.blocks().unwrap().len(), 2);
        db.compact().unwrap();

        let blocks = db.blocks().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].1.compaction.level, 2);
        assert_eq!(blocks[0].1.compaction.sources.len(), 2);
        assert_eq!(blocks[0].1.stats.num_samples, 2);
    }

    #[test]
    fn test_invalid_range_rejected() {
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), DbOptions::default()).unwrap();
        let matchers = parse_selector("up").unwrap();
        assert!(db.read_series(&matchers, 10, 5).is_err());
    }
}
