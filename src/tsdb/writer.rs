//! In-memory head and block cutting. A `BlockWriter` accumulates appended
//! samples, enforcing per-series timestamp monotonicity, and `flush` cuts
//! the head into block-duration-aligned directories on disk.

use crate::error::{ForgeError, Result};
use crate::tsdb::chunks::{write_block, BlockCompaction, BlockMeta};
use crate::tsdb::ulid::Ulid;
use crate::types::{is_stale_nan, Labels, Point, Series, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

#[derive(Debug, Default)]
struct HeadSeries {
    labels: Labels,
    points: Vec<Point>,
}

/// Buffered writer producing aligned blocks under a single directory. The
/// open transaction is validated on append and folded into the head on
/// `commit`; `flush` persists the head as one block per aligned window.
#[derive(Debug)]
pub struct BlockWriter {
    dir: PathBuf,
    block_duration: i64,
    // Appends older than `max_time - max_span` are rejected as out of bounds,
    // matching the head span of twice the block duration.
    max_span: i64,
    head: HashMap<u64, HeadSeries>,
    pending: HashMap<u64, HeadSeries>,
    max_time: Option<Timestamp>,
}

impl BlockWriter {
    pub fn new(dir: impl Into<PathBuf>, block_duration: i64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(BlockWriter {
            dir,
            block_duration,
            max_span: 2 * block_duration,
            head: HashMap::new(),
            pending: HashMap::new(),
            max_time: None,
        })
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    /// Appends one sample into the open transaction. Stale-marker values are
    /// dropped silently. Violations of per-series monotonicity surface as
    /// the dedicated transient errors.
    pub fn append(&mut self, metric: &Labels, t: Timestamp, v: f64) -> Result<()> {
        if is_stale_nan(v) {
            return Ok(());
        }
        if let Some(max) = self.max_time {
            if t < max - self.max_span {
                return Err(ForgeError::OutOfBounds);
            }
        }
        let hash = metric.hash();
        let last = self
            .pending
            .get(&hash)
            .and_then(|s| s.points.last())
            .or_else(|| self.head.get(&hash).and_then(|s| s.points.last()))
            .copied();
        if let Some(last) = last {
            if t < last.t {
                return Err(ForgeError::OutOfOrderSample);
            }
            if t == last.t {
                if v.to_bits() == last.v.to_bits() {
                    return Ok(());
                }
                return Err(ForgeError::DuplicateSampleForTimestamp);
            }
        }
        let entry = self.pending.entry(hash).or_insert_with(|| HeadSeries {
            labels: metric.clone(),
            points: Vec::new(),
        });
        entry.points.push(Point { t, v });
        self.max_time = Some(self.max_time.map_or(t, |m| m.max(t)));
        Ok(())
    }

    /// Folds the open transaction into the head.
    pub fn commit(&mut self) -> Result<()> {
        for (hash, mut pending) in self.pending.drain() {
            match self.head.get_mut(&hash) {
                Some(series) => series.points.append(&mut pending.points),
                None => {
                    self.head.insert(hash, pending);
                }
            }
        }
        Ok(())
    }

    /// Commits any open transaction, cuts the head into one block per
    /// aligned window, and clears the head. Returns the written block metas.
    pub fn flush(&mut self) -> Result<Vec<BlockMeta>> {
        self.commit()?;
        if self.head.is_empty() {
            return Ok(Vec::new());
        }

        // window start -> hash -> series slice for that window
        let mut windows: BTreeMap<i64, HashMap<u64, Series>> = BTreeMap::new();
        for (hash, series) in self.head.drain() {
            for p in series.points {
                let window = self.block_duration * p.t.div_euclid(self.block_duration);
                windows
                    .entry(window)
                    .or_default()
                    .entry(hash)
                    .or_insert_with(|| Series {
                        metric: series.labels.clone(),
                        points: Vec::new(),
                    })
                    .points
                    .push(p);
            }
        }
        self.max_time = None;

        let mut metas = Vec::with_capacity(windows.len());
        for (_window, series_map) in windows {
            let mut series: Vec<Series> = series_map.into_values().collect();
            series.sort_by_key(|s| s.metric.hash());
            let min_time = series
                .iter()
                .filter_map(|s| s.points.first())
                .map(|p| p.t)
                .min()
                .unwrap_or(0);
            let max_time = series
                .iter()
                .filter_map(|s| s.points.last())
                .map(|p| p.t)
                .max()
                .unwrap_or(0)
                + 1;
            let ulid = Ulid::generate().to_string();
            let meta = write_block(
                &self.dir,
                &ulid,
                &series,
                min_time,
                max_time,
                BlockCompaction {
                    level: 1,
                    sources: vec![ulid.clone()],
                },
            )?;
            tracing::debug!(ulid = %meta.ulid, samples = meta.stats.num_samples, "wrote block");
            metas.push(meta);
        }
        Ok(metas)
    }
}
