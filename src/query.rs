//! Local query manager: evaluates recording rules against the block store
//! through a pluggable engine. The bundled engine handles label-selector
//! expressions as range queries with the standard staleness lookback; a full
//! query language stays behind the `QueryEngine` seam.

use crate::error::{ForgeError, Result};
use crate::matchers::parse_selector;
use crate::rules::RecordingRule;
use crate::tsdb::Db;
use crate::types::{Labels, LabelsBuilder, Matrix, Point, Sample, Series, Timestamp, METRIC_NAME};
use std::sync::{Arc, RwLock};

/// How far an instant evaluation looks back for the most recent sample.
pub const LOOKBACK_DELTA_MS: i64 = 5 * 60 * 1000;

/// Expression evaluation seam. Implementations turn an expression string
/// into a range-query matrix over the store.
pub trait QueryEngine: Send + Sync {
    fn range_query(
        &self,
        db: &Db,
        expr: &str,
        start: Timestamp,
        end: Timestamp,
        step: Timestamp,
    ) -> Result<Matrix>;
}

/// Selector-only engine: the expression must be a series selector; each
/// evaluation step takes the most recent raw sample within the lookback
/// window.
#[derive(Debug, Default)]
pub struct SelectorEngine;

impl QueryEngine for SelectorEngine {
    fn range_query(
        &self,
        db: &Db,
        expr: &str,
        start: Timestamp,
        end: Timestamp,
        step: Timestamp,
    ) -> Result<Matrix> {
        if step <= 0 {
            return Err(ForgeError::InvalidTimeRange { start, end });
        }
        let matchers = parse_selector(expr)?;
        let raw = db.read_series(&matchers, start - LOOKBACK_DELTA_MS, end)?;

        let mut matrix = Matrix::new();
        for series in raw {
            let mut points = Vec::new();
            let mut cursor = 0usize;
            let mut ts = start;
            while ts <= end {
                while cursor < series.points.len() && series.points[cursor].t <= ts {
                    cursor += 1;
                }
                if cursor > 0 {
                    let candidate = series.points[cursor - 1];
                    if ts - candidate.t < LOOKBACK_DELTA_MS {
                        points.push(Point { t: ts, v: candidate.v });
                    }
                }
                ts += step;
            }
            if !points.is_empty() {
                matrix.push(Series {
                    metric: series.metric,
                    points,
                });
            }
        }
        Ok(matrix)
    }
}

/// Serializes rule evaluation with flushes and compaction through the
/// store's shared lock.
pub struct QueryManager {
    lock: Arc<RwLock<()>>,
    db: Db,
    engine: Box<dyn QueryEngine>,
}

impl QueryManager {
    pub(crate) fn new(lock: Arc<RwLock<()>>, db: Db) -> Self {
        QueryManager {
            lock,
            db,
            engine: Box::new(SelectorEngine),
        }
    }

    pub fn with_engine(mut self, engine: Box<dyn QueryEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn new_querier(&self) -> Querier<'_> {
        Querier { manager: self }
    }
}

/// Evaluates recording rules; one per consumer.
pub struct Querier<'a> {
    manager: &'a QueryManager,
}

impl<'a> Querier<'a> {
    /// Evaluates `rule` as a range query and returns an iterator over the
    /// resulting samples with the rule's name and labels applied.
    pub fn query_range_rule(
        &self,
        rule: &RecordingRule,
        start: Timestamp,
        end: Timestamp,
        step: Timestamp,
    ) -> Result<RecordingRuleSampleIterator> {
        let _read = self.manager.lock.read()?;
        let matrix = self
            .manager
            .engine
            .range_query(&self.manager.db, &rule.expr, start, end, step)
            .map_err(|e| {
                ForgeError::Expression(format!(
                    "failed to run rule: expression={}, start={}, end={}, step={}: {}",
                    rule.expr, start, end, step, e
                ))
            })?;
        Ok(RecordingRuleSampleIterator::new(rule, matrix))
    }
}

/// Round-robins across the result series, emitting each sample with the
/// recording rule's output name and static labels.
pub struct RecordingRuleSampleIterator {
    series: Vec<(Labels, Vec<Point>)>,
    positions: Vec<usize>,
    current: usize,
}

impl RecordingRuleSampleIterator {
    fn new(rule: &RecordingRule, matrix: Matrix) -> Self {
        let mut series = Vec::with_capacity(matrix.len());
        for s in matrix {
            if s.points.is_empty() {
                continue;
            }
            let mut builder = LabelsBuilder::from_labels(&s.metric);
            builder.set(METRIC_NAME, rule.name.clone());
            for l in &rule.labels {
                builder.set(l.name.clone(), l.value.clone());
            }
            series.push((builder.build(), s.points));
        }
        let positions = vec![0; series.len()];
        RecordingRuleSampleIterator {
            series,
            positions,
            current: 0,
        }
    }
}

impl Iterator for RecordingRuleSampleIterator {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if self.series.is_empty() {
            return None;
        }
        if self.current >= self.series.len() {
            self.current = 0;
        }
        let (labels, points) = &self.series[self.current];
        let pos = self.positions[self.current];
        let point = points[pos];
        let sample = Sample {
            metric: labels.clone(),
            t: point.t,
            v: point.v,
        };
        if pos + 1 >= points.len() {
            self.series.remove(self.current);
            self.positions.remove(self.current);
        } else {
            self.positions[self.current] = pos + 1;
            self.current += 1;
        }
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::tsdb::{BlockWriter, DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION};
    use tempfile::TempDir;

    fn seed_store(dir: &std::path::Path) {
        let mut w = BlockWriter::new(dir, DEFAULT_BLOCK_DURATION).unwrap();
        let up = Labels::from_pairs([(METRIC_NAME, "up"), ("job", "node"), ("instance", "a")]);
        for (t, v) in [(0i64, 1.0), (60_000, 1.0), (120_000, 0.0)] {
            w.append(&up, t, v).unwrap();
        }
        w.flush().unwrap();
    }

    fn rule() -> RecordingRule {
        RecordingRule {
            name: "job:up:sum".to_string(),
            group: "g".to_string(),
            expr: "up{job=\"node\"}".to_string(),
            labels: Labels::from_pairs([("team", "infra")]),
        }
    }

    #[test]
    fn test_rule_samples_renamed_and_labeled() {
        let tmp = TempDir::new().unwrap();
        seed_store(tmp.path());
        let database = Database::new(tmp.path(), DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION).unwrap();
        let manager = database.query_manager().unwrap();
        let querier = manager.new_querier();

        let samples: Vec<Sample> = querier
            .query_range_rule(&rule(), 0, 120_000, 60_000)
            .unwrap()
            .collect();
        assert_eq!(samples.len(), 3);
        for s in &samples {
            assert_eq!(s.metric.metric_name(), "job:up:sum");
            assert_eq!(s.metric.get("team"), Some("infra"));
            assert_eq!(s.metric.get("instance"), Some("a"), "source labels kept");
        }
        let ts: Vec<i64> = samples.iter().map(|s| s.t).collect();
        assert_eq!(ts, vec![0, 60_000, 120_000]);
    }

    #[test]
    fn test_lookback_carries_values_forward() {
        let tmp = TempDir::new().unwrap();
        seed_store(tmp.path());
        let database = Database::new(tmp.path(), DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION).unwrap();
        let manager = database.query_manager().unwrap();
        let querier = manager.new_querier();

        // 30s steps between raw 60s samples reuse the previous value.
        let samples: Vec<Sample> = querier
            .query_range_rule(&rule(), 0, 120_000, 30_000)
            .unwrap()
            .collect();
        assert_eq!(samples.len(), 5);
        let at_90s = samples.iter().find(|s| s.t == 90_000).unwrap();
        assert_eq!(at_90s.v, 1.0);
    }

    #[test]
    fn test_lookback_expires() {
        let tmp = TempDir::new().unwrap();
        let mut w = BlockWriter::new(tmp.path(), DEFAULT_BLOCK_DURATION).unwrap();
        let up = Labels::from_pairs([(METRIC_NAME, "up")]);
        w.append(&up, 0, 1.0).unwrap();
        w.flush().unwrap();

        let database = Database::new(tmp.path(), DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION).unwrap();
        let manager = database.query_manager().unwrap();
        let querier = manager.new_querier();
        let rule = RecordingRule {
            name: "r".to_string(),
            group: "g".to_string(),
            expr: "up".to_string(),
            labels: Labels::new(),
        };
        // Sample at t=0 is visible inside the 5m lookback and gone after.
        let samples: Vec<Sample> = querier
            .query_range_rule(&rule, LOOKBACK_DELTA_MS + 60_000, LOOKBACK_DELTA_MS + 120_000, 60_000)
            .unwrap()
            .collect();
        assert!(samples.is_empty());
    }

    #[test]
    fn test_selector_engine_rejects_non_selector() {
        let tmp = TempDir::new().unwrap();
        let database = Database::new(tmp.path(), DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION).unwrap();
        let manager = database.query_manager().unwrap();
        let querier = manager.new_querier();
        let rule = RecordingRule {
            name: "r".to_string(),
            group: "g".to_string(),
            expr: "rate(up[5m])".to_string(),
            labels: Labels::new(),
        };
        assert!(querier.query_range_rule(&rule, 0, 1000, 500).is_err());
    }
}
