//! Block planner: splits a requested time range into block-aligned,
//! step-quantized chunks and expands each chunk into plan entries through a
//! caller-supplied generator.

use crate::common::clamp_parallelism;
use crate::tsdb::DEFAULT_BLOCK_DURATION;
use crate::types::Timestamp;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// One unit of work: a named range/step plus the adaptor's payload (a rule,
/// a matcher set, or a metric definition).
#[derive(Debug, Clone)]
pub struct PlanEntry<T> {
    pub name: String,
    pub start: Timestamp,
    pub end: Timestamp,
    pub step: Timestamp,
    pub data: Arc<T>,
}

impl<T> PlanEntry<T> {
    pub fn new(
        name: impl Into<String>,
        start: Timestamp,
        end: Timestamp,
        step: Timestamp,
        data: Arc<T>,
    ) -> Self {
        PlanEntry {
            name: name.into(),
            start,
            end,
            step,
            data,
        }
    }
}

impl<T: fmt::Display> fmt::Display for PlanEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} for '{}' from {}",
            self.name,
            self.data,
            crate::common::format_date_range(self.start, self.end)
        )
    }
}

/// Expands one step-aligned chunk into plan entries.
pub trait PlanGenerator<T>: Send + Sync {
    fn generate(&self, chunk_start: Timestamp, chunk_end: Timestamp, step: Timestamp)
        -> Vec<PlanEntry<T>>;
}

/// Shared configuration of a planned pipeline run.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub output_directory: PathBuf,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sample_interval: Duration,
    pub parallelism: usize,
    pub block_duration: i64,
}

impl PlannerConfig {
    /// Builds a config with parallelism clamped into `[1, numCPU]`.
    pub fn new(
        output_directory: impl Into<PathBuf>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sample_interval: Duration,
        parallelism: usize,
    ) -> Self {
        PlannerConfig {
            output_directory: output_directory.into(),
            start,
            end,
            sample_interval,
            parallelism: clamp_parallelism(parallelism),
            block_duration: DEFAULT_BLOCK_DURATION,
        }
    }

    /// Requested range start, truncated to whole seconds, in milliseconds.
    pub fn start_ms(&self) -> Timestamp {
        self.start.timestamp() * 1000
    }

    /// Requested range end, truncated to whole seconds, in milliseconds.
    pub fn end_ms(&self) -> Timestamp {
        self.end.timestamp() * 1000
    }

    pub fn step_ms(&self) -> Timestamp {
        self.sample_interval.as_millis() as i64
    }
}

/// Plans a range into per-block entry lists. The outer list groups entries
/// by block so the pipeline can barrier between blocks.
#[derive(Debug)]
pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Planner { config }
    }

    pub fn plan<T>(&self, generator: &dyn PlanGenerator<T>) -> Vec<Vec<PlanEntry<T>>> {
        let mut results = Vec::new();
        let start_ms = self.config.start_ms();
        let end_ms = self.config.end_ms();
        let step = self.config.step_ms();
        let block_duration = self.config.block_duration;

        let mut block_start = block_duration * (start_ms / block_duration);
        while block_start <= end_ms {
            let block_end = block_start + block_duration - 1;
            let curr_start = block_start.max(start_ms);
            let mut aligned = eval_timestamp(curr_start, step);
            while aligned < curr_start {
                aligned += step;
            }
            let curr_end = block_end.min(end_ms);
            if curr_end <= aligned {
                break;
            }
            results.push(plan_block(aligned, curr_end, step, generator));
            block_start += block_duration;
        }
        results
    }
}

/// Aligns `start` up to the next whole step boundary.
fn eval_timestamp(start: Timestamp, step: Timestamp) -> Timestamp {
    let adjusted = start - step;
    let base = adjusted - adjusted.rem_euclid(step);
    base + step
}

/// Splits one block's span into four equal sub-chunks and expands each. The
/// split uses integer division; a trailing remainder shorter than a chunk is
/// left uncovered, as the planner has always done.
fn plan_block<T>(
    start: Timestamp,
    end: Timestamp,
    step: Timestamp,
    generator: &dyn PlanGenerator<T>,
) -> Vec<PlanEntry<T>> {
    let mut plan = Vec::new();
    let chunk_duration = (end - start) / 4;
    if chunk_duration <= 0 {
        plan.extend(generator.generate(start, end, step));
        return plan;
    }
    let mut chunk_start = start;
    while chunk_start <= end {
        let chunk_end = chunk_start + chunk_duration - 1;
        if chunk_end > end {
            break;
        }
        plan.extend(generator.generate(chunk_start, chunk_end, step));
        chunk_start += chunk_duration;
    }
    plan
}
