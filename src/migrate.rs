//! Migrate: pull raw series for label-matcher selectors from a remote
//! endpoint and persist them locally through the planned block writer.

use crate::append::SafeAppender;
use crate::common::{retry_with_backoff, Canceller};
use crate::error::Result;
use crate::matchers::parse_selector;
use crate::pipeline::{PlanExecutor, PlanExecutorFactory, PlannedBlockWriter};
use crate::planner::{PlanEntry, PlanGenerator, PlannerConfig};
use crate::remote::RemoteClient;
use crate::types::{is_stale_nan, Sample};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Remote reads are retried with exponential backoff up to this many
/// attempts before the pipeline cancels.
const MAX_READ_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct MigrateConfig {
    pub output_directory: PathBuf,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sample_interval: Duration,
    pub matcher_expressions: Vec<String>,
    pub base_url: String,
    pub parallelism: usize,
}

/// One unit of migrated data: a selector expression.
#[derive(Debug)]
pub struct MigrateData {
    expression: String,
}

impl fmt::Display for MigrateData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Runs one migration.
pub fn migrate(config: &MigrateConfig) -> Result<()> {
    // Validate every selector before any pipeline work starts.
    let mut expressions = Vec::with_capacity(config.matcher_expressions.len());
    for expression in &config.matcher_expressions {
        parse_selector(expression)?;
        expressions.push(Arc::new(MigrateData {
            expression: expression.clone(),
        }));
    }
    if expressions.is_empty() {
        return Err(crate::error::ForgeError::Config(
            "no matchers to migrate".to_string(),
        ));
    }

    let planner_config = PlannerConfig::new(
        &config.output_directory,
        config.start,
        config.end,
        config.sample_interval,
        config.parallelism,
    );
    let generator = MatcherGenerator { expressions };
    let factory = MigrateExecutorFactory {
        base_url: config.base_url.clone(),
    };
    PlannedBlockWriter::new("migrate", planner_config, generator, factory).run()
}

struct MatcherGenerator {
    expressions: Vec<Arc<MigrateData>>,
}

impl PlanGenerator<MigrateData> for MatcherGenerator {
    fn generate(&self, chunk_start: i64, chunk_end: i64, step: i64) -> Vec<PlanEntry<MigrateData>> {
        self.expressions
            .iter()
            .map(|data| PlanEntry::new("migrate", chunk_start, chunk_end, step, Arc::clone(data)))
            .collect()
    }
}

struct MigrateExecutorFactory {
    base_url: String,
}

impl PlanExecutorFactory<MigrateData> for MigrateExecutorFactory {
    /// Each consumer builds its own client so connection state is never
    /// shared across workers.
    fn create(&self, name: &str) -> Result<Box<dyn PlanExecutor<MigrateData>>> {
        let client = RemoteClient::new(name, &self.base_url)?;
        Ok(Box::new(MigrateExecutor { client }))
    }
}

struct MigrateExecutor {
    client: RemoteClient,
}

impl PlanExecutor<MigrateData> for MigrateExecutor {
    fn execute(
        &mut self,
        canceller: &Canceller,
        entry: &PlanEntry<MigrateData>,
        appender: &mut SafeAppender,
    ) -> Result<()> {
        let matrix = retry_with_backoff(MAX_READ_ATTEMPTS, Some(canceller), || {
            self.client
                .query_range(&entry.data.expression, entry.start, entry.end, entry.step)
        })?;

        for series in matrix {
            for point in &series.points {
                // Stale markers and points before the chunk never land.
                if is_stale_nan(point.v) || point.t < entry.start {
                    continue;
                }
                appender.add(&Sample {
                    metric: series.metric.clone(),
                    t: point.t,
                    v: point.v,
                })?;
            }
        }
        Ok(())
    }
}
