//! Backfill: evaluate recording rules over history against a local store
//! and persist their results as new series through the planned block writer.

use crate::append::SafeAppender;
use crate::common::Canceller;
use crate::database::Database;
use crate::error::{ForgeError, Result};
use crate::pipeline::{PlanExecutor, PlanExecutorFactory, PlannedBlockWriter};
use crate::planner::{PlanEntry, PlanGenerator, PlannerConfig};
use crate::query::QueryManager;
use crate::rules::{recording_rules, load_rule_file, RecordingRule, RuleGroup};
use crate::tsdb::{DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub directory: PathBuf,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sample_interval: Duration,
    pub rule_config_files: Vec<PathBuf>,
    pub rule_group_filters: Vec<Regex>,
    pub rule_name_filters: Vec<Regex>,
    pub parallelism: usize,
}

/// Runs one backfill.
pub fn backfill(config: &BackfillConfig) -> Result<()> {
    let mut groups: Vec<RuleGroup> = Vec::new();
    for file in &config.rule_config_files {
        groups.extend(load_rule_file(file)?);
    }

    let rules: Vec<RecordingRule> = recording_rules(&groups)
        .into_iter()
        .filter(|rule| should_include_rule(config, rule))
        .collect();
    if rules.is_empty() {
        return Err(ForgeError::Config(
            "no recording rules left after filtering".to_string(),
        ));
    }

    run_recording_rules(
        &config.directory,
        rules,
        config.start,
        config.end,
        config.sample_interval,
        config.parallelism,
    )
}

/// A rule survives iff any group filter matches its group AND any name
/// filter matches its name.
fn should_include_rule(config: &BackfillConfig, rule: &RecordingRule) -> bool {
    evaluate_filters(&rule.group, &config.rule_group_filters)
        && evaluate_filters(&rule.name, &config.rule_name_filters)
}

fn evaluate_filters(value: &str, filters: &[Regex]) -> bool {
    filters.iter().any(|f| f.is_match(value))
}

/// Evaluates `rules` over the range and persists their output into
/// `directory`. Shared with the generate command's rule pass.
pub fn run_recording_rules(
    directory: &std::path::Path,
    rules: Vec<RecordingRule>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    sample_interval: Duration,
    parallelism: usize,
) -> Result<()> {
    // The same directory serves as query source and block destination.
    let query_db = Database::new(directory, DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION)?;
    let query_manager = Arc::new(query_db.query_manager()?);

    let planner_config = PlannerConfig::new(directory, start, end, sample_interval, parallelism);
    let generator = RuleGenerator {
        rules: rules.into_iter().map(Arc::new).collect(),
    };
    let factory = RuleExecutorFactory { query_manager };
    PlannedBlockWriter::new("backfill", planner_config, generator, factory).run()
}

struct RuleGenerator {
    rules: Vec<Arc<RecordingRule>>,
}

impl PlanGenerator<RecordingRule> for RuleGenerator {
    fn generate(&self, chunk_start: i64, chunk_end: i64, step: i64) -> Vec<PlanEntry<RecordingRule>> {
        self.rules
            .iter()
            .map(|rule| PlanEntry::new("backfill", chunk_start, chunk_end, step, Arc::clone(rule)))
            .collect()
    }
}

struct RuleExecutorFactory {
    query_manager: Arc<QueryManager>,
}

impl PlanExecutorFactory<RecordingRule> for RuleExecutorFactory {
    fn create(&self, _name: &str) -> Result<Box<dyn PlanExecutor<RecordingRule>>> {
        Ok(Box::new(RuleExecutor {
            query_manager: Arc::clone(&self.query_manager),
        }))
    }
}

struct RuleExecutor {
    query_manager: Arc<QueryManager>,
}

impl PlanExecutor<RecordingRule> for RuleExecutor {
    fn execute(
        &mut self,
        _canceller: &Canceller,
        entry: &PlanEntry<RecordingRule>,
        appender: &mut SafeAppender,
    ) -> Result<()> {
        let querier = self.query_manager.new_querier();
        let samples = querier
            .query_range_rule(&entry.data, entry.start, entry.end, entry.step)
            .map_err(|e| {
                ForgeError::Expression(format!(
                    "failed to run recording rule '{}': {}",
                    entry.data.name, e
                ))
            })?;
        for sample in samples {
            appender.add(&sample)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchers::parse_selector;
    use crate::tsdb::{BlockWriter, Db, DbOptions};
    use crate::types::{Labels, METRIC_NAME};
    use tempfile::TempDir;

    fn regexes(patterns: &[&str]) -> Vec<Regex> {
        patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
    }

    fn config(dir: &std::path::Path, groups: &[&str], names: &[&str]) -> BackfillConfig {
        BackfillConfig {
            directory: dir.to_path_buf(),
            start: "2023-01-01T00:00:00Z".parse().unwrap(),
            end: "2023-01-01T01:00:00Z".parse().unwrap(),
            sample_interval: Duration::from_secs(15),
            rule_config_files: vec![],
            rule_group_filters: regexes(groups),
            rule_name_filters: regexes(names),
            parallelism: 1,
        }
    }

    fn rule(group: &str, name: &str) -> RecordingRule {
        RecordingRule {
            name: name.to_string(),
            group: group.to_string(),
            expr: "up".to_string(),
            labels: Labels::new(),
        }
    }

    #[test]
    fn test_rule_inclusion_is_and_across_filter_sets() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), &["^node$", "^host$"], &["^job:.*$"]);
        assert!(should_include_rule(&cfg, &rule("node", "job:up:sum")));
        assert!(should_include_rule(&cfg, &rule("host", "job:load:avg")));
        assert!(!should_include_rule(&cfg, &rule("other", "job:up:sum")));
        assert!(!should_include_rule(&cfg, &rule("node", "instance:up:sum")));
    }

    #[test]
    fn test_backfill_no_surviving_rules() {
        let tmp = TempDir::new().unwrap();
        let rules_file = tmp.path().join("rules.yml");
        std::fs::write(
            &rules_file,
            "groups:\n  - name: node\n    rules:\n      - record: job:up:sum\n        expr: up\n",
        )
        .unwrap();
        let mut cfg = config(tmp.path(), &["^nonexistent$"], &[".+"]);
        cfg.rule_config_files = vec![rules_file];
        let err = backfill(&cfg).unwrap_err();
        assert!(err.to_string().contains("no recording rules left after filtering"));
        // No staging or block dirs were created.
        let made: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_type().unwrap().is_dir())
            .collect();
        assert!(made.is_empty(), "zero writes on filter failure");
    }

    #[test]
    fn test_backfill_writes_rule_series() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("data");
        std::fs::create_dir_all(&dir).unwrap();

        // Seed source samples on the step grid of the backfill window.
        let base: DateTime<Utc> = "2023-01-01T00:00:00Z".parse().unwrap();
        let base_ms = base.timestamp_millis();
        let mut writer = BlockWriter::new(&dir, DEFAULT_BLOCK_DURATION).unwrap();
        let up = Labels::from_pairs([(METRIC_NAME, "up"), ("job", "node")]);
        for i in 0..240 {
            writer.append(&up, base_ms + i * 15_000, 1.0).unwrap();
        }
        writer.flush().unwrap();

        let rules_file = tmp.path().join("rules.yml");
        std::fs::write(
            &rules_file,
            "groups:\n  - name: node\n    rules:\n      - record: job:up:sum\n        expr: up{job=\"node\"}\n        labels:\n          team: infra\n",
        )
        .unwrap();

        let mut cfg = config(&dir, &[".+"], &[".+"]);
        cfg.rule_config_files = vec![rules_file];
        backfill(&cfg).unwrap();

        let db = Db::open(&dir, DbOptions::default()).unwrap();
        let matchers = parse_selector("job:up:sum").unwrap();
        let matrix = db
            .read_series(&matchers, base_ms, base_ms + 3_600_000)
            .unwrap();
        assert_eq!(matrix.len(), 1);
        assert!(!matrix[0].points.is_empty());
        assert_eq!(matrix[0].metric.get("team"), Some("infra"));
    }
}
