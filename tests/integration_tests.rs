//! End-to-end flows: generate into a store, compact it, backfill rules over
//! the generated data, and read everything back.

use tsforge::backfill::{backfill, BackfillConfig};
use tsforge::database::Database;
use tsforge::generate::{generate, GenerateConfig, MetricConfig, TimeSeriesDef};
use tsforge::matchers::parse_selector;
use tsforge::tsdb::{Db, DbOptions, DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::time::Duration;
use tempfile::TempDir;

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn generate_config(out: std::path::PathBuf) -> GenerateConfig {
    GenerateConfig {
        output_directory: out,
        start: ts("2023-01-01T00:00:00Z"),
        end: ts("2023-01-01T04:00:00Z"),
        sample_interval: Duration::from_secs(30),
        parallelism: 2,
        metric_config: MetricConfig {
            time_series: vec![TimeSeriesDef {
                name: "synthetic_wave".to_string(),
                instances: vec!["a".to_string(), "b".to_string()],
                labels: vec![],
                expression: "Sin(state.Index / 10) * 50 + 50".to_string(),
            }],
        },
        rule_groups: vec![],
    }
}

#[test]
fn test_generate_then_read_back() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("data");
    generate(&generate_config(out.clone())).unwrap();

    let db = Db::open(&out, DbOptions::default()).unwrap();
    let blocks = db.blocks().unwrap();
    assert!(!blocks.is_empty(), "generation must produce blocks");

    let matchers = parse_selector("synthetic_wave").unwrap();
    let start_ms = ts("2023-01-01T00:00:00Z").timestamp_millis();
    let end_ms = ts("2023-01-01T04:00:00Z").timestamp_millis();
    let matrix = db.read_series(&matchers, start_ms, end_ms).unwrap();
    assert_eq!(matrix.len(), 2, "one series per instance");
    for series in &matrix {
        // Two 2h blocks, four sub-chunks each, 60 evaluations per sub-chunk.
        assert_eq!(series.points.len(), 480);
        for (k, p) in series.points.iter().enumerate() {
            // Even with two workers, the k-th point in time order must carry
            // the k-th value of the expression's Index sequence.
            let want = (k as f64 / 10.0).sin() * 50.0 + 50.0;
            assert!(
                (p.v - want).abs() < 1e-9,
                "point {} at t={} has v={}, want {}",
                k,
                p.t,
                p.v,
                want
            );
        }
    }
}

#[test]
fn test_generate_compact_preserves_data() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("data");
    generate(&generate_config(out.clone())).unwrap();

    let db = Db::open(&out, DbOptions::default()).unwrap();
    let matchers = parse_selector("synthetic_wave{instance=\"a\"}").unwrap();
    let before = db.read_series(&matchers, 0, i64::MAX / 4).unwrap();

    let database = Database::new(&out, DEFAULT_BLOCK_DURATION, DEFAULT_RETENTION).unwrap();
    database.compact().unwrap();

    let db = Db::open(&out, DbOptions::default()).unwrap();
    let after = db.read_series(&matchers, 0, i64::MAX / 4).unwrap();
    assert_eq!(before, after, "compaction must not lose or reorder samples");

    // After compaction each aligned window holds at most one block.
    let blocks = db.blocks().unwrap();
    let mut windows: Vec<i64> = blocks
        .iter()
        .map(|(_, m)| m.min_time / DEFAULT_BLOCK_DURATION)
        .collect();
    windows.sort_unstable();
    windows.dedup();
    assert_eq!(windows.len(), blocks.len(), "one block per window");
}

#[test]
fn test_generate_then_backfill_rules_over_output() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("data");
    generate(&generate_config(out.clone())).unwrap();

    let rules_file = tmp.path().join("rules.yml");
    std::fs::write(
        &rules_file,
        "groups:\n  - name: synthetic\n    rules:\n      - record: wave:copy\n        expr: synthetic_wave{instance=\"a\"}\n",
    )
    .unwrap();

    backfill(&BackfillConfig {
        directory: out.clone(),
        start: ts("2023-01-01T00:00:00Z"),
        end: ts("2023-01-01T04:00:00Z"),
        sample_interval: Duration::from_secs(30),
        rule_config_files: vec![rules_file],
        rule_group_filters: vec![Regex::new(".+").unwrap()],
        rule_name_filters: vec![Regex::new(".+").unwrap()],
        parallelism: 1,
    })
    .unwrap();

    let db = Db::open(&out, DbOptions::default()).unwrap();
    let matchers = parse_selector("wave:copy").unwrap();
    let matrix = db.read_series(&matchers, 0, i64::MAX / 4).unwrap();
    assert_eq!(matrix.len(), 1);
    assert!(!matrix[0].points.is_empty());
    assert_eq!(matrix[0].metric.get("instance"), Some("a"));
}

#[test]
fn test_no_staging_directories_survive_success() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("data");
    generate(&generate_config(out.clone())).unwrap();

    let leftovers: Vec<String> = std::fs::read_dir(tmp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".tmp-for-"))
        .collect();
    assert!(leftovers.is_empty(), "staging left behind: {:?}", leftovers);
}
