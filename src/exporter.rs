//! Export: pull raw series for matcher sets from a remote endpoint and
//! stream them to a file as concatenated JSON block documents inside a
//! zstd stream.

use crate::blockdoc::BlockDocBuilder;
use crate::common::duration_to_millis;
use crate::error::{ForgeError, Result};
use crate::matchers::parse_selector;
use crate::remote::RemoteClient;
use crate::types::Timestamp;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Export windows are cut at this width, matching the default block span.
const EXPORT_WINDOW_MS: i64 = 2 * 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub output_file: PathBuf,
    pub base_url: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sample_interval: Duration,
    pub matcher_expressions: Vec<String>,
}

/// Runs one export.
pub fn export(config: &ExportConfig) -> Result<()> {
    // Parse every selector up front so config errors surface before any
    // network traffic.
    let mut matcher_sets = BTreeSet::new();
    for expression in &config.matcher_expressions {
        parse_selector(expression)?;
        matcher_sets.insert(expression.clone());
    }
    if matcher_sets.is_empty() {
        return Err(ForgeError::Config("no matchers to export".to_string()));
    }

    let client = RemoteClient::new("export", &config.base_url)?;
    let file = File::create(&config.output_file)?;
    let mut writer = zstd::stream::write::Encoder::new(file, 0)
        .map_err(ForgeError::Io)?;
    writer
        .include_checksum(true)
        .map_err(ForgeError::Io)?;

    let start_ms = config.start.timestamp_millis();
    let end_ms = config.end.timestamp_millis();
    let step = duration_to_millis(config.sample_interval);

    let mut block_start = start_ms;
    while block_start < end_ms {
        let block_end = (block_start + EXPORT_WINDOW_MS).min(end_ms);
        export_window(
            &client,
            &mut writer,
            &matcher_sets,
            block_start,
            block_end,
            step,
        )?;
        block_start += EXPORT_WINDOW_MS;
    }

    writer.finish().map_err(ForgeError::Io)?;
    Ok(())
}

fn export_window<W: Write>(
    client: &RemoteClient,
    writer: &mut W,
    matcher_sets: &BTreeSet<String>,
    start: Timestamp,
    end: Timestamp,
    step: Timestamp,
) -> Result<()> {
    let mut builder = BlockDocBuilder::new(start, end, step);
    for expression in matcher_sets {
        tracing::info!(
            "Exporting '{}' from {}",
            expression,
            crate::common::format_date_range(start, end)
        );
        let matrix = client.query_range(expression, start, end, step)?;
        builder.add(&matrix)?;
    }
    let doc = builder.build();
    serde_json::to_writer(&mut *writer, &doc)
        .map_err(|e| ForgeError::Serialization(format!("failed to encode block document: {}", e)))?;
    writer.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_matcher_fails_before_network() {
        let config = ExportConfig {
            output_file: PathBuf::from("/nonexistent/out.zst"),
            base_url: "http://localhost:1".to_string(),
            start: Utc::now(),
            end: Utc::now(),
            sample_interval: Duration::from_secs(15),
            matcher_expressions: vec!["up{bad=".to_string()],
        };
        assert!(matches!(export(&config), Err(ForgeError::Parse(_))));
    }

    #[test]
    fn test_empty_matchers_rejected() {
        let config = ExportConfig {
            output_file: PathBuf::from("/nonexistent/out.zst"),
            base_url: "http://localhost:1".to_string(),
            start: Utc::now(),
            end: Utc::now(),
            sample_interval: Duration::from_secs(15),
            matcher_expressions: vec![],
        };
        assert!(matches!(export(&config), Err(ForgeError::Config(_))));
    }
}
