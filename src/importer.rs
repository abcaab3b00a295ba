//! Import: stream-decode zstd-compressed block documents from files and
//! append their samples into a destination store, committing once per run.

use crate::blockdoc::BlockDoc;
use crate::error::{ForgeError, Result};
use crate::tsdb::{BlockWriter, DEFAULT_BLOCK_DURATION};
use serde_json::Deserializer;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub output_directory: PathBuf,
    pub data_files: Vec<PathBuf>,
}

/// Runs one import. Every data file is consumed before anything is flushed,
/// so a half-read file never leaves partial blocks behind.
pub fn import(config: &ImportConfig) -> Result<()> {
    if config.data_files.is_empty() {
        return Err(ForgeError::Config("no data files to import".to_string()));
    }
    let mut writer = BlockWriter::new(&config.output_directory, DEFAULT_BLOCK_DURATION)?;

    let mut total_samples = 0u64;
    for data_file in &config.data_files {
        tracing::info!(file = %data_file.display(), "Importing data file");
        total_samples += import_data_file(data_file, &mut writer).map_err(|e| {
            ForgeError::Internal(format!(
                "failed to import data file '{}': {}",
                data_file.display(),
                e
            ))
        })?;
    }

    tracing::info!(samples = total_samples, "Committing data");
    writer.commit()?;
    writer.flush()?;
    Ok(())
}

fn import_data_file(path: &Path, writer: &mut BlockWriter) -> Result<u64> {
    let file = File::open(path)?;
    let decoder = zstd::stream::read::Decoder::new(BufReader::new(file)).map_err(ForgeError::Io)?;
    let stream = Deserializer::from_reader(decoder).into_iter::<BlockDoc>();

    let mut block_count = 0u64;
    let mut sample_count = 0u64;
    for doc in stream {
        let doc = doc.map_err(|e| ForgeError::Serialization(format!("failed to read value: {}", e)))?;
        block_count += 1;
        for sample in doc.iter() {
            let sample = sample?;
            match writer.append(&sample.metric, sample.t, sample.v) {
                Ok(()) => sample_count += 1,
                Err(e) if e.is_transient_append() => {
                    tracing::debug!(metric = %sample.metric, t = sample.t, error = %e, "dropping sample");
                }
                Err(e) => {
                    return Err(ForgeError::Storage(format!(
                        "failed to add sample for metric '{}' from block {}: {}",
                        sample.metric, block_count, e
                    )))
                }
            }
        }
    }
    tracing::info!(
        file = %path.display(),
        samples = sample_count,
        blocks = block_count,
        "imported"
    );
    Ok(sample_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdoc::BlockDocBuilder;
    use crate::matchers::parse_selector;
    use crate::tsdb::{Db, DbOptions};
    use crate::types::{Labels, Point, Series, METRIC_NAME};
    use std::io::Write;
    use tempfile::TempDir;

    fn write_export_file(path: &Path, docs: &[crate::blockdoc::BlockDoc]) {
        let file = File::create(path).unwrap();
        let mut encoder = zstd::stream::write::Encoder::new(file, 0).unwrap();
        encoder.include_checksum(true).unwrap();
        for doc in docs {
            serde_json::to_writer(&mut encoder, doc).unwrap();
            encoder.write_all(b"\n").unwrap();
        }
        encoder.finish().unwrap();
    }

    fn doc_with_samples() -> crate::blockdoc::BlockDoc {
        let series = vec![Series {
            metric: Labels::from_pairs([(METRIC_NAME, "up"), ("job", "node")]),
            points: (0..4)
                .map(|i| Point {
                    t: i * 15_000,
                    v: i as f64,
                })
                .collect(),
        }];
        let mut builder = BlockDocBuilder::new(0, 60_000, 15_000);
        builder.add(&series).unwrap();
        builder.build()
    }

    #[test]
    fn test_import_round_trip() {
        let tmp = TempDir::new().unwrap();
        let data_file = tmp.path().join("export.zst");
        write_export_file(&data_file, &[doc_with_samples()]);

        let out = tmp.path().join("out");
        import(&ImportConfig {
            output_directory: out.clone(),
            data_files: vec![data_file],
        })
        .unwrap();

        let db = Db::open(&out, DbOptions::default()).unwrap();
        let matchers = parse_selector("up").unwrap();
        let matrix = db.read_series(&matchers, 0, 100_000).unwrap();
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix[0].points.len(), 4);
        assert_eq!(matrix[0].metric.get("job"), Some("node"));
    }

    #[test]
    fn test_import_multiple_documents_per_file() {
        let tmp = TempDir::new().unwrap();
        let data_file = tmp.path().join("export.zst");
        write_export_file(&data_file, &[doc_with_samples(), doc_with_samples()]);

        let out = tmp.path().join("out");
        // The second document's samples are duplicates and drop silently.
        import(&ImportConfig {
            output_directory: out.clone(),
            data_files: vec![data_file],
        })
        .unwrap();

        let db = Db::open(&out, DbOptions::default()).unwrap();
        let matchers = parse_selector("up").unwrap();
        let matrix = db.read_series(&matchers, 0, 100_000).unwrap();
        assert_eq!(matrix[0].points.len(), 4);
    }

    #[test]
    fn test_import_rejects_missing_file() {
        let tmp = TempDir::new().unwrap();
        let res = import(&ImportConfig {
            output_directory: tmp.path().join("out"),
            data_files: vec![tmp.path().join("nope.zst")],
        });
        assert!(res.is_err());
    }

    #[test]
    fn test_import_requires_files() {
        let tmp = TempDir::new().unwrap();
        let res = import(&ImportConfig {
            output_directory: tmp.path().join("out"),
            data_files: vec![],
        });
        assert!(matches!(res, Err(ForgeError::Config(_))));
    }
}
