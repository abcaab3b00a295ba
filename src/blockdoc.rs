//! Export block documents: a self-contained columnar encoding of a time
//! range. Each document carries the shared string table plus per-series
//! dictionary-encoded labels and double-delta timestamp/value columns, and
//! serializes as one JSON object.

use crate::encoding::{
    decode_column, Dictionary, DoubleDeltaDecoder, DoubleDeltaEncoder, EncodedValue,
};
use crate::error::{ForgeError, Result};
use crate::types::{is_stale_nan, Labels, Sample, Series, Timestamp};
use serde::{Deserialize, Serialize};

/// One exported block document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockDoc {
    pub start: Timestamp,
    pub end: Timestamp,
    pub step: Timestamp,
    pub strings: Vec<String>,
    pub labels: Vec<Vec<EncodedValue<i64>>>,
    pub timestamps: Vec<Vec<EncodedValue<i64>>>,
    pub values: Vec<Vec<EncodedValue<f64>>>,
}

/// Builds a block document from raw series.
pub struct BlockDocBuilder {
    dictionary: Dictionary,
    start: Timestamp,
    end: Timestamp,
    step: Timestamp,
    labels: Vec<Vec<EncodedValue<i64>>>,
    timestamps: Vec<Vec<EncodedValue<i64>>>,
    values: Vec<Vec<EncodedValue<f64>>>,
}

impl BlockDocBuilder {
    pub fn new(start: Timestamp, end: Timestamp, step: Timestamp) -> Self {
        BlockDocBuilder {
            dictionary: Dictionary::new(),
            start,
            end,
            step,
            labels: Vec::new(),
            timestamps: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Adds one batch of series. Stale markers are skipped; timestamps are
    /// rounded onto the step grid so regular series compress to a handful of
    /// runs.
    pub fn add(&mut self, series: &[Series]) -> Result<()> {
        for s in series {
            let mut started = false;
            let mut label_view = self.dictionary.view();
            let mut ts_encoder = DoubleDeltaEncoder::<i64>::new();
            let mut value_encoder = DoubleDeltaEncoder::<f64>::new();
            for p in &s.points {
                if is_stale_nan(p.v) {
                    continue;
                }
                if !started {
                    started = true;
                    for l in &s.metric {
                        label_view.add(&l.name)?;
                        label_view.add(&l.value)?;
                    }
                }
                ts_encoder.add(round_to_step(p.t, self.step))?;
                value_encoder.add(p.v)?;
            }
            let labels = label_view.finish();
            let timestamps = ts_encoder.finish();
            let values = value_encoder.finish();
            if !labels.is_empty() && !timestamps.is_empty() && !values.is_empty() {
                self.labels.push(labels);
                self.timestamps.push(timestamps);
                self.values.push(values);
            }
        }
        Ok(())
    }

    pub fn build(self) -> BlockDoc {
        BlockDoc {
            start: self.start,
            end: self.end,
            step: self.step,
            strings: self.dictionary.into_values(),
            labels: self.labels,
            timestamps: self.timestamps,
            values: self.values,
        }
    }
}

fn round_to_step(t: Timestamp, step: Timestamp) -> Timestamp {
    if step <= 0 {
        return t;
    }
    ((t as f64 / step as f64).round() * step as f64) as i64
}

impl BlockDoc {
    /// Iterates every sample of the document, series by series.
    pub fn iter(&self) -> BlockDocIter<'_> {
        BlockDocIter {
            doc: self,
            series_idx: 0,
            current: None,
        }
    }

    /// Decodes the label set of series `idx`.
    fn series_labels(&self, idx: usize) -> Result<Labels> {
        let ids = decode_column(&self.labels[idx]);
        if ids.len() % 2 != 0 {
            return Err(ForgeError::Corruption {
                details: "label column holds an odd number of ids".to_string(),
            });
        }
        let mut pairs = Vec::with_capacity(ids.len() / 2);
        for chunk in ids.chunks(2) {
            let name = self.lookup_string(chunk[0])?;
            let value = self.lookup_string(chunk[1])?;
            pairs.push((name, value));
        }
        Ok(Labels::from_pairs(pairs))
    }

    fn lookup_string(&self, id: i64) -> Result<String> {
        self.strings
            .get(id as usize)
            .cloned()
            .ok_or_else(|| ForgeError::Corruption {
                details: format!("string id {} out of range", id),
            })
    }
}

struct CurrentSeries<'a> {
    labels: Labels,
    timestamps: DoubleDeltaDecoder<'a, i64>,
    values: DoubleDeltaDecoder<'a, f64>,
}

/// Streaming sample iterator over a block document.
pub struct BlockDocIter<'a> {
    doc: &'a BlockDoc,
    series_idx: usize,
    current: Option<CurrentSeries<'a>>,
}

impl<'a> Iterator for BlockDocIter<'a> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        let doc = self.doc;
        loop {
            if self.current.is_none() {
                if self.series_idx >= doc.labels.len() {
                    return None;
                }
                let labels = match doc.series_labels(self.series_idx) {
                    Ok(labels) => labels,
                    Err(e) => {
                        self.series_idx = doc.labels.len();
                        return Some(Err(e));
                    }
                };
                self.current = Some(CurrentSeries {
                    labels,
                    timestamps: DoubleDeltaDecoder::new(&doc.timestamps[self.series_idx]),
                    values: DoubleDeltaDecoder::new(&doc.values[self.series_idx]),
                });
            }

            let series = self.current.as_mut().expect("current series set above");
            match (series.timestamps.next(), series.values.next()) {
                (Some(t), Some(v)) => {
                    return Some(Ok(Sample {
                        metric: series.labels.clone(),
                        t,
                        v,
                    }))
                }
                (None, None) => {
                    self.current = None;
                    self.series_idx += 1;
                }
                _ => {
                    self.series_idx = doc.labels.len();
                    return Some(Err(ForgeError::Corruption {
                        details: "timestamp/value count mismatch".to_string(),
                    }));
                }
            }
        }
    }
}
