use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use xxhash_rust::xxh64::xxh64;

/// Timestamp type (milliseconds since epoch).
pub type Timestamp = i64;

/// Value type.
pub type Value = f64;

/// Reserved label name carrying the series name.
pub const METRIC_NAME: &str = "__name__";

/// Reserved label name carrying the instance identity.
pub const INSTANCE_NAME: &str = "instance";

/// Bit pattern of the stale marker NaN. Samples carrying this value mark a
/// series as stale and are dropped on ingest.
pub const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

/// True iff `v` is the stale marker NaN (exact bit match, not any NaN).
#[inline]
pub fn is_stale_nan(v: Value) -> bool {
    v.to_bits() == STALE_NAN_BITS
}

/// A single label: a name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Label {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A sorted label set identifying a series. Labels are kept sorted by name;
/// construction through [`Labels::from_pairs`] or [`LabelsBuilder`] maintains
/// the invariant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new() -> Self {
        Labels(Vec::new())
    }

    /// Builds a sorted label set from name/value pairs. Later duplicates of
    /// the same name win.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut builder = LabelsBuilder::new();
        for (name, value) in pairs {
            builder.set(name, value);
        }
        builder.build()
    }

    /// Builds a sorted label set from a map (already unique by name).
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        Labels(
            map.iter()
                .map(|(k, v)| Label::new(k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// The value of the reserved `__name__` label, or "" when absent.
    pub fn metric_name(&self) -> &str {
        self.get(METRIC_NAME).unwrap_or("")
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 64-bit physical identity of the label set. Hashes names and values in
    /// sorted order with NUL separators so `{a="b,c"}` and `{a="b", b="c"}`
    /// cannot collide structurally.
    pub fn hash(&self) -> u64 {
        let mut buf = Vec::with_capacity(64);
        for l in &self.0 {
            buf.extend_from_slice(l.name.as_bytes());
            buf.push(0);
            buf.extend_from_slice(l.value.as_bytes());
            buf.push(0);
        }
        xxh64(&buf, 0)
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.metric_name();
        write!(f, "{}{{", name)?;
        let mut first = true;
        for l in &self.0 {
            if l.name == METRIC_NAME {
                continue;
            }
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}={:?}", l.name, l.value)?;
        }
        write!(f, "}}")
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Incremental builder keeping the sorted-by-name invariant.
#[derive(Debug, Default, Clone)]
pub struct LabelsBuilder {
    labels: BTreeMap<String, String>,
}

impl LabelsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_labels(labels: &Labels) -> Self {
        LabelsBuilder {
            labels: labels.to_map(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.labels.remove(name);
        self
    }

    pub fn build(&self) -> Labels {
        Labels::from_map(&self.labels)
    }
}

/// A single timestamped point within a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub t: Timestamp,
    pub v: Value,
}

/// One sample: a metric identity plus a point.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: Labels,
    pub t: Timestamp,
    pub v: Value,
}

/// One series of a matrix result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub metric: Labels,
    pub points: Vec<Point>,
}

/// A range-query result: many series, each with ascending points.
pub type Matrix = Vec<Series>;

/// An instant-query result: one sample per matched series.
pub type Vector = Vec<Sample>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_deduped() {
        let labels = Labels::from_pairs([("b", "2"), ("a", "1"), ("b", "3")]);
        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(labels.get("b"), Some("3"), "later duplicate wins");
    }

    #[test]
    fn test_labels_hash_stable_and_structural() {
        let a = Labels::from_pairs([("x", "1"), ("y", "2")]);
        let b = Labels::from_pairs([("y", "2"), ("x", "1")]);
        assert_eq!(a.hash(), b.hash(), "order of construction must not matter");

        let c = Labels::from_pairs([("x", "1\u{0}y"), ("2", "")]);
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_metric_name() {
        let labels = Labels::from_pairs([(METRIC_NAME, "up"), ("job", "node")]);
        assert_eq!(labels.metric_name(), "up");
        assert_eq!(format!("{}", labels), "up{job=\"node\"}");
    }

    #[test]
    fn test_stale_nan_detection() {
        assert!(is_stale_nan(f64::from_bits(STALE_NAN_BITS)));
        assert!(!is_stale_nan(f64::NAN));
        assert!(!is_stale_nan(1.0));
    }
}
