//! Columnar codec: run-length + double-delta sequences over int64/float64
//! columns and an insertion-ordered string dictionary.
//!
//! A column is a sequence of `(count, value)` pairs. The first pair is the
//! anchor value (count 1), the second the first delta (count 1), and every
//! later pair a run of equal deltas-of-deltas. Serialized to JSON a pair
//! becomes a plain number when `count == 1` and the string `"count:value"`
//! otherwise; NaN is carried as the string `"NaN"`.

use crate::error::{ForgeError, Result};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::ops::{Add, Sub};

mod sealed {
    pub trait Sealed {}
    impl Sealed for i64 {}
    impl Sealed for f64 {}
}

/// Numeric column element. Implemented for `i64` and `f64` only.
pub trait Number:
    Copy + PartialEq + Add<Output = Self> + Sub<Output = Self> + std::fmt::Debug + sealed::Sealed
{
    fn zero() -> Self;
    fn from_i64(v: i64) -> Option<Self>;
    fn from_f64(v: f64) -> Option<Self>;
    /// Minimal decimal text used inside `"count:value"` strings.
    fn format_compact(&self) -> String;
    fn parse_compact(s: &str) -> Option<Self>;
    fn serialize_plain<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>;
    /// Non-finite values cannot be JSON numbers; NaN is carried as a string.
    fn non_finite_repr(&self) -> Option<&'static str> {
        None
    }
}

impl Number for i64 {
    fn zero() -> Self {
        0
    }

    fn from_i64(v: i64) -> Option<Self> {
        Some(v)
    }

    fn from_f64(v: f64) -> Option<Self> {
        if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
            Some(v as i64)
        } else {
            None
        }
    }

    fn format_compact(&self) -> String {
        self.to_string()
    }

    fn parse_compact(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    fn serialize_plain<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(*self)
    }
}

impl Number for f64 {
    fn zero() -> Self {
        0.0
    }

    fn from_i64(v: i64) -> Option<Self> {
        Some(v as f64)
    }

    fn from_f64(v: f64) -> Option<Self> {
        Some(v)
    }

    fn format_compact(&self) -> String {
        if self.is_nan() {
            "NaN".to_string()
        } else {
            // Display for f64 is the shortest decimal that round-trips.
            format!("{}", self)
        }
    }

    fn parse_compact(s: &str) -> Option<Self> {
        if s == "NaN" {
            return Some(f64::NAN);
        }
        s.parse().ok()
    }

    fn serialize_plain<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(*self)
    }

    fn non_finite_repr(&self) -> Option<&'static str> {
        if self.is_nan() {
            Some("NaN")
        } else {
            None
        }
    }
}

/// One run of an encoded column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodedValue<V: Number> {
    pub count: usize,
    pub value: V,
}

impl<V: Number> EncodedValue<V> {
    pub fn new(count: usize, value: V) -> Self {
        EncodedValue { count, value }
    }
}

impl<V: Number> Serialize for EncodedValue<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.count == 1 {
            if let Some(repr) = self.value.non_finite_repr() {
                return serializer.serialize_str(repr);
            }
            self.value.serialize_plain(serializer)
        } else {
            serializer.serialize_str(&format!("{}:{}", self.count, self.value.format_compact()))
        }
    }
}

impl<'de, V: Number> Deserialize<'de> for EncodedValue<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Int(i64),
            Float(f64),
            Str(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Int(v) => V::from_i64(v)
                .map(|value| EncodedValue { count: 1, value })
                .ok_or_else(|| D::Error::custom(format!("value {} does not fit the column type", v))),
            Repr::Float(v) => V::from_f64(v)
                .map(|value| EncodedValue { count: 1, value })
                .ok_or_else(|| D::Error::custom(format!("value {} does not fit the column type", v))),
            Repr::Str(s) => {
                if let Some(value) = V::parse_compact(&s) {
                    return Ok(EncodedValue { count: 1, value });
                }
                let (count, value) = s
                    .split_once(':')
                    .ok_or_else(|| D::Error::custom(format!("malformed encoded value {:?}", s)))?;
                let count: usize = count
                    .parse()
                    .map_err(|_| D::Error::custom(format!("malformed run count in {:?}", s)))?;
                let value = V::parse_compact(value)
                    .ok_or_else(|| D::Error::custom(format!("malformed run value in {:?}", s)))?;
                Ok(EncodedValue { count, value })
            }
        }
    }
}

/// Streaming double-delta encoder. `add` values in order, then `finish` to
/// take the encoded column.
#[derive(Debug)]
pub struct DoubleDeltaEncoder<V: Number> {
    closed: bool,
    mode: u8,
    count: usize,
    value: V,
    delta: V,
    delta_of_delta: V,
    values: Vec<EncodedValue<V>>,
}

impl<V: Number> DoubleDeltaEncoder<V> {
    pub fn new() -> Self {
        DoubleDeltaEncoder {
            closed: false,
            mode: 0,
            count: 0,
            value: V::zero(),
            delta: V::zero(),
            delta_of_delta: V::zero(),
            values: Vec::new(),
        }
    }

    pub fn add(&mut self, value: V) -> Result<()> {
        if self.closed {
            return Err(ForgeError::Internal("encoder is closed".to_string()));
        }
        if self.mode == 0 {
            self.value = value;
            self.values.push(EncodedValue::new(1, value));
            self.mode = 1;
            return Ok(());
        }

        let delta = value - self.value;
        self.value = value;
        if self.mode == 1 {
            self.delta = delta;
            self.values.push(EncodedValue::new(1, delta));
            self.mode = 2;
            return Ok(());
        }

        let delta_of_delta = delta - self.delta;
        self.delta = delta;
        if self.mode == 2 {
            self.delta_of_delta = delta_of_delta;
            self.count = 1;
            self.mode = 3;
            return Ok(());
        }

        if delta_of_delta == self.delta_of_delta {
            self.count += 1;
            return Ok(());
        }

        self.values
            .push(EncodedValue::new(self.count, self.delta_of_delta));
        self.delta_of_delta = delta_of_delta;
        self.count = 1;
        Ok(())
    }

    /// Flushes the pending run and returns the encoded column. The encoder
    /// rejects further `add` calls afterwards.
    pub fn finish(&mut self) -> Vec<EncodedValue<V>> {
        self.closed = true;
        if self.mode == 3 {
            self.values
                .push(EncodedValue::new(self.count, self.delta_of_delta));
        }
        std::mem::take(&mut self.values)
    }

    pub fn is_empty(&self) -> bool {
        self.mode == 0
    }
}

impl<V: Number> Default for DoubleDeltaEncoder<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator decoding an encoded column back into its values.
#[derive(Debug)]
pub struct DoubleDeltaDecoder<'a, V: Number> {
    column: &'a [EncodedValue<V>],
    pos: usize,
    remaining: usize,
    mode: u8,
    value: V,
    delta: V,
}

impl<'a, V: Number> DoubleDeltaDecoder<'a, V> {
    pub fn new(column: &'a [EncodedValue<V>]) -> Self {
        DoubleDeltaDecoder {
            column,
            pos: 0,
            remaining: 0,
            mode: 0,
            value: V::zero(),
            delta: V::zero(),
        }
    }
}

impl<'a, V: Number> Iterator for DoubleDeltaDecoder<'a, V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        if self.remaining == 0 {
            let ev = *self.column.get(self.pos)?;
            self.pos += 1;
            match self.mode {
                0 => {
                    self.value = ev.value;
                    self.mode = 1;
                    return Some(self.value);
                }
                1 => {
                    self.delta = ev.value;
                    self.value = self.value + self.delta;
                    self.mode = 2;
                    return Some(self.value);
                }
                _ => {
                    // A run of `count` equal deltas-of-deltas.
                    self.delta = self.delta + ev.value;
                    self.value = self.value + self.delta;
                    if ev.count > 1 {
                        // Stay on this pair for the rest of the run.
                        self.remaining = ev.count - 1;
                        self.pos -= 1;
                    }
                    return Some(self.value);
                }
            }
        }
        // Continue the current run.
        let ev = self.column[self.pos];
        self.delta = self.delta + ev.value;
        self.value = self.value + self.delta;
        self.remaining -= 1;
        if self.remaining == 0 {
            self.pos += 1;
        }
        Some(self.value)
    }
}

/// Decodes an entire column.
pub fn decode_column<V: Number>(column: &[EncodedValue<V>]) -> Vec<V> {
    DoubleDeltaDecoder::new(column).collect()
}

/// Insertion-ordered string table shared by every series of a block. Ids are
/// assigned in first-seen order; `values` returns the table in id order.
#[derive(Debug, Default)]
pub struct Dictionary {
    ids: HashMap<String, i64>,
    strings: Vec<String>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stable id for `value`, inserting it on first sight.
    pub fn add(&mut self, value: &str) -> i64 {
        if let Some(id) = self.ids.get(value) {
            return *id;
        }
        let id = self.strings.len() as i64;
        self.ids.insert(value.to_string(), id);
        self.strings.push(value.to_string());
        id
    }

    pub fn values(&self) -> &[String] {
        &self.strings
    }

    pub fn into_values(self) -> Vec<String> {
        self.strings
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Opens a per-series view encoding ids with double-delta.
    pub fn view(&mut self) -> DictionaryView<'_> {
        DictionaryView {
            dictionary: self,
            ids: DoubleDeltaEncoder::new(),
        }
    }
}

/// Per-series encoder over the shared dictionary.
#[derive(Debug)]
pub struct DictionaryView<'a> {
    dictionary: &'a mut Dictionary,
    ids: DoubleDeltaEncoder<i64>,
}

impl<'a> DictionaryView<'a> {
    pub fn add(&mut self, value: &str) -> Result<()> {
        let id = self.dictionary.add(value);
        self.ids.add(id)
    }

    pub fn finish(mut self) -> Vec<EncodedValue<i64>> {
        self.ids.finish()
    }
}
