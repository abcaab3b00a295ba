#![doc = r#"
tsforge: Batch Toolkit for a Block-Structured Time-Series Database

This crate provides bulk operations against a TSDB whose storage unit is the
immutable, time-aligned block directory. It supports:
- Backfilling recording rules over history into new series
- Migrating raw series from a remote query endpoint by label selectors
- Generating synthetic series from arithmetic expressions with per-instance state
- Exporting and importing a compact columnar encoding of a time range
- Testing alerting rules over historical data

The core is the planned block writer pipeline: a producer plans work into
block-aligned chunks, a fixed pool of consumers executes them into a staging
store, and finished blocks are compacted and atomically promoted into the
destination directory.

See the README for usage examples and more details.
"#]
// Declare modules
pub mod alert;
pub mod append;
pub mod backfill;
pub mod blockdoc;
pub mod common;
pub mod database;
pub mod downsample;
pub mod encoding;
pub mod error;
pub mod exporter;
pub mod generate;
pub mod importer;
pub mod matchers;
pub mod mathfn;
pub mod migrate;
pub mod pipeline;
pub mod planner;
pub mod query;
pub mod remote;
pub mod rules;
pub mod tsdb;
pub mod types;
pub mod web;

/// Error type for toolkit operations.
pub use crate::error::{ForgeError, Result};
/// The producer/consumer pipeline integrating planner, appenders, and executors.
pub use crate::pipeline::{PlanExecutor, PlanExecutorFactory, PlannedBlockWriter};
/// Planner configuration shared by every pipeline adaptor.
pub use crate::planner::{PlanEntry, PlanGenerator, PlannerConfig};
/// A single timestamped sample and its series identity.
pub use crate::types::{Label, Labels, Sample, Timestamp, Value};
