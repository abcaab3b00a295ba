//! Generate: synthesize series from arithmetic expressions with mutable
//! per-instance state, through the planned block writer. Optionally follows
//! up with a recording-rule pass over the generated data.

use crate::append::SafeAppender;
use crate::backfill::run_recording_rules;
use crate::common::Canceller;
use crate::error::{ForgeError, Result};
use crate::pipeline::{PlanExecutor, PlanExecutorFactory, PlannedBlockWriter};
use crate::planner::{PlanEntry, PlanGenerator, PlannerConfig};
use crate::mathfn::MathFn;
use crate::rules::{recording_rules, RuleGroup};
use crate::types::{Labels, LabelsBuilder, Sample, INSTANCE_NAME, METRIC_NAME};
use chrono::{DateTime, Utc};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, multispace0, satisfy},
    combinator::{map, recognize},
    multi::{many0, separated_list0},
    number::complete::double,
    sequence::{delimited, pair, preceded},
    IResult,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Mutable evaluation state of one metric instance.
#[derive(Debug, Clone, Default)]
pub struct GenState {
    /// Count of samples evaluated so far for this instance.
    pub index: f64,
    /// Anchor timestamp of the chunk being generated, in milliseconds.
    pub timestamp: f64,
    /// Result of the previous evaluation.
    pub last: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateField {
    Index,
    Timestamp,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone)]
enum Expr {
    Number(f64),
    Field(StateField),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(MathFn, Vec<Expr>),
}

impl Expr {
    fn eval(&self, state: &GenState) -> f64 {
        match self {
            Expr::Number(v) => *v,
            Expr::Field(StateField::Index) => state.index,
            Expr::Field(StateField::Timestamp) => state.timestamp,
            Expr::Field(StateField::Last) => state.last,
            Expr::Neg(inner) => -inner.eval(state),
            Expr::Binary(op, lhs, rhs) => {
                let l = lhs.eval(state);
                let r = rhs.eval(state);
                match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                    BinOp::Rem => l % r,
                }
            }
            Expr::Call(f, args) => {
                let values: Vec<f64> = args.iter().map(|a| a.eval(state)).collect();
                f.apply(&values)
            }
        }
    }
}

/// A parsed generator expression.
#[derive(Debug, Clone)]
pub struct Expression {
    text: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(text: &str) -> Result<Self> {
        match parse_expr(text.trim()) {
            Ok((rest, ast)) if rest.trim().is_empty() => {
                check_arity(&ast, text)?;
                Ok(Expression {
                    text: text.to_string(),
                    ast,
                })
            }
            Ok((rest, _)) => Err(ForgeError::Expression(format!(
                "failed to parse expression: '{}': unexpected trailing input {:?}",
                text, rest
            ))),
            Err(e) => Err(ForgeError::Expression(format!(
                "failed to parse expression: '{}': {}",
                text, e
            ))),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn eval(&self, state: &GenState) -> f64 {
        self.ast.eval(state)
    }
}

fn check_arity(expr: &Expr, text: &str) -> Result<()> {
    match expr {
        Expr::Call(f, args) => {
            if args.len() != f.arity() {
                return Err(ForgeError::Expression(format!(
                    "failed to parse expression: '{}': {:?} takes {} argument(s), got {}",
                    text,
                    f,
                    f.arity(),
                    args.len()
                )));
            }
            for arg in args {
                check_arity(arg, text)?;
            }
            Ok(())
        }
        Expr::Neg(inner) => check_arity(inner, text),
        Expr::Binary(_, lhs, rhs) => {
            check_arity(lhs, text)?;
            check_arity(rhs, text)
        }
        _ => Ok(()),
    }
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        many0(satisfy(|c| c.is_ascii_alphanumeric() || c == '_')),
    ))(input)
}

fn parse_field(input: &str) -> IResult<&str, Expr> {
    let (input, _) = tag("state.")(input)?;
    let (input, name) = identifier(input)?;
    let field = match name {
        "Index" => StateField::Index,
        "Timestamp" => StateField::Timestamp,
        "Last" => StateField::Last,
        _ => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )))
        }
    };
    Ok((input, Expr::Field(field)))
}

fn parse_call(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = identifier(input)?;
    let Some(func) = MathFn::lookup(name) else {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        )));
    };
    let (rest, args) = delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), parse_expr_inner),
        char(')'),
    )(rest)?;
    Ok((rest, Expr::Call(func, args)))
}

fn parse_primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        parse_field,
        parse_call,
        delimited(char('('), parse_expr_inner, char(')')),
        map(double, Expr::Number),
    )))(input)
}

fn parse_unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('-')), parse_unary), |e| {
            Expr::Neg(Box::new(e))
        }),
        parse_primary,
    ))(input)
}

fn parse_term(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut acc) = parse_unary(input)?;
    loop {
        let op = {
            let r: IResult<&str, char> = ws(alt((char('*'), char('/'), char('%'))))(input);
            match r {
                Ok((rest, c)) => {
                    input = rest;
                    Some(c)
                }
                Err(_) => None,
            }
        };
        let Some(c) = op else { break };
        let (rest, rhs) = parse_unary(input)?;
        input = rest;
        let op = match c {
            '*' => BinOp::Mul,
            '/' => BinOp::Div,
            _ => BinOp::Rem,
        };
        acc = Expr::Binary(op, Box::new(acc), Box::new(rhs));
    }
    Ok((input, acc))
}

fn parse_expr_inner(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut acc) = parse_term(input)?;
    loop {
        let op = {
            let r: IResult<&str, char> = ws(alt((char('+'), char('-'))))(input);
            match r {
                Ok((rest, c)) => {
                    input = rest;
                    Some(c)
                }
                Err(_) => None,
            }
        };
        let Some(c) = op else { break };
        let (rest, rhs) = parse_term(input)?;
        input = rest;
        let op = if c == '+' { BinOp::Add } else { BinOp::Sub };
        acc = Expr::Binary(op, Box::new(acc), Box::new(rhs));
    }
    Ok((input, acc))
}

fn parse_expr(input: &str) -> IResult<&str, Expr> {
    parse_expr_inner(input)
}

/// Metric config file: the set of series to synthesize.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricConfig {
    #[serde(rename = "timeSeries")]
    pub time_series: Vec<TimeSeriesDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeSeriesDef {
    pub name: String,
    pub instances: Vec<String>,
    #[serde(default)]
    pub labels: Vec<HashMap<String, String>>,
    pub expression: String,
}

pub fn load_metric_config(path: &Path) -> Result<MetricConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ForgeError::Config(format!("could not read file {:?}: {}", path, e)))?;
    serde_yaml::from_str(&text)
        .map_err(|e| ForgeError::Config(format!("could not parse file {:?}: {}", path, e)))
}

#[derive(Debug, Clone)]
pub struct GenerateConfig {
    pub output_directory: PathBuf,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sample_interval: Duration,
    pub parallelism: usize,
    pub metric_config: MetricConfig,
    pub rule_groups: Vec<RuleGroup>,
}

/// One metric to synthesize, with per-instance mutable state shared by all
/// of its plan entries.
pub struct Metric {
    name: String,
    expression: Expression,
    instances: Vec<MetricInstance>,
    sequencer: ChunkSequencer,
}

struct MetricInstance {
    labels: Labels,
    state: Mutex<GenState>,
}

/// Serializes the chunks of one metric into chronological order.
///
/// Consumers pull entries from a shared channel with no order among the
/// sub-chunks of a block, but `state.Index` and `state.Last` only make
/// sense when chunks apply in time order. The planner emits chunks
/// chronologically, so the generator stamps each entry with a running
/// sequence number and executors take turns on it here.
#[derive(Debug, Default)]
struct ChunkSequencer {
    next: Mutex<u64>,
    cond: Condvar,
}

impl ChunkSequencer {
    /// Blocks until it is `seq`'s turn or the canceller fires.
    fn wait_for_turn(&self, seq: u64, canceller: &Canceller) -> Result<()> {
        let mut next = self.next.lock()?;
        while *next != seq {
            if canceller.is_cancelled() {
                return Err(ForgeError::Cancelled);
            }
            let (guard, _timeout) = self
                .cond
                .wait_timeout(next, Duration::from_millis(20))?;
            next = guard;
        }
        Ok(())
    }

    fn complete(&self, seq: u64) {
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        *next = seq + 1;
        self.cond.notify_all();
    }
}

/// Plan payload for one metric chunk: the shared metric plus its position
/// in that metric's chronological chunk order.
pub struct MetricChunk {
    metric: Arc<Metric>,
    seq: u64,
}

impl fmt::Display for MetricChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metric.name)
    }
}

fn build_metrics(config: &MetricConfig) -> Result<Vec<Arc<Metric>>> {
    let mut metrics = Vec::with_capacity(config.time_series.len());
    for def in &config.time_series {
        let expression = Expression::parse(&def.expression)?;
        let mut instances = Vec::new();
        // An absent labels list still yields one instance per name.
        let label_sets: Vec<HashMap<String, String>> = if def.labels.is_empty() {
            vec![HashMap::new()]
        } else {
            def.labels.clone()
        };
        for instance in &def.instances {
            for label_set in &label_sets {
                let mut builder = LabelsBuilder::new();
                for (name, value) in label_set {
                    builder.set(name.clone(), value.clone());
                }
                builder.set(METRIC_NAME, def.name.clone());
                builder.set(INSTANCE_NAME, instance.clone());
                instances.push(MetricInstance {
                    labels: builder.build(),
                    state: Mutex::new(GenState::default()),
                });
            }
        }
        metrics.push(Arc::new(Metric {
            name: def.name.clone(),
            expression,
            instances,
            sequencer: ChunkSequencer::default(),
        }));
    }
    Ok(metrics)
}

/// Runs one generation, then an optional recording-rule pass over the
/// freshly promoted data.
pub fn generate(config: &GenerateConfig) -> Result<()> {
    let metrics = build_metrics(&config.metric_config)?;
    if metrics.is_empty() {
        return Err(ForgeError::Config("no time series to generate".to_string()));
    }

    let planner_config = PlannerConfig::new(
        &config.output_directory,
        config.start,
        config.end,
        config.sample_interval,
        config.parallelism,
    );
    let generator = MetricGenerator::new(metrics);
    PlannedBlockWriter::new("generate", planner_config, generator, GenerateExecutorFactory).run()?;

    let rules = recording_rules(&config.rule_groups);
    if !rules.is_empty() {
        run_recording_rules(
            &config.output_directory,
            rules,
            config.start,
            config.end,
            config.sample_interval,
            config.parallelism,
        )?;
    }
    Ok(())
}

struct MetricGenerator {
    metrics: Vec<Arc<Metric>>,
    // One running chunk counter per metric; the planner asks for chunks in
    // chronological order, so the counter doubles as the execution order.
    counters: Vec<AtomicU64>,
}

impl MetricGenerator {
    fn new(metrics: Vec<Arc<Metric>>) -> Self {
        let counters = metrics.iter().map(|_| AtomicU64::new(0)).collect();
        MetricGenerator { metrics, counters }
    }
}

impl PlanGenerator<MetricChunk> for MetricGenerator {
    fn generate(&self, chunk_start: i64, chunk_end: i64, step: i64) -> Vec<PlanEntry<MetricChunk>> {
        self.metrics
            .iter()
            .zip(&self.counters)
            .map(|(m, counter)| {
                let chunk = MetricChunk {
                    metric: Arc::clone(m),
                    seq: counter.fetch_add(1, Ordering::SeqCst),
                };
                PlanEntry::new("generate", chunk_start, chunk_end, step, Arc::new(chunk))
            })
            .collect()
    }
}

struct GenerateExecutorFactory;

impl PlanExecutorFactory<MetricChunk> for GenerateExecutorFactory {
    fn create(&self, _name: &str) -> Result<Box<dyn PlanExecutor<MetricChunk>>> {
        Ok(Box::new(GenerateExecutor))
    }
}

struct GenerateExecutor;

impl PlanExecutor<MetricChunk> for GenerateExecutor {
    fn execute(
        &mut self,
        canceller: &Canceller,
        entry: &PlanEntry<MetricChunk>,
        appender: &mut SafeAppender,
    ) -> Result<()> {
        let chunk = entry.data.as_ref();
        let metric = chunk.metric.as_ref();
        metric.sequencer.wait_for_turn(chunk.seq, canceller)?;
        let result = run_chunk(metric, entry, appender);
        // Release the next chunk even on failure; the canceller is about to
        // fire and waiters must not stall on a hole in the sequence.
        metric.sequencer.complete(chunk.seq);
        result
    }
}

fn run_chunk(
    metric: &Metric,
    entry: &PlanEntry<MetricChunk>,
    appender: &mut SafeAppender,
) -> Result<()> {
    for instance in &metric.instances {
        let mut state = instance.state.lock()?;
        let mut t = entry.start;
        while t < entry.end {
            // Every evaluation within a chunk sees the chunk anchor as
            // its timestamp; only the written sample advances.
            state.timestamp = entry.start as f64;
            let value = metric.expression.eval(&state);
            state.last = value;
            state.index += 1.0;
            if !value.is_nan() {
                appender.add(&Sample {
                    metric: instance.labels.clone(),
                    t,
                    v: value,
                })?;
            }
            t += entry.step;
        }
    }
    Ok(())
}
