//! Remote queryable: a pool of workers over the HTTP query API, with
//! chunked dispatch, retry, a sub-range result cache, and a per-series
//! position index for cheap repeated instant evaluations.

use crate::common::{retry_with_backoff, Canceller};
use crate::error::{ForgeError, Result};
use crate::types::{Labels, Matrix, Point, Sample, Series, Timestamp, Vector};
use serde::Deserialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use xxhash_rust::xxh64::xxh64;

/// Remote range queries are dispatched in chunks of at most 30 minutes.
const MAX_CHUNK_DURATION_MS: i64 = 30 * 60 * 1000;

/// Per-request deadline against the remote endpoint.
const REMOTE_TIMEOUT: Duration = Duration::from_secs(120);

/// Transport failures are retried with backoff up to this many attempts.
const MAX_QUERY_ATTEMPTS: u32 = 5;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<ApiSeries>,
}

#[derive(Debug, Deserialize)]
struct ApiSeries {
    metric: HashMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Blocking client for the remote query API.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    name: String,
    base_url: String,
    http: reqwest::blocking::Client,
}

impl RemoteClient {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REMOTE_TIMEOUT)
            .build()
            .map_err(|e| ForgeError::Remote(format!("failed to create remote client: {}", e)))?;
        Ok(RemoteClient {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs one range query. Timestamps are milliseconds; the API speaks
    /// seconds, so they are converted on the wire.
    pub fn query_range(
        &self,
        expr: &str,
        start: Timestamp,
        end: Timestamp,
        step: Timestamp,
    ) -> Result<Matrix> {
        let url = format!("{}/api/v1/query_range", self.base_url);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("query", expr.to_string()),
                ("start", format_api_time(start)),
                ("end", format_api_time(end)),
                ("step", format!("{}", (step as f64) / 1000.0)),
            ])
            .send()
            .map_err(|e| ForgeError::Remote(format!("{}: request failed: {}", self.name, e)))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ForgeError::Remote(format!(
                "{}: remote returned {}",
                self.name, status
            )));
        }
        let body: ApiResponse = response
            .json()
            .map_err(|e| ForgeError::Remote(format!("{}: bad response body: {}", self.name, e)))?;
        if body.status != "success" {
            return Err(ForgeError::Remote(format!(
                "{}: query failed: {}",
                self.name,
                body.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        let data = body
            .data
            .ok_or_else(|| ForgeError::Remote(format!("{}: response without data", self.name)))?;
        if data.result_type != "matrix" {
            return Err(ForgeError::Remote(format!(
                "{}: query range result is not a matrix",
                self.name
            )));
        }

        let mut matrix = Matrix::with_capacity(data.result.len());
        for s in data.result {
            let metric = Labels::from_pairs(s.metric);
            let mut points = Vec::with_capacity(s.values.len());
            for (ts, v) in s.values {
                let v: f64 = v
                    .parse()
                    .map_err(|e| ForgeError::Remote(format!("{}: bad sample value: {}", self.name, e)))?;
                points.push(Point {
                    t: (ts * 1000.0).round() as i64,
                    v,
                });
            }
            matrix.push(Series { metric, points });
        }
        Ok(matrix)
    }
}

fn format_api_time(ms: Timestamp) -> String {
    format!("{}", (ms as f64) / 1000.0)
}

struct QueryJob {
    expr: String,
    start: Timestamp,
    end: Timestamp,
    step: Timestamp,
    canceller: Canceller,
    reply: Sender<Result<Matrix>>,
}

/// A fixed pool of remote query workers, each with its own client.
pub struct Queryable {
    input: Sender<QueryJob>,
    canceller: Canceller,
    workers: Vec<JoinHandle<()>>,
    step: Duration,
}

impl Queryable {
    pub fn new(base_url: &str, parallelism: usize, step: Duration) -> Result<Self> {
        let (input, rx) = channel::<QueryJob>();
        let rx = Arc::new(Mutex::new(rx));
        let canceller = Canceller::new();
        let count = parallelism.max(1);
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let client = RemoteClient::new(format!("remoteQuerier{}", i), base_url)?;
            let rx = Arc::clone(&rx);
            let canceller = canceller.clone();
            workers.push(thread::spawn(move || run_query_worker(client, rx, canceller)));
        }
        Ok(Queryable {
            input,
            canceller,
            workers,
            step,
        })
    }

    /// A provider bound to an evaluation window. The cache lives in the
    /// provider and is confined to the calling thread.
    pub fn query_func_provider(
        &self,
        min_ts: Timestamp,
        max_ts: Timestamp,
        interval: Duration,
    ) -> QueryFuncProvider {
        QueryFuncProvider {
            min_ts,
            max_ts,
            step: interval.as_millis() as i64,
            input: self.input.clone(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn default_step(&self) -> Duration {
        self.step
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.canceller.cancel();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Queryable {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_query_worker(client: RemoteClient, rx: Arc<Mutex<Receiver<QueryJob>>>, canceller: Canceller) {
    loop {
        if canceller.is_cancelled() {
            return;
        }
        let job = {
            let rx = rx.lock().unwrap_or_else(|e| e.into_inner());
            rx.recv_timeout(Duration::from_millis(50))
        };
        let job = match job {
            Ok(job) => job,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
        };
        if job.canceller.is_cancelled() {
            let _ = job.reply.send(Err(ForgeError::Cancelled));
            continue;
        }
        let result = retry_with_backoff(MAX_QUERY_ATTEMPTS, Some(&job.canceller), || {
            client.query_range(&job.expr, job.start, job.end, job.step)
        })
        .map_err(|e| match e {
            ForgeError::Cancelled => ForgeError::Cancelled,
            other => ForgeError::Remote(format!(
                "failed to query '{}' from {} to {} after {} attempts: {}",
                job.expr, job.start, job.end, MAX_QUERY_ATTEMPTS, other
            )),
        });
        let _ = job.reply.send(result);
    }
}

/// One cached range result for a `(query, interval)` key.
#[derive(Debug)]
pub struct QueryCacheEntry {
    pub query: String,
    pub interval: Timestamp,
    pub min_ts: Timestamp,
    pub max_ts: Timestamp,
    pub matrix: Matrix,
    pub cached: bool,
}

type QueryCache = HashMap<String, HashMap<Timestamp, Vec<Arc<QueryCacheEntry>>>>;

/// Query functions bound to a `(min, max, step)` window, sharing one
/// sub-range cache.
pub struct QueryFuncProvider {
    min_ts: Timestamp,
    max_ts: Timestamp,
    step: Timestamp,
    input: Sender<QueryJob>,
    cache: RefCell<QueryCache>,
}

impl QueryFuncProvider {
    /// Evaluates a range query, serving sub-ranges from cache. The returned
    /// matrix holds exactly the points within `[start, end]`.
    pub fn range_query(
        &self,
        expr: &str,
        start: Timestamp,
        end: Timestamp,
        interval: Timestamp,
    ) -> Result<Matrix> {
        let entry = self.query(expr, start, end, interval, true, true)?;
        if entry.min_ts == start && entry.max_ts == end {
            return Ok(entry.matrix.clone());
        }
        let mut matrix = Matrix::new();
        for series in &entry.matrix {
            let points: Vec<Point> = series
                .points
                .iter()
                .filter(|p| p.t >= start && p.t <= end)
                .copied()
                .collect();
            if !points.is_empty() {
                matrix.push(Series {
                    metric: series.metric.clone(),
                    points,
                });
            }
        }
        Ok(matrix)
    }

    /// An instant query function for rule evaluation.
    ///
    /// With `allow_arbitrary == false` no remote traffic is issued: results
    /// come solely from cache entries spanning the requested instant, with a
    /// per-query series-position index advancing monotonically through each
    /// series as evaluation walks forward in time.
    pub fn instant_query_fn(
        &self,
        allow_arbitrary: bool,
    ) -> impl FnMut(&str, Timestamp) -> Result<Vector> + '_ {
        let mut series_positions: HashMap<u64, HashMap<usize, usize>> = HashMap::new();
        move |expr: &str, ts: Timestamp| {
            let entry = self.query(expr, ts, ts, self.step, false, allow_arbitrary)?;
            let index = if entry.cached {
                let key = series_index_hash(&entry.query, entry.min_ts, entry.max_ts, entry.interval);
                Some(series_positions.entry(key).or_default())
            } else {
                None
            };

            let mut vector = Vector::new();
            let mut advanced: Vec<(usize, usize)> = Vec::new();
            for (series_idx, series) in entry.matrix.iter().enumerate() {
                let start_pos = index
                    .as_ref()
                    .and_then(|m| m.get(&series_idx).copied())
                    .unwrap_or(0);
                let mut found = false;
                let mut pos = start_pos;
                while pos < series.points.len() {
                    let point = series.points[pos];
                    if ts < point.t {
                        break;
                    }
                    if point.t == ts {
                        found = true;
                        vector.push(Sample {
                            metric: series.metric.clone(),
                            t: ts,
                            v: point.v,
                        });
                        break;
                    }
                    pos += 1;
                }
                if found {
                    advanced.push((series_idx, pos + 1));
                }
            }
            if let Some(index) = index {
                for (series_idx, pos) in advanced {
                    index.insert(series_idx, pos);
                }
            }
            Ok(vector)
        }
    }

    fn query(
        &self,
        expr: &str,
        start: Timestamp,
        end: Timestamp,
        interval: Timestamp,
        add_to_cache: bool,
        allow_arbitrary: bool,
    ) -> Result<Arc<QueryCacheEntry>> {
        // Serve any entry whose range contains the request.
        if let Some(by_interval) = self.cache.borrow().get(expr) {
            if let Some(entries) = by_interval.get(&interval) {
                for entry in entries {
                    if start >= entry.min_ts
                        && start <= entry.max_ts
                        && end >= entry.min_ts
                        && end <= entry.max_ts
                    {
                        return Ok(Arc::clone(entry));
                    }
                }
            }
        }

        if !allow_arbitrary {
            // First-pass evaluation must not trigger remote traffic.
            return Ok(Arc::new(QueryCacheEntry {
                query: expr.to_string(),
                interval,
                min_ts: start,
                max_ts: end,
                matrix: Matrix::new(),
                cached: false,
            }));
        }

        let matrix = self.dispatch_chunks(expr, start, end, interval)?;
        let entry = Arc::new(QueryCacheEntry {
            query: expr.to_string(),
            interval,
            min_ts: start,
            max_ts: end,
            matrix,
            cached: add_to_cache,
        });
        if add_to_cache {
            self.cache
                .borrow_mut()
                .entry(expr.to_string())
                .or_default()
                .entry(interval)
                .or_default()
                .push(Arc::clone(&entry));
        }
        Ok(entry)
    }

    /// Splits `[start, end]` into bounded chunks, fans them out to the
    /// worker pool, and merges the chunk matrices by series identity.
    fn dispatch_chunks(
        &self,
        expr: &str,
        start: Timestamp,
        end: Timestamp,
        interval: Timestamp,
    ) -> Result<Matrix> {
        let query_canceller = Canceller::new();
        let (reply_tx, reply_rx) = channel::<Result<Matrix>>();

        let mut chunk_count = 0usize;
        let mut chunk_start = start;
        while chunk_start <= end {
            let chunk_end = (chunk_start + MAX_CHUNK_DURATION_MS - 1).min(end);
            self.input
                .send(QueryJob {
                    expr: expr.to_string(),
                    start: chunk_start,
                    end: chunk_end,
                    step: interval,
                    canceller: query_canceller.clone(),
                    reply: reply_tx.clone(),
                })
                .map_err(|_| ForgeError::Remote("query worker pool is gone".to_string()))?;
            chunk_count += 1;
            chunk_start += MAX_CHUNK_DURATION_MS;
        }
        drop(reply_tx);

        let mut merged: HashMap<u64, Series> = HashMap::new();
        let mut first_error: Option<ForgeError> = None;
        for _ in 0..chunk_count {
            match reply_rx.recv() {
                Ok(Ok(matrix)) => {
                    for series in matrix {
                        let hash = series.metric.hash();
                        match merged.get_mut(&hash) {
                            Some(existing) => existing.points.extend(series.points),
                            None => {
                                merged.insert(hash, series);
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    query_canceller.cancel();
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(ForgeError::Remote(
                            "query worker pool is gone".to_string(),
                        ));
                    }
                    break;
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let mut matrix: Matrix = merged.into_values().collect();
        for series in &mut matrix {
            series.points.sort_by_key(|p| p.t);
        }
        matrix.sort_by_key(|s| s.metric.hash());
        Ok(matrix)
    }

    pub fn window(&self) -> (Timestamp, Timestamp, Timestamp) {
        (self.min_ts, self.max_ts, self.step)
    }

    /// Seeds the cache with an externally produced entry. Exists for the
    /// first-pass/second-pass evaluation split and for tests.
    pub fn insert_cache_entry(
        &self,
        expr: &str,
        interval: Timestamp,
        min_ts: Timestamp,
        max_ts: Timestamp,
        matrix: Matrix,
    ) {
        let entry = Arc::new(QueryCacheEntry {
            query: expr.to_string(),
            interval,
            min_ts,
            max_ts,
            matrix,
            cached: true,
        });
        self.cache
            .borrow_mut()
            .entry(expr.to_string())
            .or_default()
            .entry(interval)
            .or_default()
            .push(entry);
    }
}

fn series_index_hash(query: &str, start: Timestamp, end: Timestamp, interval: Timestamp) -> u64 {
    let mut buf = Vec::with_capacity(query.len() + 24);
    buf.extend_from_slice(query.as_bytes());
    buf.extend_from_slice(&start.to_le_bytes());
    buf.extend_from_slice(&end.to_le_bytes());
    buf.extend_from_slice(&interval.to_le_bytes());
    xxh64(&buf, 0)
}
