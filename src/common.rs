//! Shared plumbing: one-shot cancellation, counted waits, retry with
//! backoff, and time parsing/formatting helpers.

use crate::error::{ForgeError, Result};
use crate::types::Timestamp;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// One-shot broadcast cancellation token shared by every task of a pipeline
/// run. The first `cancel()` wins; later calls are no-ops.
#[derive(Debug, Clone)]
pub struct Canceller {
    inner: Arc<CancellerInner>,
}

#[derive(Debug)]
struct CancellerInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Canceller {
    pub fn new() -> Self {
        Canceller {
            inner: Arc::new(CancellerInner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Fires the token. Idempotent: only the first call flips the flag and
    /// wakes waiters.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
            self.inner.cond.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Blocks until the token fires or `timeout` elapses. Returns true iff
    /// the token fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, _res) = self
            .inner
            .cond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner());
        self.is_cancelled()
    }
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

/// Counted wait barrier: the producer adds outstanding work, consumers mark
/// completion, and `wait` blocks until the count drains or the canceller
/// fires. The pipeline uses one of these per run to enforce the per-block
/// barrier.
#[derive(Debug, Clone)]
pub struct WaitCounter {
    inner: Arc<(Mutex<i64>, Condvar)>,
}

impl WaitCounter {
    pub fn new() -> Self {
        WaitCounter {
            inner: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    pub fn add(&self, n: i64) {
        let (lock, _cond) = &*self.inner;
        let mut count = lock.lock().unwrap_or_else(|e| e.into_inner());
        *count += n;
    }

    pub fn done(&self) {
        let (lock, cond) = &*self.inner;
        let mut count = lock.lock().unwrap_or_else(|e| e.into_inner());
        *count -= 1;
        if *count <= 0 {
            cond.notify_all();
        }
    }

    /// Blocks until the count reaches zero or the canceller fires. Returns
    /// true when the count drained, false on cancellation.
    pub fn wait(&self, canceller: &Canceller) -> bool {
        let (lock, cond) = &*self.inner;
        let mut count = lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *count <= 0 {
                return true;
            }
            if canceller.is_cancelled() {
                return false;
            }
            let (guard, _res) = cond
                .wait_timeout(count, Duration::from_millis(20))
                .unwrap_or_else(|e| e.into_inner());
            count = guard;
        }
    }
}

impl Default for WaitCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Retries `f` with exponential backoff, capped at `max_attempts` total
/// attempts. The delay starts at 500ms, doubles each attempt, and is capped
/// at 15s. Cancellation is observed between attempts.
pub fn retry_with_backoff<T, F>(
    max_attempts: u32,
    canceller: Option<&Canceller>,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut delay = Duration::from_millis(500);
    let max_delay = Duration::from_secs(15);
    let mut last_err = None;
    for attempt in 0..max_attempts {
        if let Some(c) = canceller {
            if c.is_cancelled() {
                return Err(ForgeError::Cancelled);
            }
        }
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient_append() => return Err(e),
            Err(e) => {
                tracing::debug!(attempt = attempt + 1, error = %e, "retrying after backoff");
                last_err = Some(e);
            }
        }
        if attempt + 1 < max_attempts {
            match canceller {
                Some(c) => {
                    if c.wait_timeout(delay) {
                        return Err(ForgeError::Cancelled);
                    }
                }
                None => std::thread::sleep(delay),
            }
            delay = (delay * 2).min(max_delay);
        }
    }
    Err(last_err.unwrap_or_else(|| ForgeError::Internal("retry with zero attempts".to_string())))
}

/// Effective upper bound for worker parallelism on this host.
pub fn max_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Clamps a requested parallelism into `[1, numCPU]`.
pub fn clamp_parallelism(requested: usize) -> usize {
    requested.clamp(1, max_parallelism())
}

pub fn format_date(value: Timestamp) -> String {
    match Utc.timestamp_millis_opt(value).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => value.to_string(),
    }
}

pub fn format_date_range(start: Timestamp, end: Timestamp) -> String {
    format!("{} to {}", format_date(start), format_date(end))
}

/// Parses a time flag value. Accepted forms, tried in order: integer
/// milliseconds since epoch, a relative "`<duration> ago`" (e.g.
/// "6 hours ago"), and a strict date parse (RFC 3339, `%Y-%m-%d %H:%M:%S`,
/// or a bare date).
pub fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| ForgeError::Parse(format!("millisecond timestamp out of range: {}", s)));
    }
    if let Some(rel) = s.strip_suffix(" ago") {
        let d = humantime::parse_duration(rel.trim())
            .map_err(|e| ForgeError::Parse(format!("cannot parse {:?} as a relative time: {}", s, e)))?;
        let d = chrono::Duration::from_std(d)
            .map_err(|e| ForgeError::Parse(format!("relative time {:?} out of range: {}", s, e)))?;
        return Ok(Utc::now() - d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&dt));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let dt = d
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| ForgeError::Parse(format!("cannot parse {:?} as a date", s)))?;
        return Ok(Utc.from_utc_datetime(&dt));
    }
    Err(ForgeError::Parse(format!(
        "cannot parse {:?} to a valid timestamp",
        s
    )))
}

/// Parses a duration flag value ("15s", "5m", "1h30m", ...).
pub fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s.trim())
        .map_err(|e| ForgeError::Parse(format!("cannot parse {:?} as a duration: {}", s, e)))
}

pub fn duration_to_millis(d: Duration) -> i64 {
    d.as_millis() as i64
}
