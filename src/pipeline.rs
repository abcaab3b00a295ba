//! Planned block writer pipeline: one producer enumerating block-aligned
//! plans, N consumers executing them against per-worker appenders, a block
//! barrier between blocks, and staged-to-destination block promotion.

use crate::append::SafeAppender;
use crate::common::{Canceller, WaitCounter};
use crate::database::{compatible_block_duration, move_blocks, new_temp_directory, Database};
use crate::error::{ForgeError, Result};
use crate::planner::{PlanEntry, PlanGenerator, Planner, PlannerConfig};
use crate::tsdb::DEFAULT_RETENTION;
use std::fmt;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Executes one plan entry, feeding produced samples to the appender.
pub trait PlanExecutor<T>: Send {
    fn execute(
        &mut self,
        canceller: &Canceller,
        entry: &PlanEntry<T>,
        appender: &mut SafeAppender,
    ) -> Result<()>;
}

/// Creates one executor per consumer. `name` identifies the worker
/// (`planConsumer{i}`) for logging and per-worker clients.
pub trait PlanExecutorFactory<T> {
    fn create(&self, name: &str) -> Result<Box<dyn PlanExecutor<T>>>;
}

/// The integration point: plans work, fans it out, writes into a staging
/// store, compacts, and atomically promotes blocks into the destination.
pub struct PlannedBlockWriter<T, G, F>
where
    G: PlanGenerator<T>,
    F: PlanExecutorFactory<T>,
{
    operation: String,
    config: PlannerConfig,
    generator: Arc<G>,
    executor_factory: F,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, G, F> PlannedBlockWriter<T, G, F>
where
    T: fmt::Display + Send + Sync + 'static,
    G: PlanGenerator<T> + 'static,
    F: PlanExecutorFactory<T>,
{
    pub fn new(operation: impl Into<String>, config: PlannerConfig, generator: G, executor_factory: F) -> Self {
        PlannedBlockWriter {
            operation: operation.into(),
            config,
            generator: Arc::new(generator),
            executor_factory,
            _marker: std::marker::PhantomData,
        }
    }

    /// Runs the pipeline to completion. On success the destination holds the
    /// promoted blocks and the staging directory is gone; on failure the
    /// first captured error is returned and staged blocks are abandoned for
    /// the next run's stale-directory cleanup.
    pub fn run(&self) -> Result<()> {
        let start_ms = self.config.start_ms();
        let end_ms = self.config.end_ms();
        if start_ms >= end_ms {
            return Err(ForgeError::InvalidTimeRange {
                start: start_ms,
                end: end_ms,
            });
        }
        let block_duration = compatible_block_duration(end_ms - start_ms);

        let suffix = format!(".tmp-for-{}", self.operation);
        let staging_dir = new_temp_directory(&self.config.output_directory, &suffix)?;
        let database = Database::new(&staging_dir, block_duration, DEFAULT_RETENTION)?;
        let append_manager = database.append_manager()?;

        let canceller = Canceller::new();
        let work = WaitCounter::new();
        let first_error: Arc<Mutex<Option<ForgeError>>> = Arc::new(Mutex::new(None));

        let (tx, rx) = mpsc::sync_channel::<PlanEntry<T>>(0);
        let shared_rx = Arc::new(Mutex::new(rx));

        let producer = {
            let config = self.config.clone();
            let generator = Arc::clone(&self.generator);
            let canceller = canceller.clone();
            let work = work.clone();
            thread::spawn(move || run_producer(config, generator, tx, canceller, work))
        };

        let mut consumers = Vec::with_capacity(self.config.parallelism);
        for i in 0..self.config.parallelism {
            let name = format!("planConsumer{}", i);
            let startup = append_manager
                .new_appender()
                .and_then(|appender| Ok((appender, self.executor_factory.create(&name)?)));
            let (appender, executor) = match startup {
                Ok(pair) => pair,
                Err(e) => {
                    canceller.cancel();
                    // Let the producer unblock and drain before surfacing.
                    let _ = producer.join();
                    return Err(ForgeError::Internal(format!(
                        "failed to start consumers: {}",
                        e
                    )));
                }
            };
            let rx = Arc::clone(&shared_rx);
            let canceller = canceller.clone();
            let work = work.clone();
            let first_error = Arc::clone(&first_error);
            consumers.push(thread::spawn(move || {
                run_consumer(name, executor, appender, rx, canceller, work, first_error)
            }));
        }

        for handle in consumers {
            if handle.join().is_err() {
                canceller.cancel();
                record_error(&first_error, ForgeError::Internal("consumer panicked".to_string()));
            }
        }
        canceller.cancel();
        let _ = producer.join();

        if let Some(err) = first_error.lock()?.take() {
            return Err(err);
        }

        database.compact()?;
        move_blocks(&staging_dir, &self.config.output_directory)
    }
}

fn record_error(slot: &Mutex<Option<ForgeError>>, err: ForgeError) {
    let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
    if guard.is_none() {
        *guard = Some(err);
    }
}

fn run_producer<T, G>(
    config: PlannerConfig,
    generator: Arc<G>,
    tx: SyncSender<PlanEntry<T>>,
    canceller: Canceller,
    work: WaitCounter,
) where
    G: PlanGenerator<T>,
{
    let planner = Planner::new(config);
    for plan in planner.plan(generator.as_ref()) {
        work.add(plan.len() as i64);
        for entry in plan {
            if !send_entry(&tx, entry, &canceller) {
                tracing::info!("Cancelling producer");
                return;
            }
        }
        // Block barrier: nothing from the next block is dispatched until
        // every entry of this block has executed.
        if !work.wait(&canceller) {
            tracing::info!("Cancelling producer");
            return;
        }
    }
    tracing::info!("Stopping producer");
}

/// Sends one entry over the rendezvous channel, giving up when the
/// canceller fires or every consumer is gone. Returns true on delivery.
fn send_entry<T>(tx: &SyncSender<PlanEntry<T>>, entry: PlanEntry<T>, canceller: &Canceller) -> bool {
    let mut pending = entry;
    loop {
        if canceller.is_cancelled() {
            return false;
        }
        match tx.try_send(pending) {
            Ok(()) => return true,
            Err(TrySendError::Full(back)) => {
                pending = back;
                if canceller.wait_timeout(Duration::from_millis(5)) {
                    return false;
                }
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

fn run_consumer<T: fmt::Display>(
    name: String,
    mut executor: Box<dyn PlanExecutor<T>>,
    mut appender: SafeAppender,
    rx: Arc<Mutex<Receiver<PlanEntry<T>>>>,
    canceller: Canceller,
    work: WaitCounter,
    first_error: Arc<Mutex<Option<ForgeError>>>,
) {
    loop {
        if canceller.is_cancelled() {
            tracing::info!(consumer = %name, "Cancelling consumer");
            return;
        }
        let received = {
            let rx = rx.lock().unwrap_or_else(|e| e.into_inner());
            rx.recv_timeout(Duration::from_millis(20))
        };
        match received {
            Ok(entry) => {
                tracing::info!(consumer = %name, "Running {}", entry);
                match executor.execute(&canceller, &entry, &mut appender) {
                    Ok(()) => work.done(),
                    Err(err) => {
                        tracing::error!(
                            consumer = %name,
                            "Failed to {} [could not write data]: {}",
                            entry,
                            err
                        );
                        record_error(&first_error, err);
                        canceller.cancel();
                        tracing::info!(consumer = %name, "Cancelling consumer");
                        return;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // Clean drain: flush and promote this worker's blocks.
    if let Err(err) = appender.close() {
        tracing::error!(consumer = %name, "Failed to close appender: {}", err);
        record_error(&first_error, err);
        canceller.cancel();
        return;
    }
    tracing::info!(consumer = %name, "Stopping consumer");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsdb::{Db, DbOptions};
    use crate::types::{Labels, Sample, METRIC_NAME};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct StaticGenerator {
        name: &'static str,
    }

    impl PlanGenerator<String> for StaticGenerator {
        fn generate(&self, start: i64, end: i64, step: i64) -> Vec<PlanEntry<String>> {
            vec![PlanEntry::new(
                self.name,
                start,
                end,
                step,
                Arc::new("series".to_string()),
            )]
        }
    }

    struct WritingExecutor {
        executed: Arc<AtomicUsize>,
        fail_on: Option<i64>,
    }

    impl PlanExecutor<String> for WritingExecutor {
        fn execute(
            &mut self,
            _canceller: &Canceller,
            entry: &PlanEntry<String>,
            appender: &mut SafeAppender,
        ) -> Result<()> {
            if let Some(fail_at) = self.fail_on {
                if entry.start >= fail_at {
                    return Err(ForgeError::Remote("injected failure".to_string()));
                }
            }
            let metric = Labels::from_pairs([(METRIC_NAME, "gen"), ("src", "test")]);
            let mut t = entry.start;
            while t <= entry.end {
                appender.add(&Sample {
                    metric: metric.clone(),
                    t,
                    v: 1.0,
                })?;
                t += entry.step;
            }
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Factory {
        executed: Arc<AtomicUsize>,
        fail_on: Option<i64>,
    }

    impl PlanExecutorFactory<String> for Factory {
        fn create(&self, _name: &str) -> Result<Box<dyn PlanExecutor<String>>> {
            Ok(Box::new(WritingExecutor {
                executed: Arc::clone(&self.executed),
                fail_on: self.fail_on,
            }))
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_pipeline_writes_and_promotes_blocks() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("data");
        let executed = Arc::new(AtomicUsize::new(0));
        let config = PlannerConfig::new(
            &out,
            ts("2023-01-01T00:00:00Z"),
            ts("2023-01-01T04:00:00Z"),
            std::time::Duration::from_secs(60),
            2,
        );
        let writer = PlannedBlockWriter::new(
            "test",
            config,
            StaticGenerator { name: "test" },
            Factory {
                executed: Arc::clone(&executed),
                fail_on: None,
            },
        );
        writer.run().unwrap();

        // 3 blocks (0h, 2h, 4h) x 4 chunks, minus the degenerate final block.
        assert!(executed.load(Ordering::SeqCst) >= 8);

        // Destination holds promoted blocks, staging is gone.
        let db = Db::open(&out, DbOptions::default()).unwrap();
        assert!(!db.blocks().unwrap().is_empty());
        let siblings: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".tmp-for-"))
            .collect();
        assert!(siblings.is_empty(), "staging dirs left behind: {:?}", siblings);

        let matchers = crate::matchers::parse_selector("gen").unwrap();
        let matrix = db
            .read_series(&matchers, 0, Utc.timestamp_millis_opt(i64::MAX >> 20).unwrap().timestamp_millis())
            .unwrap();
        assert_eq!(matrix.len(), 1);
        assert!(!matrix[0].points.is_empty());
    }

    #[test]
    fn test_pipeline_failure_abandons_staging() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("data");
        std::fs::create_dir_all(&out).unwrap();
        let executed = Arc::new(AtomicUsize::new(0));
        // Fail on every entry of the second block.
        let fail_at = ts("2023-01-01T02:00:00Z").timestamp_millis();
        let config = PlannerConfig::new(
            &out,
            ts("2023-01-01T00:00:00Z"),
            ts("2023-01-01T04:00:00Z"),
            std::time::Duration::from_secs(60),
            1,
        );
        let writer = PlannedBlockWriter::new(
            "test",
            config,
            StaticGenerator { name: "test" },
            Factory {
                executed,
                fail_on: Some(fail_at),
            },
        );
        let err = writer.run().unwrap_err();
        assert!(matches!(err, ForgeError::Remote(_)));

        // Destination was never touched.
        let db = Db::open(&out, DbOptions::default()).unwrap();
        assert!(db.blocks().unwrap().is_empty());
    }

    #[test]
    fn test_pipeline_rejects_empty_range() {
        let tmp = TempDir::new().unwrap();
        let config = PlannerConfig::new(
            tmp.path().join("data"),
            ts("2023-01-01T00:00:00Z"),
            ts("2023-01-01T00:00:00Z"),
            std::time::Duration::from_secs(60),
            1,
        );
        let writer = PlannedBlockWriter::new(
            "test",
            config,
            StaticGenerator { name: "test" },
            Factory {
                executed: Arc::new(AtomicUsize::new(0)),
                fail_on: None,
            },
        );
        assert!(writer.run().is_err());
    }
}
