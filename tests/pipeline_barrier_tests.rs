//! Ordering guarantees of the planned block writer: every entry of block k
//! completes before any entry of block k+1 starts, across worker counts.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tsforge::append::SafeAppender;
use tsforge::common::Canceller;
use tsforge::error::Result;
use tsforge::pipeline::{PlanExecutor, PlanExecutorFactory, PlannedBlockWriter};
use tsforge::planner::{PlanEntry, PlanGenerator, PlannerConfig};
use tsforge::tsdb::DEFAULT_BLOCK_DURATION;
use tsforge::types::{Labels, Sample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Start(i64),
    End(i64),
}

struct TracingGenerator;

impl PlanGenerator<String> for TracingGenerator {
    fn generate(&self, start: i64, end: i64, step: i64) -> Vec<PlanEntry<String>> {
        vec![PlanEntry::new(
            "trace",
            start,
            end,
            step,
            Arc::new("work".to_string()),
        )]
    }
}

struct TracingExecutor {
    events: Arc<Mutex<Vec<Event>>>,
    sequence: Arc<AtomicUsize>,
}

impl PlanExecutor<String> for TracingExecutor {
    fn execute(
        &mut self,
        _canceller: &Canceller,
        entry: &PlanEntry<String>,
        appender: &mut SafeAppender,
    ) -> Result<()> {
        let block = entry.start / DEFAULT_BLOCK_DURATION;
        self.events.lock().unwrap().push(Event::Start(block));
        // Uneven work so a fast worker could race ahead without the barrier.
        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis((n % 3) as u64 * 7));
        appender.add(&Sample {
            metric: Labels::from_pairs([("__name__", "trace")]),
            t: entry.start,
            v: 1.0,
        })?;
        self.events.lock().unwrap().push(Event::End(block));
        Ok(())
    }
}

struct TracingFactory {
    events: Arc<Mutex<Vec<Event>>>,
    sequence: Arc<AtomicUsize>,
}

impl PlanExecutorFactory<String> for TracingFactory {
    fn create(&self, _name: &str) -> Result<Box<dyn PlanExecutor<String>>> {
        Ok(Box::new(TracingExecutor {
            events: Arc::clone(&self.events),
            sequence: Arc::clone(&self.sequence),
        }))
    }
}

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn run_and_collect(parallelism: usize) -> Vec<Event> {
    let tmp = TempDir::new().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let config = PlannerConfig::new(
        tmp.path().join("data"),
        ts("2023-01-01T00:00:00Z"),
        ts("2023-01-01T06:00:00Z"),
        Duration::from_secs(60),
        parallelism,
    );
    let writer = PlannedBlockWriter::new(
        "barrier-test",
        config,
        TracingGenerator,
        TracingFactory {
            events: Arc::clone(&events),
            sequence: Arc::new(AtomicUsize::new(0)),
        },
    );
    writer.run().unwrap();
    let events = events.lock().unwrap().clone();
    events
}

#[test]
fn test_block_barrier_holds_single_worker() {
    assert_barrier(&run_and_collect(1));
}

#[test]
fn test_block_barrier_holds_many_workers() {
    assert_barrier(&run_and_collect(4));
}

/// No entry of a later block may start before every entry of earlier blocks
/// has ended.
fn assert_barrier(events: &[Event]) {
    assert!(!events.is_empty());
    let mut open: Vec<i64> = Vec::new();
    let mut max_finished_block = i64::MIN;
    for event in events {
        match event {
            Event::Start(block) => {
                assert!(
                    *block >= max_finished_block,
                    "block {} started after block {} finished draining",
                    block,
                    max_finished_block
                );
                for in_flight in &open {
                    assert_eq!(
                        in_flight, block,
                        "blocks {} and {} were in flight together",
                        in_flight, block
                    );
                }
                open.push(*block);
            }
            Event::End(block) => {
                let pos = open
                    .iter()
                    .position(|b| b == block)
                    .expect("end without start");
                open.remove(pos);
                max_finished_block = max_finished_block.max(*block);
            }
        }
    }
    assert!(open.is_empty(), "entries left unfinished: {:?}", open);
}
