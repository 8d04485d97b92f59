//! Concurrent execution of one phase.
//!
//! A fixed set of worker tasks drains a shared FIFO of work items. Per-item
//! failures are counted and the worker moves on; a phase-fatal error stops
//! every worker from pulling further items. The reported time is wall clock
//! for the whole batch, start to last worker exit.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::error::BenchError;
use crate::model::{Operation, Phase, PhaseResult, WorkItem};
use crate::strategy::ConnectionStrategy;

/// Everything a completed phase hands back to the runner.
#[derive(Debug, Clone)]
pub struct PhaseOutput {
    pub result: PhaseResult,
    /// entity index -> id, for successful creations only
    pub created: BTreeMap<usize, i64>,
    /// entity indices whose operation succeeded
    pub completed: BTreeSet<usize>,
}

/// A phase stopped early by a phase-fatal error.
#[derive(Debug, Error)]
#[error("{phase} phase aborted after {attempted} items: {source}", phase = .output.result.phase, attempted = .output.result.attempted())]
pub struct PhaseAborted {
    /// Counts for the items attempted before the abort
    pub output: PhaseOutput,
    pub source: BenchError,
}

impl PhaseAborted {
    pub fn partial(&self) -> &PhaseResult {
        &self.output.result
    }
}

/// Runs a batch of work items with bounded concurrency.
#[derive(Debug, Clone, Copy)]
pub struct PhaseExecutor {
    concurrency: usize,
}

impl PhaseExecutor {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run(
        &self,
        strategy: Arc<dyn ConnectionStrategy>,
        phase: Phase,
        items: Vec<WorkItem>,
    ) -> Result<PhaseOutput, PhaseAborted> {
        debug_assert!(items.iter().all(|item| item.phase() == phase));

        let total = items.len();
        let workers = self.concurrency.min(total);
        let queue = Arc::new(WorkQueue {
            items: Mutex::new(VecDeque::from(items)),
            abort: AtomicBool::new(false),
        });

        debug!(%phase, items = total, workers, strategy = %strategy.kind(), "starting phase");
        let started = Instant::now();

        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let strategy = strategy.clone();
            let queue = queue.clone();
            set.spawn(
                run_worker(strategy, queue).instrument(debug_span!("worker", id = worker_id, %phase)),
            );
        }

        let mut tally = Tally::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(worker) => tally.merge(worker),
                Err(err) => {
                    queue.abort.store(true, Ordering::SeqCst);
                    tally.fatal.get_or_insert(BenchError::Worker(err.to_string()));
                }
            }
        }

        let elapsed_seconds = started.elapsed().as_secs_f64();
        let aborted = tally.fatal.is_some();
        let result = PhaseResult {
            phase,
            elapsed_seconds,
            succeeded: tally.succeeded,
            failed: tally.failed,
            skipped: 0,
            aborted,
        };
        let output = PhaseOutput {
            result: result.clone(),
            created: tally.created,
            completed: tally.completed,
        };

        match tally.fatal {
            Some(source) => {
                warn!(
                    %phase,
                    attempted = result.attempted(),
                    total,
                    error = %source,
                    "phase aborted"
                );
                Err(PhaseAborted { output, source })
            }
            None => {
                info!(
                    %phase,
                    elapsed_secs = elapsed_seconds,
                    succeeded = result.succeeded,
                    failed = result.failed,
                    "phase complete"
                );
                Ok(output)
            }
        }
    }
}

struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    abort: AtomicBool,
}

impl WorkQueue {
    fn next(&self) -> Option<WorkItem> {
        if self.abort.load(Ordering::SeqCst) {
            return None;
        }
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    created: BTreeMap<usize, i64>,
    completed: BTreeSet<usize>,
    fatal: Option<BenchError>,
}

impl Tally {
    fn merge(&mut self, other: Tally) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.created.extend(other.created);
        self.completed.extend(other.completed);
        if self.fatal.is_none() {
            self.fatal = other.fatal;
        }
    }
}

async fn run_worker(strategy: Arc<dyn ConnectionStrategy>, queue: Arc<WorkQueue>) -> Tally {
    let mut tally = Tally::default();

    while let Some(item) = queue.next() {
        // A panicking item is counted and aborts the phase; the tally survives
        let outcome = AssertUnwindSafe(execute(strategy.as_ref(), &item.op))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(BenchError::Worker(panic_message(panic.as_ref()))));
        match outcome {
            Ok(created) => {
                tally.succeeded += 1;
                tally.completed.insert(item.entity_index);
                if let Some(id) = created {
                    tally.created.insert(item.entity_index, id);
                }
            }
            Err(err) if err.is_phase_fatal() => {
                tally.failed += 1;
                queue.abort.store(true, Ordering::SeqCst);
                tally.fatal = Some(err);
                break;
            }
            Err(err) => {
                tally.failed += 1;
                debug!(index = item.entity_index, error = %err, "item failed");
            }
        }
    }

    tally
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("worker panicked: {}", msg)
    } else {
        "worker panicked".to_string()
    }
}

/// Dispatch one operation; returns the new id for creations.
async fn execute(strategy: &dyn ConnectionStrategy, op: &Operation) -> Result<Option<i64>, BenchError> {
    match op {
        Operation::Create(entity) => strategy.create_entity(entity).await.map(Some),
        Operation::Read { id } => strategy.read_entity(*id).await.map(|_| None),
        Operation::Update { id, new_email } => strategy.update_entity(*id, new_email).await.map(|_| None),
        Operation::Delete { id } => strategy.delete_entity(*id).await.map(|_| None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::backend::{Connection, Connector, MemoryStore};
    use crate::config::PoolConfig;
    use crate::model::Entity;
    use crate::strategy::{DirectStrategy, PooledStrategy};
    use crate::workload::{RunNonce, WorkloadGenerator};

    fn direct(store: &MemoryStore) -> Arc<dyn ConnectionStrategy> {
        Arc::new(DirectStrategy::new(Arc::new(store.connector())))
    }

    fn create_items(entities: Vec<Entity>) -> Vec<WorkItem> {
        entities
            .into_iter()
            .enumerate()
            .map(|(index, entity)| WorkItem::create(index, entity))
            .collect()
    }

    #[tokio::test]
    async fn sequential_create_assigns_distinct_ids() {
        let store = MemoryStore::new();
        let generator = WorkloadGenerator::new(RunNonce::fixed("exec"));
        let items = create_items(generator.generate(5));

        let output = PhaseExecutor::new(1)
            .run(direct(&store), Phase::Create, items)
            .await
            .unwrap();

        assert_eq!(output.result.failed, 0);
        assert_eq!(output.result.succeeded, 5);
        let ids: HashSet<_> = output.created.values().copied().collect();
        assert_eq!(ids.len(), 5);
        assert_eq!(output.created.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn empty_batch_spawns_nothing() {
        let store = MemoryStore::new();
        let output = PhaseExecutor::new(8)
            .run(direct(&store), Phase::Read, Vec::new())
            .await
            .unwrap();
        assert_eq!(output.result.succeeded, 0);
        assert_eq!(output.result.failed, 0);
        assert!(!output.result.aborted);
        assert_eq!(store.opened_connections(), 0);
    }

    #[tokio::test]
    async fn per_item_failures_do_not_stop_the_phase() {
        let store = MemoryStore::new();
        let strategy = direct(&store);
        let id = strategy
            .create_entity(&Entity::new("exists", "exists@test.com"))
            .await
            .unwrap();

        let items = vec![
            WorkItem::read(0, id),
            WorkItem::read(1, id + 1000),
            WorkItem::read(2, id),
            WorkItem::read(3, id + 2000),
        ];
        let output = PhaseExecutor::new(2)
            .run(strategy, Phase::Read, items)
            .await
            .unwrap();

        assert_eq!(output.result.succeeded, 2);
        assert_eq!(output.result.failed, 2);
        assert_eq!(output.completed, BTreeSet::from([0, 2]));
        assert!(!output.result.aborted);
    }

    #[tokio::test]
    async fn constraint_violations_are_counted() {
        let store = MemoryStore::new();
        let items = vec![
            WorkItem::create(0, Entity::new("same", "same@test.com")),
            WorkItem::create(1, Entity::new("same", "same@test.com")),
        ];
        let output = PhaseExecutor::new(1)
            .run(direct(&store), Phase::Create, items)
            .await
            .unwrap();

        assert_eq!(output.result.succeeded, 1);
        assert_eq!(output.result.failed, 1);
        assert_eq!(output.created.len(), 1);
        assert!(output.created.contains_key(&0));
    }

    #[tokio::test]
    async fn connection_failure_aborts_with_partial_result() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        let generator = WorkloadGenerator::new(RunNonce::fixed("down"));
        let items = create_items(generator.generate(50));

        let aborted = PhaseExecutor::new(4)
            .run(direct(&store), Phase::Create, items)
            .await
            .unwrap_err();

        assert!(matches!(aborted.source, BenchError::Connection(_)));
        assert!(aborted.partial().aborted);
        assert_eq!(aborted.partial().succeeded, 0);
        // Each worker fails at most one item before observing the abort flag
        assert!(aborted.partial().failed >= 1 && aborted.partial().failed <= 4);
        assert!(aborted.to_string().contains("create phase aborted"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_exhaustion_is_a_per_item_failure() {
        let store = MemoryStore::with_latency(Duration::ZERO, Duration::from_millis(200));
        let pool = PooledStrategy::connect(
            Arc::new(store.connector()),
            PoolConfig {
                min_size: 0,
                max_size: 1,
                acquire_timeout: Duration::from_millis(20),
            },
        )
        .await
        .unwrap();

        let generator = WorkloadGenerator::new(RunNonce::fixed("tight"));
        let items = create_items(generator.generate(3));
        let output = PhaseExecutor::new(3)
            .run(Arc::new(pool), Phase::Create, items)
            .await
            .unwrap();

        assert_eq!(output.result.succeeded + output.result.failed, 3);
        assert!(output.result.succeeded >= 1);
        assert!(output.result.failed >= 1);
        assert!(!output.result.aborted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn elapsed_covers_the_whole_batch() {
        let store = MemoryStore::with_latency(Duration::ZERO, Duration::from_millis(20));
        let generator = WorkloadGenerator::new(RunNonce::fixed("wall"));
        let items = create_items(generator.generate(8));

        let output = PhaseExecutor::new(4)
            .run(direct(&store), Phase::Create, items)
            .await
            .unwrap();

        // 8 items over 4 workers at 20ms each is at least two rounds
        assert!(output.result.elapsed_seconds >= 0.035, "{}", output.result.elapsed_seconds);
        assert!(output.result.elapsed_seconds.is_finite());
        assert_eq!(output.result.succeeded, 8);
    }

    /// Delegates to the memory store but panics when reading `panic_on`.
    struct PanickyConnector {
        inner: Arc<dyn Connector>,
        panic_on: i64,
    }

    struct PanickyConnection {
        inner: Box<dyn Connection>,
        panic_on: i64,
    }

    #[async_trait]
    impl Connector for PanickyConnector {
        async fn connect(&self) -> crate::error::Result<Box<dyn Connection>> {
            Ok(Box::new(PanickyConnection {
                inner: self.inner.connect().await?,
                panic_on: self.panic_on,
            }))
        }

        fn describe(&self) -> String {
            "panicky".to_string()
        }
    }

    #[async_trait]
    impl Connection for PanickyConnection {
        async fn insert_user(&mut self, username: &str, email: &str) -> crate::error::Result<i64> {
            self.inner.insert_user(username, email).await
        }

        async fn select_user(&mut self, id: i64) -> crate::error::Result<Entity> {
            if id == self.panic_on {
                panic!("boom on {id}");
            }
            self.inner.select_user(id).await
        }

        async fn update_email(&mut self, id: i64, email: &str) -> crate::error::Result<()> {
            self.inner.update_email(id, email).await
        }

        async fn delete_user(&mut self, id: i64) -> crate::error::Result<()> {
            self.inner.delete_user(id).await
        }

        async fn close(self: Box<Self>) -> crate::error::Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn panicking_item_keeps_tally_and_frees_pool_slot() {
        let store = MemoryStore::new();
        let connector = Arc::new(PanickyConnector {
            inner: Arc::new(store.connector()),
            panic_on: 2,
        });
        let pool = Arc::new(
            PooledStrategy::connect(
                connector,
                PoolConfig {
                    min_size: 1,
                    max_size: 1,
                    acquire_timeout: Duration::from_millis(200),
                },
            )
            .await
            .unwrap(),
        );
        let first = pool
            .create_entity(&Entity::new("a", "a@test.com"))
            .await
            .unwrap();

        let items = vec![
            WorkItem::read(0, first),
            WorkItem::read(1, 2),
            WorkItem::read(2, first),
        ];
        let aborted = PhaseExecutor::new(1)
            .run(pool.clone(), Phase::Read, items)
            .await
            .unwrap_err();

        assert!(matches!(&aborted.source, BenchError::Worker(msg) if msg.contains("boom on 2")));
        assert_eq!(aborted.partial().succeeded, 1);
        assert_eq!(aborted.partial().failed, 1);
        assert_eq!(aborted.output.completed, BTreeSet::from([0]));

        // The handle held by the panicking item was dropped, not leaked
        assert_eq!(pool.status().checked_out, 0);
        assert_eq!(pool.read_entity(first).await.unwrap().username, "a");
    }
}
