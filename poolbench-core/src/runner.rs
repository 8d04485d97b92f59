//! Phase sequencing for one strategy, and back-to-back comparison runs.
//!
//! Each run walks `Idle -> Create -> Read -> Update -> Delete -> Done`. Phases
//! never overlap. The index -> id map built by the create phase drives the
//! later batches; indices whose creation failed are skipped (and counted as
//! failures), never retried.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::backend::Connector;
use crate::config::BenchConfig;
use crate::error::Result;
use crate::executor::{PhaseExecutor, PhaseOutput};
use crate::model::{Entity, Phase, PhaseResult, WorkItem};
use crate::strategy::{build_strategy, ConnectionStrategy, StrategyKind};
use crate::workload::{updated_email, WorkloadGenerator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Create,
    Read,
    Update,
    Delete,
    Done,
}

impl RunState {
    pub fn next(self) -> Self {
        match self {
            RunState::Idle => RunState::Create,
            RunState::Create => RunState::Read,
            RunState::Read => RunState::Update,
            RunState::Update => RunState::Delete,
            RunState::Delete | RunState::Done => RunState::Done,
        }
    }

    pub fn phase(self) -> Option<Phase> {
        match self {
            RunState::Create => Some(Phase::Create),
            RunState::Read => Some(Phase::Read),
            RunState::Update => Some(Phase::Update),
            RunState::Delete => Some(Phase::Delete),
            RunState::Idle | RunState::Done => None,
        }
    }
}

/// Timings and counts for one strategy's run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub strategy: StrategyKind,
    pub started_at: DateTime<Utc>,
    pub entities: usize,
    pub concurrency: usize,
    pub phases: Vec<PhaseResult>,
    /// Rows created by this run that are still in the table
    pub orphaned: usize,
    /// Why the run stopped early, if it did
    pub aborted: Option<String>,
}

impl RunReport {
    fn new(strategy: StrategyKind, config: &BenchConfig) -> Self {
        Self {
            strategy,
            started_at: Utc::now(),
            entities: config.workload.entities,
            concurrency: config.workload.concurrency,
            phases: Vec::with_capacity(Phase::ALL.len()),
            orphaned: 0,
            aborted: None,
        }
    }

    /// phase -> wall-clock seconds, for the phases that ran
    pub fn durations(&self) -> BTreeMap<Phase, f64> {
        self.phases
            .iter()
            .map(|result| (result.phase, result.elapsed_seconds))
            .collect()
    }

    pub fn total_seconds(&self) -> f64 {
        self.phases.iter().map(|result| result.elapsed_seconds).sum()
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases.iter().find(|result| result.phase == phase)
    }

    /// All four phases ran to completion (individual items may still have failed)
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && self.phases.len() == Phase::ALL.len()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({} entities, {} workers)",
            self.strategy.label(),
            self.entities,
            self.concurrency
        )?;
        for result in &self.phases {
            writeln!(
                f,
                "  {:<8} {:>9.3}s  ok={:<6} failed={:<6}{}",
                result.phase,
                result.elapsed_seconds,
                result.succeeded,
                result.failed,
                if result.aborted { "  (aborted)" } else { "" }
            )?;
        }
        write!(f, "  {:<8} {:>9.3}s", "total", self.total_seconds())?;
        if let Some(reason) = &self.aborted {
            write!(f, "\n  aborted: {}", reason)?;
        }
        if self.orphaned > 0 {
            write!(f, "\n  orphaned rows: {}", self.orphaned)?;
        }
        Ok(())
    }
}

/// Drives the four phases for one strategy.
pub struct BenchmarkRunner<'a> {
    config: &'a BenchConfig,
    generator: &'a WorkloadGenerator,
    executor: PhaseExecutor,
}

impl<'a> BenchmarkRunner<'a> {
    pub fn new(config: &'a BenchConfig, generator: &'a WorkloadGenerator) -> Self {
        Self {
            config,
            generator,
            executor: PhaseExecutor::new(config.workload.concurrency),
        }
    }

    pub async fn run(&self, strategy: Arc<dyn ConnectionStrategy>) -> RunReport {
        let kind = strategy.kind();
        let span = info_span!("run", strategy = %kind);
        self.run_phases(strategy).instrument(span).await
    }

    async fn run_phases(&self, strategy: Arc<dyn ConnectionStrategy>) -> RunReport {
        let n = self.config.workload.entities;
        let mut report = RunReport::new(strategy.kind(), self.config);
        let mut entities: Vec<Entity> = Vec::new();
        let mut ids: BTreeMap<usize, i64> = BTreeMap::new();
        let mut deleted: BTreeSet<usize> = BTreeSet::new();

        let mut state = RunState::Idle;
        loop {
            state = state.next();
            let Some(phase) = state.phase() else { break };

            if phase == Phase::Create {
                entities = self.generator.generate(n);
            }
            let items = batch(phase, &entities, &ids);
            let skipped = match phase {
                Phase::Create => 0,
                _ => n - items.len(),
            };
            if skipped > 0 {
                warn!(%phase, skipped, "skipping entities whose creation failed");
            }
            info!(%phase, items = items.len(), "running phase");

            let (output, abort) = match self.executor.run(strategy.clone(), phase, items).await {
                Ok(output) => (output, None),
                Err(aborted) => {
                    let reason = aborted.to_string();
                    (aborted.output, Some(reason))
                }
            };

            let PhaseOutput {
                mut result,
                created,
                completed,
            } = output;
            result.skipped = skipped;
            result.failed += skipped;
            report.phases.push(result);

            match phase {
                Phase::Create => ids = created,
                Phase::Delete => deleted = completed,
                Phase::Read | Phase::Update => {}
            }

            if abort.is_some() {
                report.aborted = abort;
                break;
            }
        }

        report.orphaned = ids.keys().filter(|index| !deleted.contains(index)).count();
        if report.orphaned > 0 {
            warn!(orphaned = report.orphaned, "rows created by this run were not deleted");
        }
        info!(total_secs = report.total_seconds(), "run finished");
        report
    }
}

/// Work items for `phase`. Later phases only include indices that have an id.
fn batch(phase: Phase, entities: &[Entity], ids: &BTreeMap<usize, i64>) -> Vec<WorkItem> {
    match phase {
        Phase::Create => entities
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, entity)| WorkItem::create(index, entity))
            .collect(),
        Phase::Read => ids.iter().map(|(&index, &id)| WorkItem::read(index, id)).collect(),
        Phase::Update => ids
            .iter()
            .map(|(&index, &id)| WorkItem::update(index, id, updated_email(&entities[index])))
            .collect(),
        Phase::Delete => ids.iter().map(|(&index, &id)| WorkItem::delete(index, id)).collect(),
    }
}

/// Direct and pooled runs of the same workload.
#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub direct: RunReport,
    pub pooled: RunReport,
}

/// Run each strategy in turn, back-to-back and never interleaved.
///
/// Each strategy is built just before its run and shut down right after, so
/// one strategy's connections never exist during the other's timings.
pub async fn run_strategies(
    config: &BenchConfig,
    generator: &WorkloadGenerator,
    connector: Arc<dyn Connector>,
    kinds: &[StrategyKind],
) -> Result<Vec<RunReport>> {
    config.validate()?;
    let runner = BenchmarkRunner::new(config, generator);
    let mut reports = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        reports.push(run_one(&runner, kind, connector.clone()).await);
    }
    Ok(reports)
}

/// Direct first, then pooled.
pub async fn run_comparison(
    config: &BenchConfig,
    generator: &WorkloadGenerator,
    connector: Arc<dyn Connector>,
) -> Result<Comparison> {
    config.validate()?;
    let runner = BenchmarkRunner::new(config, generator);
    let direct = run_one(&runner, StrategyKind::Direct, connector.clone()).await;
    let pooled = run_one(&runner, StrategyKind::Pooled, connector).await;
    Ok(Comparison { direct, pooled })
}

async fn run_one(runner: &BenchmarkRunner<'_>, kind: StrategyKind, connector: Arc<dyn Connector>) -> RunReport {
    match build_strategy(kind, connector, &runner.config.pool).await {
        Ok(strategy) => {
            let report = runner.run(strategy.clone()).await;
            strategy.shutdown().await;
            report
        }
        Err(err) => {
            warn!(strategy = %kind, error = %err, "could not start strategy");
            let mut report = RunReport::new(kind, runner.config);
            report.aborted = Some(err.to_string());
            report
        }
    }
}
