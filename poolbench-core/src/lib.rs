//! Dual-strategy CRUD benchmarking harness.
//!
//! Measures what connection pooling buys a CRUD workload: the same synthetic
//! batch is pushed through a per-operation connection strategy and a bounded
//! pool, phase by phase, and the wall-clock time of each phase is reported.

pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod report;
pub mod runner;
pub mod strategy;
pub mod workload;

pub use backend::{ensure_schema, Connection, Connector, MemoryConnector, MemoryStore, PgConnector};
pub use config::{BenchConfig, ConnectionConfig, PoolConfig, WorkloadConfig};
pub use error::{BenchError, Result};
pub use executor::{PhaseAborted, PhaseExecutor, PhaseOutput};
pub use model::{Entity, Operation, Phase, PhaseResult, WorkItem};
pub use report::{ComparisonReport, PhaseComparison, ReportAggregator};
pub use runner::{run_comparison, run_strategies, BenchmarkRunner, Comparison, RunReport, RunState};
pub use strategy::{
    build_strategy, ConnectionHandle, ConnectionStrategy, DirectStrategy, PoolStatus, PooledStrategy,
    StrategyKind,
};
pub use workload::{updated_email, RunNonce, WorkloadGenerator};
