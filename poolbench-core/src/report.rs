//! Derived metrics for a direct vs. pooled comparison.
//!
//! Consumes the two phase -> duration maps and turns them into throughput,
//! mean wall time per operation, and relative gain. Text and JSON rendering
//! only; charts are left to external tools reading the JSON.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::Phase;
use crate::runner::Comparison;

/// One row of the comparison table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseComparison {
    /// Phase name, or `total`
    pub label: String,
    pub direct_seconds: Option<f64>,
    pub pooled_seconds: Option<f64>,
    pub direct_ops_per_sec: Option<f64>,
    pub pooled_ops_per_sec: Option<f64>,
    pub direct_ms_per_op: Option<f64>,
    pub pooled_ms_per_op: Option<f64>,
    /// `(direct - pooled) / direct * 100`
    pub gain_percent: Option<f64>,
}

impl PhaseComparison {
    fn new(label: impl Into<String>, direct: Option<f64>, pooled: Option<f64>, operations: usize) -> Self {
        Self {
            label: label.into(),
            direct_seconds: direct,
            pooled_seconds: pooled,
            direct_ops_per_sec: direct.and_then(|secs| throughput(operations, secs)),
            pooled_ops_per_sec: pooled.and_then(|secs| throughput(operations, secs)),
            direct_ms_per_op: direct.and_then(|secs| ms_per_op(operations, secs)),
            pooled_ms_per_op: pooled.and_then(|secs| ms_per_op(operations, secs)),
            gain_percent: match (direct, pooled) {
                (Some(direct), Some(pooled)) => gain_percent(direct, pooled),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub generated_at: DateTime<Utc>,
    pub operations_per_phase: usize,
    pub concurrency: usize,
    pub phases: Vec<PhaseComparison>,
    pub total: PhaseComparison,
    pub direct: BTreeMap<Phase, f64>,
    pub pooled: BTreeMap<Phase, f64>,
}

/// Builds a [`ComparisonReport`] from two phase -> duration maps.
pub struct ReportAggregator;

impl ReportAggregator {
    pub fn aggregate(
        direct: &BTreeMap<Phase, f64>,
        pooled: &BTreeMap<Phase, f64>,
        operations_per_phase: usize,
        concurrency: usize,
    ) -> ComparisonReport {
        let phases = Phase::ALL
            .iter()
            .map(|phase| {
                PhaseComparison::new(
                    phase.as_str(),
                    direct.get(phase).copied(),
                    pooled.get(phase).copied(),
                    operations_per_phase,
                )
            })
            .collect();

        // A total over a partial run would understate it, so only total complete maps
        let total_of = |map: &BTreeMap<Phase, f64>| {
            (map.len() == Phase::ALL.len()).then(|| map.values().sum::<f64>())
        };
        let total = PhaseComparison::new(
            "total",
            total_of(direct),
            total_of(pooled),
            operations_per_phase * Phase::ALL.len(),
        );

        ComparisonReport {
            generated_at: Utc::now(),
            operations_per_phase,
            concurrency,
            phases,
            total,
            direct: direct.clone(),
            pooled: pooled.clone(),
        }
    }

    pub fn from_comparison(comparison: &Comparison) -> ComparisonReport {
        Self::aggregate(
            &comparison.direct.durations(),
            &comparison.pooled.durations(),
            comparison.direct.entities,
            comparison.direct.concurrency,
        )
    }
}

fn throughput(operations: usize, seconds: f64) -> Option<f64> {
    (seconds > 0.0).then(|| operations as f64 / seconds)
}

fn ms_per_op(operations: usize, seconds: f64) -> Option<f64> {
    (operations > 0).then(|| seconds * 1000.0 / operations as f64)
}

fn gain_percent(direct: f64, pooled: f64) -> Option<f64> {
    (direct > 0.0).then(|| (direct - pooled) / direct * 100.0)
}

fn cell(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", precision, v),
        None => "-".to_string(),
    }
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "--- Total Performance Comparison ({} CRUD cycles, {} workers) ---",
            self.operations_per_phase, self.concurrency
        )?;
        writeln!(f, "  Without Pooling: {} seconds", cell(self.total.direct_seconds, 2))?;
        writeln!(f, "  With Pooling: {} seconds", cell(self.total.pooled_seconds, 2))?;
        match self.total.gain_percent {
            Some(gain) => writeln!(f, "  Performance Gain: {:.2}%", gain)?,
            None => writeln!(f, "  Performance Gain: n/a")?,
        }
        writeln!(f, "{}", "-".repeat(50))?;

        writeln!(
            f,
            "{:<8} {:>10} {:>10} {:>11} {:>11} {:>9}",
            "phase", "direct s", "pooled s", "direct op/s", "pooled op/s", "gain %"
        )?;
        for row in self.phases.iter().chain(std::iter::once(&self.total)) {
            writeln!(
                f,
                "{:<8} {:>10} {:>10} {:>11} {:>11} {:>9}",
                row.label,
                cell(row.direct_seconds, 3),
                cell(row.pooled_seconds, 3),
                cell(row.direct_ops_per_sec, 1),
                cell(row.pooled_ops_per_sec, 1),
                cell(row.gain_percent, 2),
            )?;
        }
        Ok(())
    }
}
