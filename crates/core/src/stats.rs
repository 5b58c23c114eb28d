//! Execution statistics, derived on demand from stored records.

use crate::types::{ExecutionRecord, ExecutionStatus, NodeId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Min/avg/max and percentiles over a set of durations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationSummary {
    pub count: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: f64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
}

impl DurationSummary {
    pub fn from_durations(mut durations: Vec<u64>) -> Self {
        if durations.is_empty() {
            return Self::default();
        }
        durations.sort_unstable();

        let count = durations.len() as u64;
        let total: u64 = durations.iter().sum();
        Self {
            count,
            min_ms: durations[0],
            max_ms: durations[durations.len() - 1],
            avg_ms: total as f64 / count as f64,
            p50_ms: percentile(&durations, 0.50),
            p95_ms: percentile(&durations, 0.95),
        }
    }
}

/// Nearest-rank percentile of sorted durations
fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((sorted.len() as f64) * p).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    Some(sorted[index])
}

/// Statistics for one node across executions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub visits: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub retry_count: u64,
    /// Visits that never dispatched (cancelled, cycle stop, bad mapping) are excluded
    pub duration: DurationSummary,
}

/// Slowest node of a workflow by average duration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckInfo {
    pub node_id: NodeId,
    pub avg_duration_ms: f64,
    pub percentage_of_total: f64,
}

/// Statistics for a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub workflow_id: WorkflowId,
    pub execution_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub in_flight_count: u64,
    pub success_rate: f64,
    /// Total duration of terminal executions
    pub duration: DurationSummary,
    pub nodes: Vec<NodeStats>,
    pub bottleneck: Option<BottleneckInfo>,
    pub last_execution: Option<DateTime<Utc>>,
}

/// Statistics across all workflows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsOverview {
    pub total_executions: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub in_flight_count: u64,
    pub success_rate: f64,
    pub workflows: Vec<WorkflowStats>,
}

#[derive(Default)]
struct StatusCounts {
    completed: u64,
    failed: u64,
    in_flight: u64,
}

impl StatusCounts {
    fn tally<'a>(records: impl Iterator<Item = &'a ExecutionRecord>) -> Self {
        let mut counts = Self::default();
        for record in records {
            match record.status {
                ExecutionStatus::Completed => counts.completed += 1,
                ExecutionStatus::Failed => counts.failed += 1,
                ExecutionStatus::Pending | ExecutionStatus::Running => counts.in_flight += 1,
            }
        }
        counts
    }

    fn success_rate(&self) -> f64 {
        let terminal = self.completed + self.failed;
        if terminal == 0 {
            0.0
        } else {
            self.completed as f64 / terminal as f64
        }
    }
}

#[derive(Default)]
struct NodeAccumulator {
    visits: u64,
    success_count: u64,
    failure_count: u64,
    retry_count: u64,
    durations: Vec<u64>,
}

/// Statistics for one workflow; records of other workflows are ignored
pub fn workflow_stats(workflow_id: &WorkflowId, records: &[ExecutionRecord]) -> WorkflowStats {
    let records: Vec<&ExecutionRecord> = records
        .iter()
        .filter(|r| &r.workflow_id == workflow_id)
        .collect();

    let counts = StatusCounts::tally(records.iter().copied());

    let duration = DurationSummary::from_durations(
        records
            .iter()
            .filter(|r| r.status.is_terminal())
            .map(|r| r.total_duration_ms)
            .collect(),
    );

    let mut per_node: BTreeMap<NodeId, NodeAccumulator> = BTreeMap::new();
    for entry in records.iter().flat_map(|r| r.node_history.iter()) {
        let acc = per_node.entry(entry.node_id.clone()).or_default();
        acc.visits += 1;
        if entry.outcome.is_success() {
            acc.success_count += 1;
        } else {
            acc.failure_count += 1;
        }
        acc.retry_count += u64::from(entry.retries_used);
        if !entry.attempts.is_empty() {
            acc.durations.push(entry.duration_ms);
        }
    }

    let nodes: Vec<NodeStats> = per_node
        .into_iter()
        .map(|(node_id, acc)| NodeStats {
            node_id,
            visits: acc.visits,
            success_count: acc.success_count,
            failure_count: acc.failure_count,
            retry_count: acc.retry_count,
            duration: DurationSummary::from_durations(acc.durations),
        })
        .collect();

    let bottleneck = nodes
        .iter()
        .filter(|n| n.duration.count > 0)
        .max_by(|a, b| a.duration.avg_ms.total_cmp(&b.duration.avg_ms))
        .map(|n| BottleneckInfo {
            node_id: n.node_id.clone(),
            avg_duration_ms: n.duration.avg_ms,
            percentage_of_total: if duration.avg_ms > 0.0 {
                (n.duration.avg_ms / duration.avg_ms) * 100.0
            } else {
                0.0
            },
        });

    WorkflowStats {
        workflow_id: workflow_id.clone(),
        execution_count: records.len() as u64,
        completed_count: counts.completed,
        failed_count: counts.failed,
        in_flight_count: counts.in_flight,
        success_rate: counts.success_rate(),
        duration,
        nodes,
        bottleneck,
        last_execution: records.iter().map(|r| r.started_at).max(),
    }
}

/// Global totals plus per-workflow statistics, ordered by workflow id
pub fn overview(records: &[ExecutionRecord]) -> StatsOverview {
    let counts = StatusCounts::tally(records.iter());
    let ids: BTreeSet<&WorkflowId> = records.iter().map(|r| &r.workflow_id).collect();

    StatsOverview {
        total_executions: records.len() as u64,
        completed_count: counts.completed,
        failed_count: counts.failed,
        in_flight_count: counts.in_flight,
        success_rate: counts.success_rate(),
        workflows: ids.into_iter().map(|id| workflow_stats(id, records)).collect(),
    }
}
