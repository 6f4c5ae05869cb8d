// SPDX-License-Identifier: MIT

//! Workflow document types
//!
//! These types mirror the persisted JSON document one-to-one. Optional
//! fields are skipped when absent so that a load/save cycle is lossless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::baton::handoff::RetryLedger;

/// Identifier of a step: either an integer or a string
///
/// Ordering puts every integer id before every string id; integers compare
/// numerically and strings lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StepId {
    Int(i64),
    Str(String),
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepId::Int(n) => write!(f, "{}", n),
            StepId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for StepId {
    fn from(n: i64) -> Self {
        StepId::Int(n)
    }
}

impl From<i32> for StepId {
    fn from(n: i32) -> Self {
        StepId::Int(n as i64)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        StepId::Str(s.to_string())
    }
}

impl StepId {
    /// Parse a command-line id: integers become `Int`, anything else `Str`.
    /// A double-quoted value is always a string, so `"1"` addresses the
    /// string id `1` rather than the integer.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(quoted) = raw
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
        {
            return StepId::Str(quoted.to_string());
        }
        match raw.parse::<i64>() {
            Ok(n) => StepId::Int(n),
            Err(_) => StepId::Str(raw.to_string()),
        }
    }
}

/// Status of a single step. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Workflow-level status, always derived from the steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

/// One unit of work bound to one external actor
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Step {
    pub id: StepId,
    /// Capability name of the actor that performs this step
    pub agent: String,
    /// Instruction handed to the actor
    pub task: String,
    pub status: StepStatus,
    pub depends_on: Vec<StepId>,
    /// Advisory only, never widens the `max_parallel` budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_run_parallel: Option<bool>,
    /// Report captured on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(id: impl Into<StepId>, agent: &str, task: &str, depends_on: Vec<StepId>) -> Self {
        Self {
            id: id.into(),
            agent: agent.to_string(),
            task: task.to_string(),
            status: StepStatus::Pending,
            depends_on,
            can_run_parallel: None,
            result: None,
            started_at: None,
        }
    }
}

/// Cached scheduling view, rewritten on every save
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExecutionState {
    pub max_parallel: usize,
    #[serde(default)]
    pub in_progress_count: usize,
    #[serde(default)]
    pub available_tasks: Vec<StepId>,
    #[serde(default)]
    pub can_start_more: usize,
    #[serde(default)]
    pub next_recommended: Vec<StepId>,
}

impl ExecutionState {
    pub fn with_budget(max_parallel: usize) -> Self {
        Self {
            max_parallel,
            in_progress_count: 0,
            available_tasks: vec![],
            can_start_more: 0,
            next_recommended: vec![],
        }
    }
}

/// One workflow run: goal, task graph and cached execution state
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Workflow {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    pub steps: Vec<Step>,
    pub execution_state: ExecutionState,
    /// Bumped on every save, used for compare-and-swap
    #[serde(default, skip_serializing_if = "is_zero")]
    pub version: u64,
    /// Per-site handoff retry state
    #[serde(default, skip_serializing_if = "RetryLedger::is_empty")]
    pub handoffs: RetryLedger,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Workflow {
    pub fn new(goal: &str, steps: Vec<Step>, max_parallel: usize) -> Self {
        let mut workflow = Self {
            goal: goal.to_string(),
            status: WorkflowStatus::Pending,
            steps,
            execution_state: ExecutionState::with_budget(max_parallel),
            version: 0,
            handoffs: RetryLedger::default(),
        };
        workflow.refresh();
        workflow
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn step_mut(&mut self, id: &StepId) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| &s.id == id)
    }

    pub fn max_parallel(&self) -> usize {
        self.execution_state.max_parallel
    }

    pub fn count_with_status(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    pub fn in_progress_count(&self) -> usize {
        self.count_with_status(StepStatus::InProgress)
    }

    /// Evaluate the workflow status from the steps.
    ///
    /// Completed exactly when no step is pending or in progress.
    pub fn evaluate_status(&self) -> WorkflowStatus {
        let open = self
            .steps
            .iter()
            .filter(|s| s.status != StepStatus::Completed)
            .count();
        if open == 0 {
            WorkflowStatus::Completed
        } else if self.steps.iter().any(|s| s.status != StepStatus::Pending) {
            WorkflowStatus::InProgress
        } else {
            WorkflowStatus::Pending
        }
    }

    pub fn is_completed(&self) -> bool {
        self.evaluate_status() == WorkflowStatus::Completed
    }

    /// Recompute the derived `status` and `execution_state`
    pub fn refresh(&mut self) {
        crate::baton::workflow::graph::ExecutionScheduler::refresh(self);
    }
}
