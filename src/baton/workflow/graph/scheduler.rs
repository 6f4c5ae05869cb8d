// SPDX-License-Identifier: MIT

//! Execution scheduling under a concurrency budget

use serde::Serialize;

use super::resolver::DependencyResolver;
use crate::baton::workflow::types::{StepId, Workflow};

/// Scheduling decision for the current graph state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulePlan {
    pub available: Vec<StepId>,
    pub in_progress_count: usize,
    pub can_start_more: usize,
    /// The first `can_start_more` available steps, lowest id first
    pub next_recommended: Vec<StepId>,
}

pub struct ExecutionScheduler;

impl ExecutionScheduler {
    pub fn plan(workflow: &Workflow) -> SchedulePlan {
        let available = DependencyResolver::available(workflow);
        let in_progress_count = workflow.in_progress_count();
        let can_start_more = workflow.max_parallel().saturating_sub(in_progress_count);
        let next_recommended = available.iter().take(can_start_more).cloned().collect();

        SchedulePlan {
            available,
            in_progress_count,
            can_start_more,
            next_recommended,
        }
    }

    /// Write the current plan and derived status into the workflow
    pub fn refresh(workflow: &mut Workflow) {
        let plan = Self::plan(workflow);
        let state = &mut workflow.execution_state;
        state.in_progress_count = plan.in_progress_count;
        state.available_tasks = plan.available;
        state.can_start_more = plan.can_start_more;
        state.next_recommended = plan.next_recommended;
        workflow.status = workflow.evaluate_status();
    }
}
