// SPDX-License-Identifier: MIT

//! Step status transitions
//!
//! pending -> in_progress -> completed, nothing else. Every precondition is
//! checked before the step is touched, so a rejected transition leaves the
//! workflow exactly as it was. The budget check for `start` belongs to the
//! caller (see `WorkflowCoordinator`).

use chrono::{DateTime, Utc};

use super::resolver::DependencyResolver;
use crate::baton::workflow::types::{StepId, StepStatus, Workflow};
use crate::common::error::TransitionError;

pub struct StatusTransitioner;

impl StatusTransitioner {
    /// Move a pending step with satisfied dependencies to in_progress
    pub fn start(
        workflow: &mut Workflow,
        id: &StepId,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if workflow.is_completed() {
            return Err(TransitionError::WorkflowCompleted);
        }

        let step = workflow
            .step(id)
            .ok_or_else(|| TransitionError::UnknownStep(id.clone()))?;

        if step.status != StepStatus::Pending {
            return Err(TransitionError::NotPending {
                step: id.clone(),
                status: step.status,
            });
        }

        let pending = DependencyResolver::unmet_dependencies(workflow, step);
        if !pending.is_empty() {
            return Err(TransitionError::DependenciesUnmet {
                step: id.clone(),
                pending,
            });
        }

        if let Some(step) = workflow.step_mut(id) {
            step.status = StepStatus::InProgress;
            step.started_at = Some(now);
        }
        log::info!("Step {} started", id);
        Ok(())
    }

    /// Mark a pending or in-progress step completed and attach its report.
    /// A pending step skips `start`, so its dependencies are checked here.
    /// Retry state recorded for the step is dropped.
    pub fn complete(
        workflow: &mut Workflow,
        id: &StepId,
        result: String,
    ) -> Result<(), TransitionError> {
        if workflow.is_completed() {
            return Err(TransitionError::WorkflowCompleted);
        }

        let step = workflow
            .step(id)
            .ok_or_else(|| TransitionError::UnknownStep(id.clone()))?;

        match step.status {
            StepStatus::Completed => {
                return Err(TransitionError::AlreadyCompleted(id.clone()));
            }
            StepStatus::Pending => {
                let pending = DependencyResolver::unmet_dependencies(workflow, step);
                if !pending.is_empty() {
                    return Err(TransitionError::DependenciesUnmet {
                        step: id.clone(),
                        pending,
                    });
                }
            }
            StepStatus::InProgress => {}
        }

        if let Some(step) = workflow.step_mut(id) {
            step.status = StepStatus::Completed;
            step.result = Some(result);
        }
        let cleared = workflow.handoffs.clear_step(id);
        if cleared > 0 {
            log::debug!("Cleared {} handoff site(s) of completed step {}", cleared, id);
        }
        log::info!("Step {} completed", id);
        Ok(())
    }
}
