// SPDX-License-Identifier: MIT

//! Workflow coordinator
//!
//! Entry point for externally observed events. Every mutation runs as one
//! locked load-modify-save cycle; a version conflict reloads and replays the
//! whole cycle a bounded number of times.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::baton::handoff::{
    Decision, HandoffSite, HandoffValidator, Outcome, RetryEscalationController,
};
use crate::baton::workflow::graph::{
    DependencyResolver, ExecutionScheduler, SchedulePlan, StatusTransitioner,
};
use crate::baton::workflow::state::GraphStore;
use crate::baton::workflow::types::{StepId, StepStatus, Workflow};
use crate::common::config::CoordinatorConfig;
use crate::common::error::{BatonError, Result, TransitionError};

/// Process exit codes of the event contract
pub const EXIT_OK: i32 = 0;
pub const EXIT_RETRY: i32 = 1;
pub const EXIT_ESCALATE: i32 = 2;

/// "Agent X finished, here is its report"
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub agent: String,
    pub report: String,
    /// Explicit step, e.g. when a fallback actor reports on another's step
    pub step: Option<StepId>,
}

impl CompletionEvent {
    pub fn new(agent: impl Into<String>, report: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            report: report.into(),
            step: None,
        }
    }

    pub fn for_step(mut self, step: StepId) -> Self {
        self.step = Some(step);
        self
    }
}

/// A step the host should hand to its actor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchItem {
    pub id: StepId,
    pub agent: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_run_parallel: Option<bool>,
}

/// What the host must do after an event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    Dispatch {
        completed_step: StepId,
        steps: Vec<DispatchItem>,
        #[serde(skip_serializing_if = "Option::is_none")]
        handoff_target: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        handoff_token: Option<String>,
        workflow_completed: bool,
    },
    Retry {
        step: StepId,
        attempt: u32,
        instruction: String,
    },
    Escalate {
        step: StepId,
        attempts: u32,
        fallback_agent: String,
        instruction: String,
        explanation: String,
    },
}

impl Disposition {
    pub fn exit_code(&self) -> i32 {
        match self {
            Disposition::Dispatch { .. } => EXIT_OK,
            Disposition::Retry { .. } => EXIT_RETRY,
            Disposition::Escalate { .. } => EXIT_ESCALATE,
        }
    }
}

/// An in-progress step that has been running longer than the threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleStep {
    pub id: StepId,
    pub agent: String,
    pub started_at: DateTime<Utc>,
    pub age_secs: u64,
}

pub struct WorkflowCoordinator<S: GraphStore> {
    store: S,
    validator: HandoffValidator,
    controller: RetryEscalationController,
    config: CoordinatorConfig,
}

impl<S: GraphStore> WorkflowCoordinator<S> {
    pub fn new(store: S, config: CoordinatorConfig) -> Self {
        let controller = RetryEscalationController::new(
            config.max_handoff_attempts,
            config.fallback_agent.clone(),
        );
        Self {
            store,
            validator: HandoffValidator::new(),
            controller,
            config,
        }
    }

    pub fn with_validator(mut self, validator: HandoffValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist a freshly ingested plan. An existing document is archived
    /// first when `force` is set, otherwise refused.
    pub async fn initialize(&self, mut workflow: Workflow, force: bool) -> Result<Workflow> {
        let _guard = self.store.lock().await?;

        if self.store.exists().await {
            if !force {
                return Err(BatonError::other(
                    "a workflow document already exists; archive it or use --force",
                ));
            }
            let archived = self.store.archive().await?;
            log::info!("Replaced existing workflow, old copy at {}", archived.display());
        }

        workflow.version = 0;
        self.store.save(&mut workflow).await?;
        log::info!(
            "Workflow initialized with {} steps (max_parallel {})",
            workflow.steps.len(),
            workflow.max_parallel()
        );
        Ok(workflow)
    }

    /// Handle one completion report: validate the handoff, then either
    /// advance the graph or ask for a retry/escalation.
    pub async fn handle_event(&self, event: &CompletionEvent) -> Result<Disposition> {
        let (disposition, _) = self
            .mutate(|workflow| self.apply_event(workflow, event))
            .await?;
        Ok(disposition)
    }

    fn apply_event(
        &self,
        workflow: &mut Workflow,
        event: &CompletionEvent,
    ) -> Result<Disposition> {
        let step_id = resolve_step(workflow, event)?;
        let site = HandoffSite::new(&step_id, &event.agent);
        let outcome = self.validator.validate(&event.report);
        log::debug!("Report from {} for step {}: {:?}", event.agent, step_id, outcome);

        match self.controller.record(&mut workflow.handoffs, &site, &outcome) {
            Decision::Proceed => {
                StatusTransitioner::complete(workflow, &step_id, event.report.clone())?;
                let steps = dispatch_next(workflow)?;

                let (handoff_target, handoff_token) = match outcome {
                    Outcome::Handoff { target, token } => (Some(target), Some(token)),
                    _ => (None, None),
                };
                if let Some(target) = &handoff_target {
                    if !steps.is_empty() && !steps.iter().any(|s| &s.agent == target) {
                        log::warn!(
                            "Report names @{} but no dispatched step belongs to that agent",
                            target
                        );
                    }
                }

                Ok(Disposition::Dispatch {
                    completed_step: step_id,
                    steps,
                    handoff_target,
                    handoff_token,
                    workflow_completed: workflow.is_completed(),
                })
            }
            Decision::Retry {
                attempt,
                instruction,
            } => Ok(Disposition::Retry {
                step: step_id,
                attempt,
                instruction,
            }),
            Decision::Escalate {
                attempts,
                fallback_agent,
                instruction,
                explanation,
            } => {
                let task = workflow
                    .step(&step_id)
                    .map(|s| s.task.clone())
                    .unwrap_or_default();
                Ok(Disposition::Escalate {
                    instruction: format!(
                        "{}\n\nOriginal task for step {}: {}",
                        instruction, step_id, task
                    ),
                    step: step_id,
                    attempts,
                    fallback_agent,
                    explanation,
                })
            }
        }
    }

    /// Start one step, enforcing the concurrency budget
    pub async fn start_step(&self, id: &StepId) -> Result<Workflow> {
        let (_, workflow) = self
            .mutate(|workflow| {
                if ExecutionScheduler::plan(workflow).can_start_more == 0 {
                    return Err(TransitionError::BudgetExhausted {
                        max_parallel: workflow.max_parallel(),
                    }
                    .into());
                }
                StatusTransitioner::start(workflow, id, Utc::now())?;
                Ok(())
            })
            .await?;
        Ok(workflow)
    }

    /// Complete one step directly, bypassing handoff validation
    pub async fn complete_step(&self, id: &StepId, result: &str) -> Result<Workflow> {
        let (_, workflow) = self
            .mutate(|workflow| {
                StatusTransitioner::complete(workflow, id, result.to_string())?;
                Ok(())
            })
            .await?;
        Ok(workflow)
    }

    /// Start every recommended step and describe them for the host
    pub async fn dispatch(&self) -> Result<Vec<DispatchItem>> {
        let (items, _) = self.mutate(dispatch_next).await?;
        Ok(items)
    }

    pub async fn status(&self) -> Result<Workflow> {
        self.store.load().await
    }

    pub async fn plan(&self) -> Result<SchedulePlan> {
        Ok(ExecutionScheduler::plan(&self.store.load().await?))
    }

    /// Report in-progress steps older than `threshold`. Status is left
    /// untouched; the operator decides what to do with them.
    pub async fn sweep_stale(&self, threshold: Duration) -> Result<Vec<StaleStep>> {
        let workflow = self.store.load().await?;
        let now = Utc::now();

        let mut stale = Vec::new();
        for step in workflow
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::InProgress)
        {
            let Some(started_at) = step.started_at else {
                log::debug!("Step {} is in progress without a start time", step.id);
                continue;
            };
            let age = (now - started_at).to_std().unwrap_or_default();
            if age >= threshold {
                log::warn!(
                    "Step {} ({}) has been in progress for {}s",
                    step.id,
                    step.agent,
                    age.as_secs()
                );
                stale.push(StaleStep {
                    id: step.id.clone(),
                    agent: step.agent.clone(),
                    started_at,
                    age_secs: age.as_secs(),
                });
            }
        }
        Ok(stale)
    }

    /// Locked load-modify-save. `apply` runs against a fresh load on every
    /// attempt; nothing is saved when it fails.
    async fn mutate<T, F>(&self, mut apply: F) -> Result<(T, Workflow)>
    where
        F: FnMut(&mut Workflow) -> Result<T>,
    {
        let mut retries = 0;
        loop {
            let _guard = self.store.lock().await?;
            let mut workflow = self.store.load().await?;
            if workflow.is_completed() {
                return Err(TransitionError::WorkflowCompleted.into());
            }

            let value = apply(&mut workflow)?;

            match self.store.save(&mut workflow).await {
                Ok(()) => {
                    if self.config.archive_completed && workflow.is_completed() {
                        self.store.archive().await?;
                    }
                    return Ok((value, workflow));
                }
                Err(e) if e.is_recoverable() && retries < self.config.cas_retries => {
                    retries += 1;
                    log::warn!(
                        "{}; reloading and retrying ({}/{})",
                        e,
                        retries,
                        self.config.cas_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Find the step a report belongs to: the explicit one, else the lowest-id
/// in-progress step of that agent, else its lowest-id available step.
fn resolve_step(workflow: &Workflow, event: &CompletionEvent) -> Result<StepId> {
    if let Some(id) = &event.step {
        let step = workflow
            .step(id)
            .ok_or_else(|| TransitionError::UnknownStep(id.clone()))?;
        if step.status == StepStatus::Completed {
            return Err(TransitionError::AlreadyCompleted(id.clone()).into());
        }
        if step.agent != event.agent {
            log::info!(
                "Step {} belongs to {} but was reported by {}",
                id,
                step.agent,
                event.agent
            );
        }
        return Ok(id.clone());
    }

    let mut running: Vec<&StepId> = workflow
        .steps
        .iter()
        .filter(|s| s.agent == event.agent && s.status == StepStatus::InProgress)
        .map(|s| &s.id)
        .collect();
    running.sort();
    if let Some(id) = running.first() {
        return Ok((*id).clone());
    }

    DependencyResolver::available(workflow)
        .into_iter()
        .find(|id| workflow.step(id).is_some_and(|s| s.agent == event.agent))
        .ok_or_else(|| TransitionError::NoActiveStepForAgent(event.agent.clone()).into())
}

/// Move every recommended step to in_progress
fn dispatch_next(workflow: &mut Workflow) -> Result<Vec<DispatchItem>> {
    let plan = ExecutionScheduler::plan(workflow);
    let now = Utc::now();

    let mut items = Vec::with_capacity(plan.next_recommended.len());
    for id in &plan.next_recommended {
        StatusTransitioner::start(workflow, id, now)?;
        if let Some(step) = workflow.step(id) {
            items.push(DispatchItem {
                id: step.id.clone(),
                agent: step.agent.clone(),
                task: step.task.clone(),
                can_run_parallel: step.can_run_parallel,
            });
        }
    }

    if !items.is_empty() {
        log::info!(
            "Dispatching {} step(s): {:?}",
            items.len(),
            items.iter().map(|i| i.id.to_string()).collect::<Vec<_>>()
        );
    }
    Ok(items)
}
