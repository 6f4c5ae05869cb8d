// SPDX-License-Identifier: MIT

//! Dependency resolution
//!
//! A step is available when it is pending and every step it depends on is
//! completed. No traversal is needed: status only moves forward and
//! `depends_on` never changes after ingestion, so a per-step check against
//! the current completed set is enough.

use std::collections::{HashMap, HashSet};

use crate::baton::workflow::types::{Step, StepId, StepStatus, Workflow};

pub struct DependencyResolver;

impl DependencyResolver {
    /// Ids of every available step, in ascending id order
    pub fn available(workflow: &Workflow) -> Vec<StepId> {
        let completed = Self::completed_ids(workflow);

        let mut ready: Vec<StepId> = workflow
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .filter(|step| Self::dependencies_satisfied(step, &completed))
            .map(|step| step.id.clone())
            .collect();
        ready.sort();
        ready
    }

    /// Dependencies of `step` that are not completed yet
    pub fn unmet_dependencies(workflow: &Workflow, step: &Step) -> Vec<StepId> {
        let statuses: HashMap<&StepId, StepStatus> =
            workflow.steps.iter().map(|s| (&s.id, s.status)).collect();

        step.depends_on
            .iter()
            .filter(|dep| statuses.get(dep) != Some(&StepStatus::Completed))
            .cloned()
            .collect()
    }

    fn completed_ids(workflow: &Workflow) -> HashSet<&StepId> {
        workflow
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| &s.id)
            .collect()
    }

    fn dependencies_satisfied(step: &Step, completed: &HashSet<&StepId>) -> bool {
        step.depends_on.iter().all(|dep| completed.contains(dep))
    }
}
