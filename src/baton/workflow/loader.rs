// SPDX-License-Identifier: MIT

//! Workflow loader - plan and document ingestion
//!
//! Plans may be JSON or YAML. Every step must spell out `id`, `agent`,
//! `task`, `status` and `depends_on`; nothing is silently defaulted. A plan
//! without `execution_state` gets one with the loader's budget.

use serde_json::{Map, Value};
use std::path::Path;

use super::graph::check_graph;
use super::types::{ExecutionState, StepStatus, Workflow};
use crate::common::config::DEFAULT_MAX_PARALLEL;
use crate::common::error::{BatonError, Result, ValidationError};

const REQUIRED_STEP_FIELDS: [&str; 5] = ["id", "agent", "task", "status", "depends_on"];

/// Loads and validates workflow documents
pub struct WorkflowLoader {
    default_max_parallel: usize,
}

impl WorkflowLoader {
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_MAX_PARALLEL)
    }

    /// Loader whose plans default to `max_parallel` when they carry no budget
    pub fn with_budget(max_parallel: usize) -> Self {
        Self {
            default_max_parallel: max_parallel,
        }
    }

    /// Load a plan from a file, picking YAML or JSON by extension
    pub fn load_plan<P: AsRef<Path>>(&self, path: P) -> Result<Workflow> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");

        if is_yaml {
            self.parse_yaml(&content)
        } else {
            self.parse_json(&content)
        }
    }

    pub fn parse_json(&self, content: &str) -> Result<Workflow> {
        let value: Value = serde_json::from_str(content)?;
        self.ingest(value)
    }

    pub fn parse_yaml(&self, content: &str) -> Result<Workflow> {
        let value: Value = serde_yaml::from_str(content)?;
        self.ingest(value)
    }

    /// Validate raw document structure, deserialize, then validate the graph
    pub fn ingest(&self, mut value: Value) -> Result<Workflow> {
        let root = value
            .as_object_mut()
            .ok_or_else(|| BatonError::malformed("document must be an object"))?;

        check_required_fields(root)?;

        if !root.contains_key("execution_state") {
            root.insert(
                "execution_state".to_string(),
                serde_json::to_value(ExecutionState::with_budget(self.default_max_parallel))?,
            );
        }

        let mut workflow: Workflow = serde_json::from_value(value)
            .map_err(|e| BatonError::malformed(e.to_string()))?;

        validate(&workflow)?;
        workflow.refresh();
        Ok(workflow)
    }
}

impl Default for WorkflowLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn check_required_fields(root: &Map<String, Value>) -> Result<()> {
    let steps = root
        .get("steps")
        .ok_or_else(|| BatonError::malformed("missing 'steps'"))?
        .as_array()
        .ok_or_else(|| BatonError::malformed("'steps' must be an array"))?;

    for (position, step) in steps.iter().enumerate() {
        let fields = step
            .as_object()
            .ok_or_else(|| BatonError::malformed(format!("step #{} is not an object", position)))?;

        let label = match fields.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => format!("#{}", position),
        };

        for field in REQUIRED_STEP_FIELDS {
            if fields.get(field).map_or(true, Value::is_null) {
                return Err(ValidationError::MissingField {
                    step: label,
                    field,
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Semantic checks on an already-typed workflow
pub fn validate(workflow: &Workflow) -> std::result::Result<(), ValidationError> {
    let max_parallel = workflow.max_parallel();
    if max_parallel == 0 {
        return Err(ValidationError::InvalidMaxParallel(max_parallel));
    }

    check_graph(&workflow.steps)?;

    let in_progress = workflow.in_progress_count();
    if in_progress > max_parallel {
        return Err(ValidationError::BudgetExceeded {
            in_progress,
            max_parallel,
        });
    }

    if let Some(step) = workflow
        .steps
        .iter()
        .find(|s| s.result.is_some() && s.status != StepStatus::Completed)
    {
        return Err(ValidationError::ResultWithoutCompletion(step.id.clone()));
    }

    Ok(())
}
