// SPDX-License-Identifier: MIT

//! Typed error handling for baton-rs
//!
//! `BatonError` is the crate-level error. Document problems surface as
//! `ValidationError`, illegal status changes as `TransitionError`.

use std::path::PathBuf;
use thiserror::Error;

use crate::baton::workflow::types::{StepId, StepStatus};

pub type Result<T> = std::result::Result<T, BatonError>;

/// Top-level error type for baton-rs
#[derive(Debug, Error)]
pub enum BatonError {
    /// The workflow document is malformed and must be corrected by hand
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// An illegal status change was requested; the document is unchanged
    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    /// Another process saved the document between our load and save
    #[error("Concurrent modification: expected version {expected}, found {found}")]
    ConcurrentModification { expected: u64, found: u64 },

    /// The document lock could not be acquired in time
    #[error("Timed out after {waited_ms}ms waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    /// No workflow document at the configured path
    #[error("Workflow document not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Configuration errors (invalid env vars, bad flags)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

/// Problems with the shape or content of a workflow document
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Malformed document: {0}")]
    Malformed(String),

    /// `step` is the step id when known, otherwise its position in `steps`
    #[error("Step {step} is missing required field '{field}'")]
    MissingField { step: String, field: &'static str },

    #[error("Duplicate step id: {0}")]
    DuplicateStepId(StepId),

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("Circular dependency detected: {0:?}")]
    CircularDependency(Vec<StepId>),

    #[error("max_parallel must be at least 1, got {0}")]
    InvalidMaxParallel(usize),

    #[error("{in_progress} steps in progress exceeds max_parallel {max_parallel}")]
    BudgetExceeded {
        in_progress: usize,
        max_parallel: usize,
    },

    #[error("Step {0} carries a result but is not completed")]
    ResultWithoutCompletion(StepId),
}

/// Illegal status changes
#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("Unknown step: {0}")]
    UnknownStep(StepId),

    #[error("Step {0} is already completed")]
    AlreadyCompleted(StepId),

    #[error("Step {step} cannot start from status {status}")]
    NotPending { step: StepId, status: StepStatus },

    #[error("Step {step} has unmet dependencies: {pending:?}")]
    DependenciesUnmet { step: StepId, pending: Vec<StepId> },

    #[error("No capacity left: {max_parallel} steps already in progress")]
    BudgetExhausted { max_parallel: usize },

    #[error("Workflow is already completed")]
    WorkflowCompleted,

    #[error("No pending or in-progress step is assigned to agent '{0}'")]
    NoActiveStepForAgent(String),
}

impl BatonError {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a malformed-document error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::Malformed(message.into()))
    }

    /// Create from a generic message
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Whether the caller should reload and retry the whole operation
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

impl From<&str> for BatonError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}

impl From<String> for BatonError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}
