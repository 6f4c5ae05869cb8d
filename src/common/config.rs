// SPDX-License-Identifier: MIT

//! Coordinator configuration
//!
//! Values come from `BATON_*` environment variables (a `.env` file is loaded
//! by the binary first). Every value has a default; CLI flags override.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::error::{BatonError, Result};

pub const DEFAULT_WORKFLOW_PATH: &str = ".baton/workflow.json";
pub const DEFAULT_MAX_PARALLEL: usize = 3;
pub const DEFAULT_MAX_HANDOFF_ATTEMPTS: u32 = 3;
pub const DEFAULT_FALLBACK_AGENT: &str = "general-purpose";

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Path of the persisted workflow document
    pub workflow_path: PathBuf,
    /// Concurrency budget applied to plans that do not carry one
    pub max_parallel: usize,
    /// Malformed reports tolerated per handoff site before escalation
    pub max_handoff_attempts: u32,
    /// Actor invoked directly when a handoff escalates
    pub fallback_agent: String,
    pub lock_timeout: Duration,
    /// Locks older than this are considered abandoned
    pub stale_lock_after: Duration,
    /// In-progress steps older than this are reported by the sweep
    pub stale_step_after: Duration,
    /// Reload-and-retry attempts after a version conflict
    pub cas_retries: u32,
    pub archive_completed: bool,
    /// Replaces the built-in completion vocabulary when non-empty
    pub completion_phrases: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workflow_path: PathBuf::from(DEFAULT_WORKFLOW_PATH),
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_handoff_attempts: DEFAULT_MAX_HANDOFF_ATTEMPTS,
            fallback_agent: DEFAULT_FALLBACK_AGENT.to_string(),
            lock_timeout: Duration::from_millis(5000),
            stale_lock_after: Duration::from_secs(60),
            stale_step_after: Duration::from_secs(3600),
            cas_retries: 3,
            archive_completed: false,
            completion_phrases: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Build a config from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("BATON_WORKFLOW") {
            config.workflow_path = PathBuf::from(path);
        }
        if let Some(v) = parse_var::<usize>(&lookup, "BATON_MAX_PARALLEL")? {
            config.max_parallel = v;
        }
        if let Some(v) = parse_var::<u32>(&lookup, "BATON_MAX_HANDOFF_ATTEMPTS")? {
            config.max_handoff_attempts = v;
        }
        if let Some(agent) = lookup("BATON_FALLBACK_AGENT") {
            config.fallback_agent = agent;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "BATON_LOCK_TIMEOUT_MS")? {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "BATON_STALE_LOCK_SECS")? {
            config.stale_lock_after = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "BATON_STALE_STEP_SECS")? {
            config.stale_step_after = Duration::from_secs(secs);
        }
        if let Some(v) = parse_var::<u32>(&lookup, "BATON_CAS_RETRIES")? {
            config.cas_retries = v;
        }
        if let Some(v) = parse_var::<bool>(&lookup, "BATON_ARCHIVE_COMPLETED")? {
            config.archive_completed = v;
        }
        if let Some(raw) = lookup("BATON_COMPLETION_PHRASES") {
            config.completion_phrases = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(BatonError::config("max_parallel must be at least 1"));
        }
        if self.max_handoff_attempts == 0 {
            return Err(BatonError::config("max_handoff_attempts must be at least 1"));
        }
        if self.fallback_agent.trim().is_empty() {
            return Err(BatonError::config("fallback_agent must not be empty"));
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| BatonError::config(format!("{}='{}': {}", key, raw, e))),
    }
}
