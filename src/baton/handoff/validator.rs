// SPDX-License-Identifier: MIT

//! Lenient report matcher
//!
//! Grammar, applied to the whole report with arbitrary prose around it:
//!
//! ```text
//! complete := one of the completion phrases, case-insensitive
//! token    := "HANDOFF_TOKEN" ":" [A-Z0-9_]+
//! target   := "@" [A-Za-z0-9][A-Za-z0-9_-]*
//! handoff  := token and target, in any order
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

use crate::common::config::CoordinatorConfig;
use crate::common::error::{BatonError, Result};

/// Phrases that mean the producer finished and no routing is needed
pub const COMPLETION_PHRASES: &[&str] = &[
    "TASK COMPLETE",
    "TASK COMPLETED",
    "WORKFLOW COMPLETE",
    "ALL TASKS COMPLETE",
    "WORK COMPLETE",
    "NO HANDOFF NEEDED",
    "NO FURTHER HANDOFF",
];

static DEFAULT_COMPLETION: Lazy<Regex> = Lazy::new(|| {
    completion_regex(COMPLETION_PHRASES).expect("built-in completion phrases are valid")
});

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i:HANDOFF_TOKEN)\s*:\s*(\S+)").expect("valid token regex"));

static TOKEN_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9_]+$").expect("valid token charset regex"));

// Excludes e-mail addresses and `@@` by requiring a non-word boundary before `@`
static TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^\w.@])@([A-Za-z0-9][A-Za-z0-9_-]*)").expect("valid target regex")
});

/// Characters stripped from a token candidate before the charset check
const TOKEN_WRAPPERS: &[char] = &['`', '"', '\'', '*', '.', ',', ';', ':', ')', '(', '[', ']'];

/// Result of inspecting one report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Complete,
    Handoff { target: String, token: String },
    Malformed { reason: MalformedReason },
}

/// Why a report could not be routed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedReason {
    MissingToken,
    InvalidToken(String),
    MissingTarget,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::MissingToken => write!(f, "no HANDOFF_TOKEN line was found"),
            MalformedReason::InvalidToken(token) => write!(
                f,
                "token '{}' may only contain uppercase letters, digits and underscores",
                token
            ),
            MalformedReason::MissingTarget => write!(f, "no @agent-name target was found"),
        }
    }
}

impl Outcome {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Outcome::Malformed { .. })
    }
}

/// Classifies completion reports
#[derive(Debug, Clone)]
pub struct HandoffValidator {
    completion: Regex,
}

impl HandoffValidator {
    pub fn new() -> Self {
        Self {
            completion: DEFAULT_COMPLETION.clone(),
        }
    }

    /// Validator with a custom completion vocabulary
    pub fn with_phrases(phrases: &[&str]) -> Result<Self> {
        if phrases.is_empty() {
            return Err(BatonError::config("completion vocabulary must not be empty"));
        }
        let completion = completion_regex(phrases)
            .map_err(|e| BatonError::config(format!("invalid completion phrase: {}", e)))?;
        Ok(Self { completion })
    }

    /// Built-in vocabulary unless the config names its own phrases
    pub fn from_config(config: &CoordinatorConfig) -> Result<Self> {
        if config.completion_phrases.is_empty() {
            return Ok(Self::new());
        }
        let phrases: Vec<&str> = config.completion_phrases.iter().map(String::as_str).collect();
        Self::with_phrases(&phrases)
    }

    pub fn validate(&self, report: &str) -> Outcome {
        if self.completion.is_match(report) {
            return Outcome::Complete;
        }

        let token = match extract_token(report) {
            Ok(token) => token,
            Err(reason) => return Outcome::Malformed { reason },
        };

        match extract_target(report) {
            Some(target) => Outcome::Handoff { target, token },
            None => Outcome::Malformed {
                reason: MalformedReason::MissingTarget,
            },
        }
    }
}

impl Default for HandoffValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Build `\b(?:PHRASE|PHRASE)\b`, case-insensitive, any whitespace between words
fn completion_regex(phrases: &[&str]) -> std::result::Result<Regex, regex::Error> {
    let alternatives: Vec<String> = phrases
        .iter()
        .map(|phrase| {
            phrase
                .split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
}

fn extract_token(report: &str) -> std::result::Result<String, MalformedReason> {
    let raw = TOKEN
        .captures(report)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or(MalformedReason::MissingToken)?;

    let token = raw.trim_matches(TOKEN_WRAPPERS);
    if TOKEN_CHARS.is_match(token) {
        Ok(token.to_string())
    } else {
        Err(MalformedReason::InvalidToken(raw.to_string()))
    }
}

fn extract_target(report: &str) -> Option<String> {
    TARGET
        .captures(report)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches(['-', '_']).to_string())
}
