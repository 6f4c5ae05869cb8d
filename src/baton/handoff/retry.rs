// SPDX-License-Identifier: MIT

//! Bounded retry and escalation per handoff site
//!
//! Each site moves FRESH -> RETRYING(1) -> ... -> ESCALATED on consecutive
//! malformed reports. Any well-formed outcome puts the site back to FRESH.
//! Once escalated, further malformed reports escalate again without retry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::validator::{MalformedReason, Outcome};
use crate::baton::workflow::types::StepId;

/// Identity of one handoff attempt: the reporting step and its agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandoffSite(String);

impl HandoffSite {
    pub fn new(step: &StepId, agent: &str) -> Self {
        Self(format!("{}:{}", step, agent))
    }

    /// Site with a caller-chosen key
    pub fn named(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandoffSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RetryState {
    #[default]
    Fresh,
    Retrying {
        attempts: u32,
    },
    Escalated {
        attempts: u32,
    },
}

impl RetryState {
    /// Malformed reports seen so far at this site
    pub fn attempts(&self) -> u32 {
        match self {
            RetryState::Fresh => 0,
            RetryState::Retrying { attempts } | RetryState::Escalated { attempts } => *attempts,
        }
    }
}

/// Persisted retry state, keyed by site. FRESH sites are not stored.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RetryLedger(BTreeMap<String, RetryState>);

impl RetryLedger {
    pub fn get(&self, site: &HandoffSite) -> RetryState {
        self.0.get(site.as_str()).copied().unwrap_or_default()
    }

    fn set(&mut self, site: &HandoffSite, state: RetryState) {
        match state {
            RetryState::Fresh => {
                self.0.remove(site.as_str());
            }
            other => {
                self.0.insert(site.as_str().to_string(), other);
            }
        }
    }

    /// Drop every site belonging to `step`, whichever agent reported there.
    /// Returns how many sites were removed.
    pub fn clear_step(&mut self, step: &StepId) -> usize {
        let prefix = format!("{}:", step);
        let before = self.0.len();
        self.0.retain(|key, _| !is_site_of(key, &prefix));
        before - self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RetryState)> {
        self.0.iter()
    }
}

/// `"1:coder"` belongs to step 1; `"1:b:coder"` belongs to step `1:b`
fn is_site_of(key: &str, step_prefix: &str) -> bool {
    key.strip_prefix(step_prefix).is_some_and(|agent| !agent.contains(':'))
}

/// What the host should do after a report was classified
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The report is trustworthy; the graph may progress
    Proceed,
    /// Replay `instruction` to the same producer
    Retry { attempt: u32, instruction: String },
    /// Stop retrying; invoke `fallback_agent` with `instruction`
    Escalate {
        attempts: u32,
        fallback_agent: String,
        instruction: String,
        explanation: String,
    },
}

pub struct RetryEscalationController {
    max_attempts: u32,
    fallback_agent: String,
}

impl RetryEscalationController {
    pub fn new(max_attempts: u32, fallback_agent: impl Into<String>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            fallback_agent: fallback_agent.into(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Apply one outcome to the site's state and decide what happens next
    pub fn record(
        &self,
        ledger: &mut RetryLedger,
        site: &HandoffSite,
        outcome: &Outcome,
    ) -> Decision {
        let reason = match outcome {
            Outcome::Complete | Outcome::Handoff { .. } => {
                if ledger.get(site) != RetryState::Fresh {
                    log::info!("Handoff site {} recovered, resetting retry state", site);
                }
                ledger.set(site, RetryState::Fresh);
                return Decision::Proceed;
            }
            Outcome::Malformed { reason } => reason,
        };

        let attempts = ledger.get(site).attempts() + 1;
        let already_escalated = matches!(ledger.get(site), RetryState::Escalated { .. });

        if already_escalated || attempts >= self.max_attempts {
            ledger.set(site, RetryState::Escalated { attempts });
            let explanation = format!(
                "Handoff site '{}' escalated after {} malformed report(s); last problem: {}. \
                 Fallback action: invoking '{}' directly instead of the structured handoff.",
                site, attempts, reason, self.fallback_agent
            );
            log::error!("{}", explanation);
            return Decision::Escalate {
                attempts,
                fallback_agent: self.fallback_agent.clone(),
                instruction: self.fallback_instruction(site, attempts, reason),
                explanation,
            };
        }

        ledger.set(site, RetryState::Retrying { attempts });
        log::warn!(
            "Malformed handoff at {} (attempt {}/{}): {}",
            site,
            attempts,
            self.max_attempts,
            reason
        );
        Decision::Retry {
            attempt: attempts,
            instruction: self.corrective_instruction(attempts, reason),
        }
    }

    /// Gets stricter with every attempt
    fn corrective_instruction(&self, attempt: u32, reason: &MalformedReason) -> String {
        match attempt {
            1 => format!(
                "Your report could not be routed: {}. End your report with a line \
                 `HANDOFF_TOKEN: <TOKEN>` and mention the next agent as `@agent-name`, \
                 or write TASK COMPLETE if no handoff is needed.",
                reason
            ),
            2 => format!(
                "Your report still could not be routed: {}. The token may only contain \
                 uppercase letters, digits and underscores. Finish your report with \
                 exactly these two lines:\n\nHANDOFF_TOKEN: NEXT_STEP_01\n@agent-name",
                reason
            ),
            n => format!(
                "Attempt {} of {}: {}. Reply with ONLY the two lines below, substituting \
                 your token and the next agent's name, and nothing else:\n\n\
                 HANDOFF_TOKEN: <UPPERCASE_TOKEN>\n@<next-agent>",
                n, self.max_attempts, reason
            ),
        }
    }

    fn fallback_instruction(
        &self,
        site: &HandoffSite,
        attempts: u32,
        reason: &MalformedReason,
    ) -> String {
        format!(
            "@{} The structured handoff from '{}' failed validation {} time(s) ({}). \
             Review the last report from that agent, decide which step should run next, \
             and continue the workflow directly.",
            self.fallback_agent, site, attempts, reason
        )
    }
}
