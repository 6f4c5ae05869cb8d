// SPDX-License-Identifier: MIT

//! Handoff validation for free-text completion reports
//!
//! A report either says the work is finished, names the next actor with a
//! structured token, or is malformed:
//! - `TASK COMPLETE` (and similar phrases) -> `Outcome::Complete`
//! - `HANDOFF_TOKEN: AB12_X` plus `@writer-agent` -> `Outcome::Handoff`
//! - anything else -> `Outcome::Malformed`, retried then escalated per site

mod retry;
mod validator;

pub use retry::{Decision, HandoffSite, RetryEscalationController, RetryLedger, RetryState};
pub use validator::{HandoffValidator, MalformedReason, Outcome};
