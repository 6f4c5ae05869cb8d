// SPDX-License-Identifier: MIT

pub mod coordinator;
pub mod handoff;
pub mod workflow;
