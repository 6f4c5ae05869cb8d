// SPDX-License-Identifier: MIT

//! Task graph policy
//!
//! This module provides the pieces that decide what may run:
//! - `DependencyResolver` - which pending steps have every prerequisite completed
//! - `ExecutionScheduler` - how many of those fit in the concurrency budget
//! - `StatusTransitioner` - the only place step status changes
//! - `check_graph` - structural validation (unique ids, known deps, no cycles)

mod resolver;
mod scheduler;
mod transition;
mod validate;

pub use resolver::DependencyResolver;
pub use scheduler::{ExecutionScheduler, SchedulePlan};
pub use transition::StatusTransitioner;
pub use validate::check_graph;
