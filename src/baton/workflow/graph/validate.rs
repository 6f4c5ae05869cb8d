// SPDX-License-Identifier: MIT

//! Structural validation of the task graph

use std::collections::HashMap;

use crate::baton::workflow::types::{Step, StepId};
use crate::common::error::ValidationError;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Reject duplicate ids, dependencies on unknown steps and cycles
pub fn check_graph(steps: &[Step]) -> Result<(), ValidationError> {
    let mut index: HashMap<&StepId, &Step> = HashMap::new();
    for step in steps {
        if index.insert(&step.id, step).is_some() {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in steps {
        for dep in &step.depends_on {
            if !index.contains_key(dep) {
                return Err(ValidationError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut marks: HashMap<&StepId, Mark> = HashMap::new();
    let mut path: Vec<&StepId> = Vec::new();
    for step in steps {
        if !marks.contains_key(&step.id) {
            visit(&step.id, &index, &mut marks, &mut path)?;
        }
    }
    Ok(())
}

/// Depth-first walk along `depends_on`; a back edge to a node still on the
/// path closes a cycle, which is reported starting from that node.
fn visit<'a>(
    id: &'a StepId,
    index: &HashMap<&'a StepId, &'a Step>,
    marks: &mut HashMap<&'a StepId, Mark>,
    path: &mut Vec<&'a StepId>,
) -> Result<(), ValidationError> {
    marks.insert(id, Mark::Visiting);
    path.push(id);

    if let Some(step) = index.get(id).copied() {
        for dep in &step.depends_on {
            match marks.get(dep) {
                Some(Mark::Done) => {}
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| *p == dep).unwrap_or(0);
                    let mut cycle: Vec<StepId> =
                        path[start..].iter().map(|p| (*p).clone()).collect();
                    cycle.push(dep.clone());
                    return Err(ValidationError::CircularDependency(cycle));
                }
                None => visit(dep, index, marks, path)?,
            }
        }
    }

    path.pop();
    marks.insert(id, Mark::Done);
    Ok(())
}
