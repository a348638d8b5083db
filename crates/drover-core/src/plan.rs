//! Plan input types and the structural validator.
//!
//! A plan arrives as JSON: a plan id, optional repo defaults, and a
//! non-empty list of subtasks whose `dependsOn` edges must form a DAG.
//! Validation is pure -- it never touches the store -- and rejection names
//! the offending path. Unknown fields are ignored.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Deserialize;
use thiserror::Error;

/// Default upper bound on a subtask prompt, in characters.
pub const DEFAULT_MAX_PROMPT_CHARS: usize = 20_000;

/// Top-level plan input.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanInput {
    /// Stable, caller-supplied plan id. `id` is accepted as an alias.
    #[serde(default, alias = "id")]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Logical repo name, copied onto every subtask row.
    #[serde(default)]
    pub repo: Option<String>,
    /// Default repository path; subtasks may override.
    #[serde(default)]
    pub repo_path: Option<String>,
    #[serde(default)]
    pub subtasks: Vec<SubtaskInput>,
}

/// One subtask of a plan.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    /// Opaque routing tag; dispatch happens at the runner boundary.
    #[serde(default)]
    pub routing: Option<String>,
    #[serde(default)]
    pub repo_path: Option<String>,
    /// Ids of subtasks (declared in the same plan) this one depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Errors produced by [`validate_plan`]. Each names the offending path.
#[derive(Debug, Error)]
pub enum PlanValidationError {
    #[error("planId is required")]
    MissingPlanId,

    #[error("subtasks must be a non-empty list")]
    NoSubtasks,

    #[error("subtasks[{index}].id is required")]
    MissingSubtaskId { index: usize },

    #[error("duplicate subtask id: {0:?}")]
    DuplicateSubtaskId(String),

    #[error("subtasks[{index}].routing must be a non-empty string when provided")]
    EmptyRouting { index: usize },

    #[error("subtasks[{index}].prompt is required")]
    MissingPrompt { index: usize },

    #[error("subtasks[{index}].prompt too long: {len} > {max}")]
    PromptTooLong { index: usize, len: usize, max: usize },

    #[error("subtasks[{index}].dependsOn contains an empty id")]
    EmptyDependency { index: usize },

    #[error("subtask {task:?} dependsOn unknown id: {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving subtasks: {0}")]
    CycleDetected(String),
}

/// Validate a plan's structure and its dependency graph.
///
/// Accepts iff: the plan id is a non-empty string, `subtasks` is non-empty,
/// subtask ids are present and unique, prompts are present and at most
/// `max_prompt_chars` characters, routing (when present) is non-empty,
/// every `dependsOn` entry names a subtask declared in the same plan, and
/// the dependency graph is acyclic.
pub fn validate_plan(
    plan: &PlanInput,
    max_prompt_chars: usize,
) -> Result<(), PlanValidationError> {
    let plan_id = plan.plan_id.as_deref().unwrap_or("");
    if plan_id.trim().is_empty() {
        return Err(PlanValidationError::MissingPlanId);
    }

    if plan.subtasks.is_empty() {
        return Err(PlanValidationError::NoSubtasks);
    }

    let mut ids: HashSet<&str> = HashSet::new();
    let mut edges: Vec<(&str, &str)> = Vec::new();

    for (index, subtask) in plan.subtasks.iter().enumerate() {
        let id = subtask.id.as_deref().unwrap_or("");
        if id.trim().is_empty() {
            return Err(PlanValidationError::MissingSubtaskId { index });
        }
        if !ids.insert(id) {
            return Err(PlanValidationError::DuplicateSubtaskId(id.to_owned()));
        }

        if let Some(routing) = subtask.routing.as_deref() {
            if routing.trim().is_empty() {
                return Err(PlanValidationError::EmptyRouting { index });
            }
        }

        let prompt = subtask.prompt.as_deref().unwrap_or("");
        if prompt.trim().is_empty() {
            return Err(PlanValidationError::MissingPrompt { index });
        }
        let len = prompt.chars().count();
        if len > max_prompt_chars {
            return Err(PlanValidationError::PromptTooLong {
                index,
                len,
                max: max_prompt_chars,
            });
        }

        for dep in &subtask.depends_on {
            if dep.trim().is_empty() {
                return Err(PlanValidationError::EmptyDependency { index });
            }
            edges.push((id, dep.as_str()));
        }
    }

    // Every dependsOn must reference a subtask declared in this plan.
    for (task, dep) in &edges {
        if !ids.contains(dep) {
            return Err(PlanValidationError::UnknownDependency {
                task: (*task).to_owned(),
                dependency: (*dep).to_owned(),
            });
        }
    }

    check_for_cycles(&ids, &edges)
}

/// Detect dependency cycles using Kahn's algorithm for topological sort.
///
/// Edges are `(task, depends_on)`; the forward graph used for the sort runs
/// `depends_on -> task`. If the topological count differs from the node
/// count, the remainder is a cycle.
fn check_for_cycles(
    ids: &HashSet<&str>,
    edges: &[(&str, &str)],
) -> Result<(), PlanValidationError> {
    let mut in_degree: HashMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
    let mut forward: HashMap<&str, Vec<&str>> = ids.iter().map(|id| (*id, vec![])).collect();

    for &(task, dep) in edges {
        forward
            .get_mut(dep)
            .expect("edge endpoints checked above")
            .push(task);
        *in_degree
            .get_mut(task)
            .expect("edge endpoints checked above") += 1;
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut sorted_count = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted_count += 1;
        for &next in &forward[node] {
            let deg = in_degree
                .get_mut(next)
                .expect("edge endpoints checked above");
            *deg -= 1;
            if *deg == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted_count != ids.len() {
        let mut cycle: Vec<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg > 0)
            .map(|(id, _)| *id)
            .collect();
        cycle.sort_unstable();
        return Err(PlanValidationError::CycleDetected(cycle.join(", ")));
    }

    Ok(())
}
