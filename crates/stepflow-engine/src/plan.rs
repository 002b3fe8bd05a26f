//! Validation and dependency ordering of workflow definitions.
//!
//! Ordering uses Kahn's algorithm. Among steps that are ready at the same
//! time, the one declared first in the definition goes first, so the same
//! definition always yields the same order.
//!
//! `parallel` blocks own the steps they list. An owned step is never
//! dispatched on its own; its block runs it. To keep the join-before-continue
//! guarantee, the block inherits every dependency of its sub-steps, and any
//! step outside the block that depends on a sub-step also depends on the block.

use std::collections::{BTreeSet, HashMap, HashSet};

use stepflow_core::definition::{StepDefinition, StepKind, WorkflowDefinition};
use stepflow_core::error::{Result, StepflowError};

/// Derived, read-only execution order for one definition.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Every step id, each after all of its dependencies.
    pub ordered_step_ids: Vec<String>,
    pub steps_by_id: HashMap<String, StepDefinition>,
    /// Sub-step id to the `parallel` step that owns it.
    owners: HashMap<String, String>,
}

impl ExecutionPlan {
    /// Validate `definition` and compute its order.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self> {
        let steps = &definition.steps;
        if steps.is_empty() {
            return Err(StepflowError::Validation("workflow has no steps".into()));
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            validate_step_shape(step)?;
            if index.insert(step.id.as_str(), i).is_some() {
                return Err(StepflowError::Validation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        for step in steps {
            for dep in &step.depends_on {
                if !index.contains_key(dep.as_str()) {
                    return Err(StepflowError::Validation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        let owners = parallel_owners(steps, &index)?;

        // Effective dependencies, as indices.
        let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            let own_block = owners.get(step.id.as_str());
            for dep in &step.depends_on {
                let dep_block = owners.get(dep.as_str());
                if own_block.is_some() && own_block == dep_block {
                    return Err(StepflowError::Validation(format!(
                        "step '{}' depends on sibling '{}' inside parallel block '{}'",
                        step.id,
                        dep,
                        own_block.copied().unwrap_or_default()
                    )));
                }
                deps[i].insert(index[dep.as_str()]);
                if let Some(block) = dep_block {
                    deps[i].insert(index[*block]);
                }
            }
            if let StepKind::Parallel(parallel) = &step.kind {
                for sub_id in &parallel.steps {
                    let sub = index[sub_id.as_str()];
                    deps[i].insert(sub);
                    for sub_dep in &steps[sub].depends_on {
                        deps[i].insert(index[sub_dep.as_str()]);
                    }
                }
            }
        }
        // A block listed as its own dependency shows up as a cycle below.

        let order = topological_order(steps, &deps)?;

        Ok(Self {
            ordered_step_ids: order.into_iter().map(|i| steps[i].id.clone()).collect(),
            steps_by_id: steps.iter().map(|s| (s.id.clone(), s.clone())).collect(),
            owners: owners
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps_by_id.get(id)
    }

    /// The `parallel` block that runs `step_id`, if any.
    pub fn owner_of(&self, step_id: &str) -> Option<&str> {
        self.owners.get(step_id).map(String::as_str)
    }

    /// Steps the coordinator dispatches itself, in order.
    pub fn top_level_steps(&self) -> Vec<&StepDefinition> {
        self.ordered_step_ids
            .iter()
            .filter(|id| !self.owners.contains_key(id.as_str()))
            .filter_map(|id| self.steps_by_id.get(id))
            .collect()
    }

    /// Total number of steps, including parallel sub-steps.
    pub fn len(&self) -> usize {
        self.ordered_step_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered_step_ids.is_empty()
    }
}

fn validate_step_shape(step: &StepDefinition) -> Result<()> {
    if step.id.trim().is_empty() {
        return Err(StepflowError::Validation("step id must not be empty".into()));
    }
    // Ids are addressed as path segments in `${...}` references.
    if step.id.contains(['.', '{', '}', '$']) || step.id.chars().any(char::is_whitespace) {
        return Err(StepflowError::Validation(format!(
            "step id '{}' may not contain '.', '$', braces, or whitespace",
            step.id
        )));
    }
    match &step.kind {
        StepKind::AgentCall(call) => {
            if call.agent_id.trim().is_empty() || call.method_id.trim().is_empty() {
                return Err(StepflowError::Validation(format!(
                    "agent_call step '{}' requires agent_id and method_id",
                    step.id
                )));
            }
            if call.timeout_secs == Some(0) {
                return Err(StepflowError::Validation(format!(
                    "agent_call step '{}' has a zero timeout",
                    step.id
                )));
            }
        }
        StepKind::Switch(switch) => {
            let mut seen = HashSet::new();
            for case in &switch.cases {
                if !seen.insert(case.case_id.as_str()) {
                    return Err(StepflowError::Validation(format!(
                        "switch step '{}' has duplicate case '{}'",
                        step.id, case.case_id
                    )));
                }
            }
        }
        StepKind::Condition(_) | StepKind::Parallel(_) => {}
    }
    Ok(())
}

/// Map each parallel sub-step to its block, checking membership rules.
fn parallel_owners<'a>(
    steps: &'a [StepDefinition],
    index: &HashMap<&str, usize>,
) -> Result<HashMap<&'a str, &'a str>> {
    let mut owners: HashMap<&str, &str> = HashMap::new();
    for step in steps {
        let StepKind::Parallel(parallel) = &step.kind else {
            continue;
        };
        for sub_id in &parallel.steps {
            let Some(&sub) = index.get(sub_id.as_str()) else {
                return Err(StepflowError::Validation(format!(
                    "parallel step '{}' references unknown step '{}'",
                    step.id, sub_id
                )));
            };
            if sub_id == &step.id {
                return Err(StepflowError::Validation(format!(
                    "parallel step '{}' lists itself",
                    step.id
                )));
            }
            if !matches!(steps[sub].kind, StepKind::AgentCall(_)) {
                return Err(StepflowError::Validation(format!(
                    "parallel step '{}' may only run agent_call steps; '{}' is {}",
                    step.id,
                    sub_id,
                    steps[sub].kind_name()
                )));
            }
            if let Some(other) = owners.insert(steps[sub].id.as_str(), step.id.as_str()) {
                let reason = if other == step.id {
                    "twice in the same block".to_string()
                } else {
                    format!("in both '{}' and '{}'", other, step.id)
                };
                return Err(StepflowError::Validation(format!(
                    "step '{}' is listed {}",
                    sub_id, reason
                )));
            }
        }
    }
    Ok(owners)
}

/// Kahn's algorithm with definition-order tie-break.
fn topological_order(steps: &[StepDefinition], deps: &[BTreeSet<usize>]) -> Result<Vec<usize>> {
    let n = steps.len();
    let mut in_degree: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
    let mut dependants: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, ds) in deps.iter().enumerate() {
        for &d in ds {
            dependants[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependant in &dependants[next] {
            in_degree[dependant] -= 1;
            if in_degree[dependant] == 0 {
                ready.insert(dependant);
            }
        }
    }

    if order.len() < n {
        let members = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| steps[i].id.clone())
            .collect();
        return Err(StepflowError::DependencyCycle { steps: members });
    }
    Ok(order)
}
