//! Workflow documents and their validated, typed form.
//!
//! [`WorkflowDoc`] is the on-disk JSON shape and round-trips exactly.
//! [`Workflow`] is what the engine runs: produced only by
//! [`validate`](super::validate::validate), with every step parsed into a
//! [`StepKind`] variant carrying just the fields that variant uses.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::graph::{StepNode, topological_order};

/// Default delay between retry attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Extra attempts granted by `onError: retry` when `retryMax` is unset.
pub const DEFAULT_RETRY_MAX: u32 = 1;

/// A workflow as authored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDoc {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<StepDoc>,
    /// Input variables with their default values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    /// Bound on the whole run, e.g. `"30m"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// One step as authored. Which fields apply depends on `type`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDoc {
    pub id: String,
    /// `dispatch` (default), `skill`, `condition` or `parallel`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<String>,
    #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
    pub else_step: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel: Vec<StepDoc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fail_fast: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,

    /// `stop` (default), `skip` or `retry`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<String>,
}

impl WorkflowDoc {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// A validated workflow, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub name: String,
    pub description: String,
    pub steps: Vec<Step>,
    pub variables: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl Workflow {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Scheduling graph: declared dependencies, plus an edge from each
    /// condition to its branch targets so a target never starts before the
    /// branch is decided.
    pub fn execution_nodes(&self) -> Vec<StepNode> {
        let mut nodes: Vec<StepNode> = self
            .steps
            .iter()
            .map(|s| StepNode::new(s.id.clone(), s.depends_on.iter().cloned()))
            .collect();

        for step in &self.steps {
            let StepKind::Condition(cond) = &step.kind else {
                continue;
            };
            for target in std::iter::once(&cond.then_step).chain(cond.else_step.as_ref()) {
                if let Some(node) = nodes.iter_mut().find(|n| n.id == *target) {
                    node.deps.push(step.id.clone());
                }
            }
        }
        nodes
    }

    /// Steps in the order a sequential run would start them.
    pub fn execution_order(&self) -> Vec<String> {
        // Validation rejects cycles, so every step is ordered.
        topological_order(&self.execution_nodes()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub id: String,
    pub depends_on: Vec<String>,
    pub on_error: OnError,
    pub retry_delay: Duration,
    pub kind: StepKind,
}

impl Step {
    /// Total attempts allowed, counting the first.
    pub const fn max_attempts(&self) -> u32 {
        match self.on_error {
            OnError::Retry { max } => max.saturating_add(1),
            OnError::Stop | OnError::Skip => 1,
        }
    }
}

/// What a failed step does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    /// Abort the run; remaining steps are skipped.
    #[default]
    Stop,
    /// Record the step as skipped and let dependents proceed.
    Skip,
    /// Rerun up to `max` more times, then behave like `Stop`.
    Retry { max: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Dispatch(DispatchStep),
    Skill(SkillStep),
    Condition(ConditionStep),
    Parallel(ParallelStep),
}

impl StepKind {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Dispatch(_) => "dispatch",
            Self::Skill(_) => "skill",
            Self::Condition(_) => "condition",
            Self::Parallel(_) => "parallel",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchStep {
    /// Agent role; empty uses the executor default.
    pub agent: String,
    pub prompt: String,
    pub model: Option<String>,
    pub timeout: Option<Duration>,
    pub budget: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillStep {
    pub skill: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionStep {
    pub expr: String,
    pub then_step: String,
    pub else_step: Option<String>,
}

impl ConditionStep {
    /// Branch targets that were not chosen when `chosen` is the selected one.
    pub fn unchosen<'a>(&'a self, chosen: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        std::iter::once(self.then_step.as_str())
            .chain(self.else_step.as_deref())
            .filter(move |target| *target != chosen)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParallelStep {
    pub steps: Vec<Step>,
    /// Cancel remaining siblings after the first failure.
    pub fail_fast: bool,
}
