//! Workflow validation.
//!
//! [`validate`] checks a [`WorkflowDoc`] and, when it is sound, converts it
//! into a typed [`Workflow`]. Every violation is collected so the author sees
//! the complete list at once; nothing is partially applied.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use taskweave_core::duration::parse_duration;

use super::graph::{StepNode, find_cycle};
use super::model::{
    ConditionStep, DEFAULT_RETRY_DELAY, DEFAULT_RETRY_MAX, DispatchStep, OnError, ParallelStep,
    SkillStep, Step, StepDoc, StepKind, Workflow, WorkflowDoc,
};

#[allow(clippy::expect_used)]
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]*$").expect("static regex is valid")
});

/// Every violation found in a workflow document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .0.join("; "))]
pub struct ValidationErrors(Vec<String>);

impl ValidationErrors {
    pub fn messages(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether any message contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.0.iter().any(|m| m.contains(needle))
    }
}

/// Workflow names double as file names, so they are restricted to
/// `^[a-zA-Z0-9][a-zA-Z0-9_-]*$`.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

#[derive(Debug, Clone, Copy)]
enum StepType {
    Dispatch,
    Skill,
    Condition,
    Parallel,
}

fn parse_type(raw: Option<&str>) -> Option<StepType> {
    match raw.unwrap_or_default() {
        "" | "dispatch" => Some(StepType::Dispatch),
        "skill" => Some(StepType::Skill),
        "condition" => Some(StepType::Condition),
        "parallel" => Some(StepType::Parallel),
        _ => None,
    }
}

/// Validate `doc` and build the runnable form.
pub fn validate(doc: &WorkflowDoc) -> Result<Workflow, ValidationErrors> {
    let mut errs = Vec::new();

    if doc.name.is_empty() {
        errs.push("workflow name is required".to_string());
    } else if !is_valid_name(&doc.name) {
        errs.push(format!(
            "invalid workflow name {:?}: use alphanumeric, hyphens, underscores",
            doc.name
        ));
    }
    if doc.steps.is_empty() {
        errs.push("workflow must have at least one step".to_string());
    }
    let timeout = doc
        .timeout
        .as_deref()
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| match parse_duration(raw) {
            Ok(d) => Some(d),
            Err(e) => {
                errs.push(format!("invalid timeout {raw:?}: {e}"));
                None
            }
        });

    let mut seen = HashSet::new();
    check_ids(&doc.steps, &mut seen, &mut errs);

    let top_ids: HashSet<&str> = doc
        .steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| !id.is_empty())
        .collect();

    let steps: Vec<Step> = doc
        .steps
        .iter()
        .filter_map(|s| build_step(s, &top_ids, false, &mut errs))
        .collect();

    if let Some(cycle) = find_cycle(&doc_nodes(&doc.steps)) {
        errs.push(format!("dependency cycle detected: {}", cycle.join(" -> ")));
    }

    if errs.is_empty() {
        Ok(Workflow {
            name: doc.name.clone(),
            description: doc.description.clone(),
            steps,
            variables: doc.variables.clone(),
            timeout,
        })
    } else {
        Err(ValidationErrors(errs))
    }
}

fn check_ids<'a>(steps: &'a [StepDoc], seen: &mut HashSet<&'a str>, errs: &mut Vec<String>) {
    for step in steps {
        if step.id.is_empty() {
            errs.push("step ID is required".to_string());
        } else if !seen.insert(step.id.as_str()) {
            errs.push(format!("duplicate step ID {:?}", step.id));
        }
        check_ids(&step.parallel, seen, errs);
    }
}

/// Dependency edges plus the implicit edge from a condition to each branch target.
fn doc_nodes(steps: &[StepDoc]) -> Vec<StepNode> {
    let mut nodes: Vec<StepNode> = steps
        .iter()
        .map(|s| StepNode::new(s.id.clone(), s.depends_on.iter().cloned()))
        .collect();

    for step in steps {
        if !matches!(parse_type(step.step_type.as_deref()), Some(StepType::Condition)) {
            continue;
        }
        for target in step.then.iter().chain(step.else_step.iter()) {
            if *target == step.id {
                continue;
            }
            if let Some(node) = nodes.iter_mut().find(|n| n.id == *target) {
                node.deps.push(step.id.clone());
            }
        }
    }
    nodes
}

fn parse_step_duration(
    step: &StepDoc,
    field: &str,
    raw: Option<&str>,
    errs: &mut Vec<String>,
) -> Option<Duration> {
    let raw = raw.filter(|r| !r.trim().is_empty())?;
    match parse_duration(raw) {
        Ok(d) => Some(d),
        Err(_) => {
            errs.push(format!("step {:?}: invalid {field} {raw:?}", step.id));
            None
        }
    }
}

fn build_step(
    doc: &StepDoc,
    ids: &HashSet<&str>,
    nested: bool,
    errs: &mut Vec<String>,
) -> Option<Step> {
    let before = errs.len();
    let id = &doc.id;

    let timeout = parse_step_duration(doc, "timeout", doc.timeout.as_deref(), errs);
    let retry_delay = parse_step_duration(doc, "retryDelay", doc.retry_delay.as_deref(), errs)
        .unwrap_or(DEFAULT_RETRY_DELAY);

    let on_error = match doc.on_error.as_deref().unwrap_or_default() {
        "" | "stop" => OnError::Stop,
        "skip" => OnError::Skip,
        "retry" => OnError::Retry {
            max: doc.retry_max.unwrap_or(DEFAULT_RETRY_MAX),
        },
        other => {
            errs.push(format!("step {id:?}: invalid onError {other:?} (use stop, skip, retry)"));
            OnError::Stop
        }
    };

    if nested && !doc.depends_on.is_empty() {
        errs.push(format!("step {id:?}: parallel sub-steps cannot declare dependsOn"));
    } else {
        for dep in &doc.depends_on {
            if dep == id {
                errs.push(format!("step {id:?}: step cannot depend on itself"));
            } else if !ids.contains(dep.as_str()) {
                errs.push(format!("step {id:?}: dependsOn references unknown step {dep:?}"));
            }
        }
    }

    let kind = match parse_type(doc.step_type.as_deref()) {
        Some(StepType::Dispatch) => match doc.prompt.as_deref().filter(|p| !p.is_empty()) {
            Some(prompt) => Some(StepKind::Dispatch(DispatchStep {
                agent: doc.agent.clone().unwrap_or_default(),
                prompt: prompt.to_string(),
                model: doc.model.clone().filter(|m| !m.is_empty()),
                timeout,
                budget: doc.budget.filter(|b| *b > 0.0),
            })),
            None => {
                errs.push(format!("step {id:?}: dispatch step requires a prompt"));
                None
            }
        },
        Some(StepType::Skill) => match doc.skill.as_deref().filter(|s| !s.is_empty()) {
            Some(skill) => Some(StepKind::Skill(SkillStep {
                skill: skill.to_string(),
                args: doc.args.clone(),
            })),
            None => {
                errs.push(format!("step {id:?}: skill step requires a skill name"));
                None
            }
        },
        Some(StepType::Condition) => build_condition(doc, ids, nested, errs),
        Some(StepType::Parallel) => {
            if doc.parallel.is_empty() {
                errs.push(format!("step {id:?}: parallel step requires sub-steps"));
            }
            let steps: Vec<Step> = doc
                .parallel
                .iter()
                .filter_map(|sub| build_step(sub, ids, true, errs))
                .collect();
            Some(StepKind::Parallel(ParallelStep {
                steps,
                fail_fast: doc.fail_fast,
            }))
        }
        None => {
            errs.push(format!(
                "step {id:?}: unknown type {:?} (use dispatch, skill, condition, parallel)",
                doc.step_type.as_deref().unwrap_or_default()
            ));
            None
        }
    };

    if errs.len() > before {
        return None;
    }
    kind.map(|kind| Step {
        id: id.clone(),
        depends_on: doc.depends_on.clone(),
        on_error,
        retry_delay,
        kind,
    })
}

fn build_condition(
    doc: &StepDoc,
    ids: &HashSet<&str>,
    nested: bool,
    errs: &mut Vec<String>,
) -> Option<StepKind> {
    let id = &doc.id;
    let before = errs.len();

    if nested {
        errs.push(format!("step {id:?}: condition steps cannot run inside a parallel block"));
    }
    let expr = doc.if_expr.as_deref().filter(|e| !e.trim().is_empty());
    if expr.is_none() {
        errs.push(format!("step {id:?}: condition step requires an 'if' expression"));
    }
    let then_step = doc.then.as_deref().filter(|t| !t.is_empty());
    if then_step.is_none() {
        errs.push(format!("step {id:?}: condition step requires a 'then' target"));
    }
    let else_step = doc.else_step.as_deref().filter(|e| !e.is_empty());

    for (field, target) in [("then", then_step), ("else", else_step)] {
        let Some(target) = target else { continue };
        if target == id {
            errs.push(format!("step {id:?}: '{field}' cannot target the condition itself"));
        } else if !ids.contains(target) {
            errs.push(format!("step {id:?}: '{field}' references unknown step {target:?}"));
        }
    }

    if errs.len() > before {
        return None;
    }
    Some(StepKind::Condition(ConditionStep {
        expr: expr?.to_string(),
        then_step: then_step?.to_string(),
        else_step: else_step.map(str::to_string),
    }))
}
