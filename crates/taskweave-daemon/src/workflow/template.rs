//! `{{...}}` placeholder substitution.
//!
//! Lookup order for a placeholder `{{name}}`:
//!
//! 1. `steps.<id>.output`, `steps.<id>.status`, `steps.<id>.error`
//! 2. the run's input variables
//! 3. the environment snapshot, as `env.<KEY>` or a bare `<KEY>`
//!
//! Anything unresolved becomes the empty string.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::run::StepRunResult;

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^}]+)\}\}").expect("static regex is valid"));

/// The parts of a finished step that templates can read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSnapshot {
    pub output: String,
    pub status: String,
    pub error: String,
}

/// Variables visible to templates during one run.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    input: BTreeMap<String, String>,
    steps: HashMap<String, StepSnapshot>,
    env: HashMap<String, String>,
}

impl TemplateContext {
    pub fn new(input: BTreeMap<String, String>, env: HashMap<String, String>) -> Self {
        Self {
            input,
            steps: HashMap::new(),
            env,
        }
    }

    pub const fn input(&self) -> &BTreeMap<String, String> {
        &self.input
    }

    /// Make a finished step's result visible to later templates.
    pub fn record(&mut self, result: &StepRunResult) {
        self.steps.insert(
            result.step_id.clone(),
            StepSnapshot {
                output: result.output.clone(),
                status: result.status.to_string(),
                error: result.error.clone(),
            },
        );
    }

    /// Resolve one placeholder expression (the text between the braces).
    pub fn lookup(&self, expr: &str) -> Option<&str> {
        if let Some(rest) = expr.strip_prefix("steps.") {
            let (id, field) = rest.split_once('.')?;
            let step = self.steps.get(id)?;
            return match field {
                "output" => Some(&step.output),
                "status" => Some(&step.status),
                "error" => Some(&step.error),
                _ => None,
            };
        }
        if let Some(value) = self.input.get(expr) {
            return Some(value);
        }
        let key = expr.strip_prefix("env.").unwrap_or(expr);
        self.env.get(key).map(String::as_str)
    }

    /// Substitute every placeholder in `template`.
    pub fn resolve(&self, template: &str) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &Captures<'_>| {
                self.lookup(caps[1].trim()).unwrap_or_default().to_string()
            })
            .into_owned()
    }

    /// Placeholders in `template` that would resolve to nothing.
    pub fn unresolved(&self, template: &str) -> Vec<String> {
        PLACEHOLDER
            .captures_iter(template)
            .map(|caps| caps[1].trim().to_string())
            .filter(|expr| self.lookup(expr).is_none())
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::workflow::run::StepStatus;

    fn ctx() -> TemplateContext {
        let input = BTreeMap::from([
            ("repo".to_string(), "x".to_string()),
            ("branch".to_string(), "main".to_string()),
        ]);
        let env = HashMap::from([("HOME".to_string(), "/home/agent".to_string())]);
        TemplateContext::new(input, env)
    }

    #[test]
    fn resolves_input_variables() {
        assert_eq!(ctx().resolve("Clone {{repo}} on {{branch}}"), "Clone x on main");
    }

    #[test]
    fn tolerates_inner_whitespace() {
        assert_eq!(ctx().resolve("{{ repo }}"), "x");
    }

    #[test]
    fn unresolved_placeholder_becomes_empty() {
        // Lenient on purpose: a typo in a rarely-hit branch must not abort the run.
        let c = ctx();
        assert_eq!(c.resolve("[{{nope}}]"), "[]");
        assert_eq!(c.resolve("[{{steps.ghost.output}}]"), "[]");
        assert_eq!(c.unresolved("{{repo}} {{nope}}"), vec!["nope"]);
    }

    #[test]
    fn resolves_step_fields() {
        let mut c = ctx();
        c.record(&StepRunResult {
            step_id: "build".into(),
            status: StepStatus::Error,
            output: "log".into(),
            error: "exit 2".into(),
            ..StepRunResult::default()
        });
        assert_eq!(
            c.resolve("{{steps.build.status}}: {{steps.build.error}} ({{steps.build.output}})"),
            "error: exit 2 (log)"
        );
        assert_eq!(c.resolve("{{steps.build.bogus}}"), "");
    }

    #[test]
    fn input_shadows_environment() {
        let mut c = ctx();
        assert_eq!(c.resolve("{{env.HOME}}|{{HOME}}"), "/home/agent|/home/agent");
        c.input.insert("HOME".into(), "override".into());
        assert_eq!(c.resolve("{{env.HOME}}|{{HOME}}"), "/home/agent|override");
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        assert_eq!(ctx().resolve("plain { text }"), "plain { text }");
    }
}
