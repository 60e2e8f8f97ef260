//! Workflow execution.
//!
//! [`WorkflowEngine::execute`] drives a validated [`Workflow`]: steps start as
//! soon as every dependency has finished, each on its own task behind
//! [`catch_panic`], and results feed the template context for later steps.
//!
//! Failure handling per step (`onError`):
//!
//! - `stop` (default): the run aborts; steps not yet started are skipped.
//! - `skip`: the failure is recorded as `skipped` and dependents proceed.
//! - `retry`: up to `retryMax` more attempts, `retryDelay` apart, then `stop`.
//!
//! Condition steps choose one branch target; the other target is skipped, and
//! so is any step whose dependencies all sit on untaken branches.
//!
//! Parallel steps run their sub-steps concurrently and always collect every
//! result. With `failFast` the first failure cancels the siblings' shared
//! token; siblings still report, typically as `cancelled`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskweave_core::db::unix_timestamp;

use crate::orchestration::guard::catch_panic;
use crate::orchestration::{DispatchError, Dispatcher, LimiterError, Task, TaskResult};

use super::condition;
use super::graph::StepScheduler;
use super::model::{
    DispatchStep, OnError, ParallelStep, SkillStep, Step, StepKind, Workflow, WorkflowDoc,
};
use super::run::{RunMode, RunStatus, StepRunResult, StepStatus, WorkflowRun};
use super::template::TemplateContext;
use super::validate::{ValidationErrors, validate};

const PARALLEL_SEPARATOR: &str = "\n---\n";

/// Runs named skills for `skill` steps.
#[async_trait]
pub trait SkillRunner: Send + Sync {
    /// Failure is reported through the returned result, like
    /// [`TaskExecutor`](crate::orchestration::TaskExecutor).
    async fn run_skill(
        &self,
        skill: &str,
        args: &[String],
        vars: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> TaskResult;
}

/// Executes workflows through the shared [`Dispatcher`].
pub struct WorkflowEngine {
    dispatcher: Arc<Dispatcher>,
    skills: Option<Arc<dyn SkillRunner>>,
    env: HashMap<String, String>,
}

impl WorkflowEngine {
    /// Create an engine whose templates see a snapshot of the process environment.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            skills: None,
            env: std::env::vars().collect(),
        }
    }

    #[must_use]
    pub fn with_skill_runner(mut self, runner: Arc<dyn SkillRunner>) -> Self {
        self.skills = Some(runner);
        self
    }

    /// Replace the environment snapshot visible as `{{env.KEY}}`.
    #[must_use]
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Validate `doc`, then execute it.
    pub async fn run(
        &self,
        doc: &WorkflowDoc,
        vars: BTreeMap<String, String>,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> Result<WorkflowRun, ValidationErrors> {
        let workflow = validate(doc)?;
        Ok(self.execute(&workflow, vars, mode, cancel).await)
    }

    /// Execute a validated workflow. `vars` override the workflow's defaults.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        vars: BTreeMap<String, String>,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> WorkflowRun {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let started_at = unix_timestamp();

        let mut input = workflow.variables.clone();
        input.extend(vars);

        info!(
            workflow = %workflow.name,
            run_id = %run_id,
            steps = workflow.steps.len(),
            ?mode,
            "Workflow run started"
        );

        let runner = Arc::new(StepRunner {
            dispatcher: Arc::clone(&self.dispatcher),
            skills: self.skills.clone(),
            mode,
            workflow_name: workflow.name.clone(),
        });
        let mut driver = RunDriver::new(
            workflow,
            TemplateContext::new(input.clone(), self.env.clone()),
        );
        let run_cancel = cancel.child_token();
        let end = driver.drive(&runner, &run_cancel).await;
        let (step_results, abort) = driver.finish(end);

        let total_cost = workflow
            .steps
            .iter()
            .filter_map(|s| step_results.get(&s.id))
            .map(|r| r.cost)
            .sum();
        let failed = workflow
            .steps
            .iter()
            .filter_map(|s| step_results.get(&s.id))
            .any(|r| !r.status.is_ok());

        let (status, error) = match end {
            RunEnd::Cancelled => (RunStatus::Cancelled, Some("workflow cancelled".to_string())),
            RunEnd::TimedOut => (
                RunStatus::Timeout,
                Some("workflow timeout exceeded".to_string()),
            ),
            RunEnd::Drained if abort.is_some() || failed => (RunStatus::Error, abort),
            RunEnd::Drained => (RunStatus::Success, None),
        };

        let run = WorkflowRun {
            id: run_id,
            workflow_name: workflow.name.clone(),
            mode,
            status,
            started_at,
            finished_at: unix_timestamp(),
            duration_ms: elapsed_ms(started),
            total_cost,
            variables: input,
            step_results,
            error,
        };

        if run.status == RunStatus::Success {
            info!(
                workflow = %run.workflow_name,
                run_id = %run.id,
                duration_ms = run.duration_ms,
                cost = run.total_cost,
                "Workflow completed"
            );
        } else {
            warn!(
                workflow = %run.workflow_name,
                run_id = %run.id,
                status = %run.status,
                error = run.error.as_deref().unwrap_or_default(),
                "Workflow completed with error"
            );
        }
        run
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Drained,
    TimedOut,
    Cancelled,
}

/// A step's result plus the results of any parallel sub-steps beneath it.
#[derive(Debug)]
struct StepOutcome {
    result: StepRunResult,
    nested: Vec<StepRunResult>,
}

impl StepOutcome {
    const fn single(result: StepRunResult) -> Self {
        Self {
            result,
            nested: Vec::new(),
        }
    }
}

/// Per-run scheduling state for the top-level steps.
struct RunDriver<'a> {
    workflow: &'a Workflow,
    index: HashMap<&'a str, usize>,
    scheduler: StepScheduler,
    ctx: TemplateContext,
    results: BTreeMap<String, StepRunResult>,
    branch_skipped: HashSet<usize>,
    abort: Option<String>,
}

impl<'a> RunDriver<'a> {
    fn new(workflow: &'a Workflow, ctx: TemplateContext) -> Self {
        let results = workflow
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepRunResult::new(s.id.clone(), StepStatus::Pending)))
            .collect();
        Self {
            workflow,
            index: workflow
                .steps
                .iter()
                .enumerate()
                .map(|(i, s)| (s.id.as_str(), i))
                .collect(),
            scheduler: StepScheduler::new(&workflow.execution_nodes()),
            ctx,
            results,
            branch_skipped: HashSet::new(),
            abort: None,
        }
    }

    async fn drive(&mut self, runner: &Arc<StepRunner>, cancel: &CancellationToken) -> RunEnd {
        let mut ready: VecDeque<usize> = self.scheduler.initially_ready().into();
        let mut in_flight: JoinSet<(usize, StepOutcome)> = JoinSet::new();

        let deadline = self.workflow.timeout;
        let timeout = async move {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        let end = loop {
            while let Some(idx) = ready.pop_front() {
                if let Some(reason) = self.skip_reason(idx) {
                    let step = &self.workflow.steps[idx];
                    debug!(
                        workflow = %self.workflow.name,
                        step_id = %step.id,
                        reason,
                        "Workflow step skipped"
                    );
                    let mut skipped = StepRunResult::new(step.id.clone(), StepStatus::Skipped);
                    skipped.error = reason.to_string();
                    self.ctx.record(&skipped);
                    self.results.insert(step.id.clone(), skipped);
                    ready.extend(self.scheduler.complete(idx));
                    continue;
                }
                self.launch(idx, runner, cancel, &mut in_flight);
            }

            if in_flight.is_empty() {
                break RunEnd::Drained;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break RunEnd::Cancelled,
                () = &mut timeout => break RunEnd::TimedOut,
                Some(joined) = in_flight.join_next() => match joined {
                    Ok((idx, outcome)) => {
                        self.record(idx, outcome);
                        ready.extend(self.scheduler.complete(idx));
                    }
                    Err(e) => error!(
                        workflow = %self.workflow.name,
                        error = %e,
                        "Workflow step task ended abnormally"
                    ),
                },
            }
        };

        if end != RunEnd::Drained {
            cancel.cancel();
            in_flight.shutdown().await;
        }
        end
    }

    fn skip_reason(&mut self, idx: usize) -> Option<&'static str> {
        if self.abort.is_some() {
            return Some("not run: an earlier step failed");
        }
        if self.branch_skipped.contains(&idx) {
            return Some("not run: branch not taken");
        }
        let deps = self.scheduler.deps_of(idx);
        if !deps.is_empty() && deps.iter().all(|d| self.branch_skipped.contains(d)) {
            self.branch_skipped.insert(idx);
            return Some("not run: every dependency was on an untaken branch");
        }
        None
    }

    fn launch(
        &mut self,
        idx: usize,
        runner: &Arc<StepRunner>,
        cancel: &CancellationToken,
        in_flight: &mut JoinSet<(usize, StepOutcome)>,
    ) {
        let step = self.workflow.steps[idx].clone();
        info!(
            workflow = %self.workflow.name,
            step_id = %step.id,
            step_type = step.kind.type_name(),
            "Workflow step started"
        );
        if let Some(result) = self.results.get_mut(&step.id) {
            result.status = StepStatus::Running;
        }

        let runner = Arc::clone(runner);
        let ctx = Arc::new(self.ctx.clone());
        let cancel = cancel.clone();
        in_flight.spawn(async move {
            let step_id = step.id.clone();
            let outcome = match catch_panic(runner.execute_step(step, ctx, cancel)).await {
                Ok(outcome) => outcome,
                Err(aborted) => {
                    error!(step_id = %step_id, error = %aborted, "Workflow step panicked");
                    StepOutcome::single(StepRunResult::failed(
                        step_id,
                        format!("step execution {aborted}"),
                    ))
                }
            };
            (idx, outcome)
        });
    }

    fn record(&mut self, idx: usize, outcome: StepOutcome) {
        let step = &self.workflow.steps[idx];
        for nested in outcome.nested {
            self.ctx.record(&nested);
            self.results.insert(nested.step_id.clone(), nested);
        }
        let result = outcome.result;
        self.ctx.record(&result);

        info!(
            workflow = %self.workflow.name,
            step_id = %step.id,
            status = %result.status,
            duration_ms = result.duration_ms,
            attempts = result.attempts,
            "Workflow step finished"
        );

        if !result.status.is_ok() && step.on_error != OnError::Skip && self.abort.is_none() {
            let detail = if result.error.is_empty() {
                result.status.to_string()
            } else {
                result.error.clone()
            };
            self.abort = Some(format!("step {:?} failed: {detail}", step.id));
        }

        if let StepKind::Condition(cond) = &step.kind {
            for target in cond.unchosen(&result.output) {
                if let Some(&t) = self.index.get(target) {
                    self.branch_skipped.insert(t);
                }
            }
        }

        self.results.insert(step.id.clone(), result);
    }

    /// Settle steps that never finished and hand back the results.
    fn finish(self, end: RunEnd) -> (BTreeMap<String, StepRunResult>, Option<String>) {
        let mut results = self.results;
        for result in results.values_mut() {
            match result.status {
                StepStatus::Running => {
                    result.status = if end == RunEnd::TimedOut {
                        StepStatus::Timeout
                    } else {
                        StepStatus::Cancelled
                    };
                }
                StepStatus::Pending => {
                    result.status = StepStatus::Skipped;
                    result.error = "not run".to_string();
                }
                _ => {}
            }
        }
        (results, self.abort)
    }
}

/// Executes single steps. Shared by all in-flight steps of one run.
struct StepRunner {
    dispatcher: Arc<Dispatcher>,
    skills: Option<Arc<dyn SkillRunner>>,
    mode: RunMode,
    workflow_name: String,
}

impl StepRunner {
    /// Run `step` with its retry and skip policy applied.
    fn execute_step(
        self: Arc<Self>,
        step: Step,
        ctx: Arc<TemplateContext>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = StepOutcome> + Send + 'static>> {
        Box::pin(async move {
            let started = Instant::now();
            let max_attempts = step.max_attempts();
            let mut attempts = 0;
            let mut cost = 0.0;

            let mut outcome = loop {
                attempts += 1;
                let outcome = self.run_once(&step, &ctx, &cancel).await;
                cost += outcome.result.cost;

                if outcome.result.status.is_ok()
                    || attempts >= max_attempts
                    || cancel.is_cancelled()
                {
                    break outcome;
                }
                warn!(
                    workflow = %self.workflow_name,
                    step_id = %step.id,
                    attempt = attempts,
                    max_attempts,
                    error = %outcome.result.error,
                    "Workflow step failed, retrying"
                );
                tokio::select! {
                    () = cancel.cancelled() => {
                        let mut cancelled = StepRunResult::new(step.id.clone(), StepStatus::Cancelled);
                        cancelled.error = "cancelled during retry wait".to_string();
                        break StepOutcome::single(cancelled);
                    }
                    () = tokio::time::sleep(step.retry_delay) => {}
                }
            };

            let result = &mut outcome.result;
            result.attempts = attempts;
            result.cost = cost;
            result.duration_ms = elapsed_ms(started);
            if !result.status.is_ok() && step.on_error == OnError::Skip {
                result.status = StepStatus::Skipped;
            }
            outcome
        })
    }

    async fn run_once(
        self: &Arc<Self>,
        step: &Step,
        ctx: &Arc<TemplateContext>,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        match &step.kind {
            StepKind::Dispatch(dispatch) => {
                StepOutcome::single(self.run_dispatch(&step.id, dispatch, ctx, cancel).await)
            }
            StepKind::Skill(skill) => {
                StepOutcome::single(self.run_skill(&step.id, skill, ctx, cancel).await)
            }
            StepKind::Condition(cond) => {
                let chosen = if condition::evaluate(&cond.expr, ctx) {
                    cond.then_step.clone()
                } else {
                    cond.else_step.clone().unwrap_or_default()
                };
                debug!(
                    step_id = %step.id,
                    expr = %cond.expr,
                    chosen = %chosen,
                    "Condition evaluated"
                );
                let mut result = StepRunResult::new(step.id.clone(), StepStatus::Success);
                result.output = chosen;
                StepOutcome::single(result)
            }
            StepKind::Parallel(parallel) => {
                self.run_parallel(&step.id, parallel, ctx, cancel).await
            }
        }
    }

    async fn run_dispatch(
        &self,
        step_id: &str,
        step: &DispatchStep,
        ctx: &TemplateContext,
        cancel: &CancellationToken,
    ) -> StepRunResult {
        let prompt = ctx.resolve(&step.prompt);
        let agent = ctx.resolve(&step.agent);
        let unresolved = ctx.unresolved(&step.prompt);
        if !unresolved.is_empty() {
            debug!(step_id, ?unresolved, "Prompt placeholders resolved to empty");
        }

        if self.mode == RunMode::DryRun {
            let mut result = StepRunResult::new(step_id, StepStatus::Success);
            result.output = format!("[dry-run] would dispatch to {agent}: {prompt}");
            return result;
        }

        let task = Task::new(prompt)
            .with_name(format!("{}/{step_id}", self.workflow_name))
            .with_agent(agent)
            .with_model(step.model.as_deref().map(|m| ctx.resolve(m)))
            .with_budget(step.budget)
            .with_timeout(step.timeout)
            .with_source(format!("workflow:{}", self.workflow_name));

        match self.dispatcher.dispatch(&task, cancel).await {
            Ok(result) => from_task_result(step_id, &result),
            Err(DispatchError::Slot(LimiterError::Cancelled)) => {
                let mut result = StepRunResult::new(step_id, StepStatus::Cancelled);
                result.error = "cancelled while waiting for an execution slot".to_string();
                result
            }
            Err(e) => StepRunResult::failed(step_id, e.to_string()),
        }
    }

    async fn run_skill(
        &self,
        step_id: &str,
        step: &SkillStep,
        ctx: &TemplateContext,
        cancel: &CancellationToken,
    ) -> StepRunResult {
        let args: Vec<String> = step.args.iter().map(|a| ctx.resolve(a)).collect();

        if self.mode == RunMode::DryRun {
            let mut result = StepRunResult::new(step_id, StepStatus::Success);
            result.output = format!("[dry-run] would run skill {} {args:?}", step.skill);
            return result;
        }

        let Some(runner) = &self.skills else {
            return StepRunResult::failed(
                step_id,
                format!("skill {:?} not found: no skill runner configured", step.skill),
            );
        };
        let result = runner.run_skill(&step.skill, &args, ctx.input(), cancel).await;
        from_task_result(step_id, &result)
    }

    async fn run_parallel(
        self: &Arc<Self>,
        step_id: &str,
        step: &ParallelStep,
        ctx: &Arc<TemplateContext>,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let siblings = cancel.child_token();
        let mut set: JoinSet<(usize, StepOutcome)> = JoinSet::new();

        for (pos, sub) in step.steps.iter().enumerate() {
            let runner = Arc::clone(self);
            let sub = sub.clone();
            let ctx = Arc::clone(ctx);
            let token = siblings.clone();
            set.spawn(async move {
                let sub_id = sub.id.clone();
                let outcome = match catch_panic(runner.execute_step(sub, ctx, token)).await {
                    Ok(outcome) => outcome,
                    Err(aborted) => {
                        error!(step_id = %sub_id, error = %aborted, "Parallel sub-step panicked");
                        StepOutcome::single(StepRunResult::failed(
                            sub_id,
                            format!("step execution {aborted}"),
                        ))
                    }
                };
                (pos, outcome)
            });
        }

        let mut slots: Vec<Option<StepOutcome>> = (0..step.steps.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((pos, outcome)) => {
                    if step.fail_fast && !outcome.result.status.is_ok() && !siblings.is_cancelled() {
                        info!(
                            step_id,
                            failed = %outcome.result.step_id,
                            "Parallel sub-step failed, cancelling siblings"
                        );
                        siblings.cancel();
                    }
                    slots[pos] = Some(outcome);
                }
                Err(e) => error!(step_id, error = %e, "Parallel sub-step task ended abnormally"),
            }
        }

        let mut result = StepRunResult::new(step_id, StepStatus::Success);
        let mut nested = Vec::new();
        let mut outputs = Vec::new();
        let mut any_failed = false;

        for (sub, slot) in step.steps.iter().zip(slots) {
            let outcome = slot.unwrap_or_else(|| {
                let mut lost = StepRunResult::new(sub.id.clone(), StepStatus::Cancelled);
                lost.error = "sub-step did not complete".to_string();
                StepOutcome::single(lost)
            });
            result.cost += outcome.result.cost;
            if !outcome.result.output.is_empty() {
                outputs.push(outcome.result.output.clone());
            }
            any_failed |= !outcome.result.status.is_ok();
            nested.extend(outcome.nested);
            nested.push(outcome.result);
        }

        result.output = outputs.join(PARALLEL_SEPARATOR);
        if any_failed {
            result.status = StepStatus::Error;
            result.error = "one or more parallel sub-steps failed".to_string();
        }
        StepOutcome { result, nested }
    }
}

fn from_task_result(step_id: &str, task: &TaskResult) -> StepRunResult {
    let status = if task.is_success() {
        StepStatus::Success
    } else {
        match task.status.as_str() {
            "timeout" => StepStatus::Timeout,
            "cancelled" => StepStatus::Cancelled,
            _ => StepStatus::Error,
        }
    };
    StepRunResult {
        step_id: step_id.to_string(),
        status,
        output: task.output.clone(),
        error: if status == StepStatus::Success {
            String::new()
        } else {
            task.failure_text().to_string()
        },
        cost: task.cost,
        ..StepRunResult::default()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
