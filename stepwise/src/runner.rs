//! The read → plan → act → final phase state machine.
//!
//! One [`Runner::run`] call drives a single request through every phase in
//! order. Read and plan failures abort the run. Act failures are retried per
//! step; a step that exhausts its retries blocks the run and every later step
//! is skipped. The completed run is persisted as a [`RunAudit`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{ClassifierRules, detect_file_paths};
use crate::core::normalize::normalize_plan;
use crate::core::parser::parse_plan;
use crate::core::todo::{TodoItem, TodoStore};
use crate::core::types::{
    ActionStepLog, Phase, PhaseCursor, ProgressEvent, TodoStatus, render_action_logs,
};
use crate::io::audit::{RunAudit, write_audit};
use crate::io::capability::{AskRequest, CancelToken, Capability, CapabilityError, ask_reporting};
use crate::io::prompt::{ActPrompt, Prompts};
use crate::io::verify::{existence_summary, failure_reason, missing_files};
use crate::plan::{Plan, PlanStep};

/// Default attempts per act step.
pub const DEFAULT_MAX_ACT_RETRIES: u32 = 2;

/// Error text recorded when an act step failed without a captured reason.
const ACT_FAILED: &str = "act failed";

/// The plan reply could not be normalized, even after one repair attempt.
///
/// Returned inside `anyhow::Error`; callers can `downcast_ref::<InvalidPlanError>()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid plan: unable to normalize plan output")]
pub struct InvalidPlanError {
    /// The last unusable reply.
    pub raw: String,
}

/// Decides whether a high-risk or approval-required step may run.
pub trait Approver {
    fn approve(&self, step: &PlanStep) -> Result<bool>;
}

impl<F> Approver for F
where
    F: Fn(&PlanStep) -> Result<bool>,
{
    fn approve(&self, step: &PlanStep) -> Result<bool> {
        self(step)
    }
}

/// Receives progress notifications at phase and step boundaries.
pub trait ProgressSink {
    fn emit(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent),
{
    fn emit(&self, event: &ProgressEvent) {
        self(event);
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Attempts per act step; values below 1 are raised to 1.
    pub max_act_retries: u32,
    pub audit_dir: PathBuf,
    /// Directory relative paths are resolved against when verifying files.
    pub working_dir: PathBuf,
    /// Deadline passed with every capability call.
    pub call_timeout: Duration,
    pub rules: ClassifierRules,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_act_retries: DEFAULT_MAX_ACT_RETRIES,
            audit_dir: PathBuf::from(".stepwise").join("runs"),
            working_dir: PathBuf::from("."),
            call_timeout: Duration::from_secs(300),
            rules: ClassifierRules::default(),
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub read_summary: String,
    pub plan: Plan,
    pub action_logs: Vec<ActionStepLog>,
    pub final_answer: String,
    pub todos: Vec<TodoItem>,
    pub todo_text: String,
    /// `None` when the audit record could not be persisted.
    pub audit_path: Option<PathBuf>,
}

impl RunOutcome {
    /// The step that blocked the run, if any.
    pub fn blocked_step(&self) -> Option<&ActionStepLog> {
        self.action_logs
            .iter()
            .find(|log| log.status == TodoStatus::Blocked)
    }
}

pub struct Runner<C> {
    capability: C,
    options: RunnerOptions,
    approver: Option<Box<dyn Approver>>,
    progress: Option<Box<dyn ProgressSink>>,
    cancel: CancelToken,
    prompts: Prompts,
}

/// Per-run mutable state. Constructed fresh by every [`Runner::run`] call.
struct RunState {
    todos: TodoStore,
    cursor: PhaseCursor,
    total_steps: usize,
}

impl RunState {
    fn new() -> Self {
        Self {
            todos: TodoStore::new(),
            cursor: PhaseCursor::new(),
            total_steps: 0,
        }
    }

    fn enter(&mut self, phase: Phase) -> Result<()> {
        self.cursor.enter(phase).map_err(|err| anyhow!(err))?;
        Ok(())
    }

    fn completed(&self) -> usize {
        self.todos
            .all()
            .iter()
            .filter(|item| item.status.is_terminal())
            .count()
    }
}

impl<C: Capability> Runner<C> {
    pub fn new(capability: C, options: RunnerOptions) -> Self {
        Self {
            capability,
            options,
            approver: None,
            progress: None,
            cancel: CancelToken::new(),
            prompts: Prompts::new(),
        }
    }

    /// Without an approver, risky steps run unattended.
    pub fn with_approver(mut self, approver: impl Approver + 'static) -> Self {
        self.approver = Some(Box::new(approver));
        self
    }

    pub fn with_progress(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.progress = Some(Box::new(sink));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn capability(&self) -> &C {
        &self.capability
    }

    /// Drive `user_input` through every phase.
    ///
    /// Returns an error (and writes no audit) when the read, plan or final
    /// phase fails, when the approver fails, or when the run is canceled.
    #[instrument(skip_all, fields(input_len = user_input.len()))]
    pub fn run(&self, user_input: &str) -> Result<RunOutcome> {
        let started_at = Local::now();
        let mut state = RunState::new();

        state.enter(Phase::Read)?;
        self.emit(&state, Phase::Read, "summarizing request");
        let read_summary = self
            .ask(&self.prompts.read(user_input)?)
            .context("read phase")?
            .trim()
            .to_string();
        debug!(summary_len = read_summary.len(), "read phase complete");

        state.enter(Phase::Plan)?;
        self.emit(&state, Phase::Plan, "planning steps");
        let plan = self.plan(&mut state, &read_summary)?;
        state.total_steps = plan.steps.len();
        info!(goal = %plan.goal, steps = plan.steps.len(), "plan ready");

        state.enter(Phase::TodoInit)?;
        for step in &plan.steps {
            state.todos.upsert(&step.title, TodoStatus::Todo);
        }
        self.emit(&state, Phase::TodoInit, "todos initialized");

        state.enter(Phase::Act)?;
        let run_files = detect_file_paths(user_input);
        let action_logs = self.act(&mut state, &plan, &read_summary, &run_files)?;

        state.enter(Phase::Final)?;
        self.emit(&state, Phase::Final, "writing final answer");
        let final_answer = match action_logs
            .iter()
            .find(|log| log.status == TodoStatus::Blocked)
        {
            Some(blocked) => blocked_final_answer(blocked, &action_logs),
            None => {
                let prompt = self
                    .prompts
                    .final_answer(&plan.goal, &render_action_logs(&action_logs))?;
                self.ask(&prompt).context("final phase")?.trim().to_string()
            }
        };

        state.enter(Phase::Audit)?;
        let audit = RunAudit {
            started_at: started_at.to_rfc3339(),
            finished_at: String::new(),
            duration_ms: 0,
            user_input: user_input.to_string(),
            read_summary: read_summary.clone(),
            plan: plan.clone(),
            action_logs: action_logs.clone(),
            final_answer: final_answer.clone(),
            todos: state.todos.all(),
        };
        let audit_path = self.persist_audit(started_at, audit);
        let message = match &audit_path {
            Some(path) => format!("audit written to {}", path.display()),
            None => "audit unavailable".to_string(),
        };
        self.emit(&state, Phase::Audit, &message);

        Ok(RunOutcome {
            read_summary,
            plan,
            action_logs,
            final_answer,
            todos: state.todos.all(),
            todo_text: state.todos.render(),
            audit_path,
        })
    }

    fn plan(&self, state: &mut RunState, read_summary: &str) -> Result<Plan> {
        let raw = self
            .ask(&self.prompts.plan(read_summary)?)
            .context("plan phase")?;
        if let Some(plan) = normalize_plan(parse_plan(&raw)) {
            return Ok(plan);
        }

        warn!("plan reply unusable, requesting repair");
        state.enter(Phase::PlanRepair)?;
        self.emit(state, Phase::PlanRepair, "repairing plan");
        let repaired = match self.ask(&self.prompts.repair(&raw)?) {
            Ok(repaired) => repaired,
            Err(CapabilityError::Canceled) => {
                return Err(CapabilityError::Canceled).context("plan repair");
            }
            Err(err) => {
                warn!(err = %err, "plan repair call failed");
                return Err(InvalidPlanError { raw }.into());
            }
        };
        normalize_plan(parse_plan(&repaired))
            .ok_or_else(|| InvalidPlanError { raw: repaired }.into())
    }

    fn act(
        &self,
        state: &mut RunState,
        plan: &Plan,
        read_summary: &str,
        run_files: &[String],
    ) -> Result<Vec<ActionStepLog>> {
        let mut logs = Vec::with_capacity(plan.steps.len());
        let mut blocked_by: Option<&PlanStep> = None;

        for step in &plan.steps {
            if let Some(blocker) = blocked_by {
                state.todos.upsert(&step.title, TodoStatus::Skipped);
                let mut log = ActionStepLog::new(&step.id, &step.title, TodoStatus::Skipped);
                log.error_text = format!(
                    "skipped because step {} ({}) is blocked",
                    blocker.id, blocker.title
                );
                logs.push(log);
                continue;
            }

            self.emit(state, Phase::Act, &format!("{} {}", step.id, step.title));
            let log = self.act_step(state, step, read_summary, run_files)?;
            state.todos.upsert(&step.title, log.status);
            info!(step = %step.id, status = %log.status, attempts = log.attempts, "step finished");
            self.emit(state, Phase::Act, &format!("{} {}", step.id, log.status));
            if log.status == TodoStatus::Blocked {
                warn!(step = %step.id, reason = %log.error_text, "step blocked, skipping the rest");
                blocked_by = Some(step);
            }
            logs.push(log);
        }
        Ok(logs)
    }

    #[instrument(skip_all, fields(step = %step.id))]
    fn act_step(
        &self,
        state: &mut RunState,
        step: &PlanStep,
        read_summary: &str,
        run_files: &[String],
    ) -> Result<ActionStepLog> {
        let rules = &self.options.rules;
        let step_files = detect_file_paths(&step.classifier_text());
        let targets = if step_files.is_empty() {
            run_files.to_vec()
        } else {
            step_files
        };

        if rules.is_intent_confirmation(step) {
            let mut log = ActionStepLog::new(&step.id, &step.title, TodoStatus::Done);
            log.output = format!("已确认用户意图：{read_summary}");
            return Ok(log);
        }

        if rules.is_local_probe(step) {
            let mut log = ActionStepLog::new(&step.id, &step.title, TodoStatus::Done);
            log.output = existence_summary(&targets, &self.options.working_dir);
            return Ok(log);
        }

        if step.needs_approval()
            && let Some(approver) = &self.approver
        {
            let approved = approver
                .approve(step)
                .with_context(|| format!("approve step {}", step.id))?;
            if !approved {
                info!("step denied by approver");
                return Ok(ActionStepLog::new(
                    &step.id,
                    &step.title,
                    TodoStatus::Skipped,
                ));
            }
        }

        state.todos.upsert(&step.title, TodoStatus::InProgress);
        let strict_write = rules.is_strict_write(step, run_files);
        let expected: &[String] = if strict_write { &targets } else { &[] };
        let max_attempts = self.options.max_act_retries.max(1);

        let mut log = ActionStepLog::new(&step.id, &step.title, TodoStatus::Blocked);
        let mut last_failure: Option<String> = None;
        for attempt in 1..=max_attempts {
            log.attempts = attempt;
            let todos = state.todos.render();
            let prompt = self.prompts.act(&ActPrompt {
                step,
                todos: &todos,
                strict_write,
                expected_files: expected,
                prior_failure: if strict_write {
                    last_failure.as_deref()
                } else {
                    None
                },
            })?;

            let reply = match ask_reporting(&self.capability, &self.request(prompt)) {
                Ok(reply) => reply,
                Err(CapabilityError::Canceled) => {
                    return Err(CapabilityError::Canceled)
                        .with_context(|| format!("act step {}", step.id));
                }
                Err(err) => {
                    warn!(attempt, err = %err, "act attempt failed");
                    last_failure = Some(err.to_string());
                    continue;
                }
            };
            log.tool_calls = reply.tool_calls.unwrap_or(0);
            log.write_tool_calls = reply.write_tool_calls.unwrap_or(0);

            if !expected.is_empty() {
                let missing = missing_files(expected, &self.options.working_dir);
                if !missing.is_empty() {
                    let reason = failure_reason(&missing, reply.tool_calls, reply.write_tool_calls);
                    warn!(attempt, reason = %reason, "write verification failed");
                    last_failure = Some(reason);
                    continue;
                }
            }

            log.status = TodoStatus::Done;
            log.output = reply.text.trim().to_string();
            return Ok(log);
        }

        log.error_text = last_failure.unwrap_or_else(|| ACT_FAILED.to_string());
        Ok(log)
    }

    fn request(&self, prompt: String) -> AskRequest {
        AskRequest::new(prompt, self.options.call_timeout, self.cancel.clone())
    }

    fn ask(&self, prompt: &str) -> Result<String, CapabilityError> {
        let request = self.request(prompt.to_string());
        if request.cancel.is_canceled() {
            return Err(CapabilityError::Canceled);
        }
        self.capability.ask(&request)
    }

    fn persist_audit(&self, started_at: DateTime<Local>, mut audit: RunAudit) -> Option<PathBuf> {
        let finished_at = Local::now();
        audit.finished_at = finished_at.to_rfc3339();
        audit.duration_ms = u64::try_from((finished_at - started_at).num_milliseconds()).unwrap_or(0);
        match write_audit(&self.options.audit_dir, &started_at, &audit) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to persist run audit");
                None
            }
        }
    }

    fn emit(&self, state: &RunState, phase: Phase, message: &str) {
        let Some(sink) = &self.progress else {
            return;
        };
        sink.emit(&ProgressEvent {
            phase,
            message: message.to_string(),
            total_steps: state.total_steps,
            completed: state.completed(),
            todo_text: state.todos.render(),
        });
    }
}

/// Final answer for a run stopped by a blocked step. No capability call is made.
fn blocked_final_answer(blocked: &ActionStepLog, logs: &[ActionStepLog]) -> String {
    let reason = if blocked.error_text.trim().is_empty() {
        ACT_FAILED
    } else {
        blocked.error_text.trim()
    };
    format!(
        "任务未完成：步骤 {}（{}）执行受阻，后续步骤已跳过。\n受阻原因：{}\n\n执行记录：\n{}",
        blocked.step_id,
        blocked.title,
        reason,
        render_action_logs(logs)
    )
}
