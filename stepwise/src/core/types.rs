//! Shared deterministic types for the agent core.
//!
//! These types define stable contracts between core components and the audit
//! record. They must not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a todo item, and of the action log entry for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Todo,
    InProgress,
    Done,
    Skipped,
    Blocked,
}

impl TodoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TodoStatus::Todo => "todo",
            TodoStatus::InProgress => "in_progress",
            TodoStatus::Done => "done",
            TodoStatus::Skipped => "skipped",
            TodoStatus::Blocked => "blocked",
        }
    }

    /// Terminal statuses count towards progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TodoStatus::Done | TodoStatus::Skipped | TodoStatus::Blocked
        )
    }
}

impl fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry per step that reached the act loop, a fast path, or was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStepLog {
    pub step_id: String,
    pub title: String,
    pub status: TodoStatus,
    pub attempts: u32,
    pub output: String,
    pub error_text: String,
    /// Tool invocations reported by the capability; 0 when unavailable.
    pub tool_calls: u32,
    /// Write-capable tool invocations; 0 when unavailable.
    pub write_tool_calls: u32,
}

impl ActionStepLog {
    pub fn new(step_id: &str, title: &str, status: TodoStatus) -> Self {
        Self {
            step_id: step_id.to_string(),
            title: title.to_string(),
            status,
            attempts: 0,
            output: String::new(),
            error_text: String::new(),
            tool_calls: 0,
            write_tool_calls: 0,
        }
    }
}

/// Rendering of an empty action log list.
pub const EMPTY_ACTION_LOGS: &str = "(no action logs)";

/// Render action logs for the final-phase prompt and the CLI.
pub fn render_action_logs(logs: &[ActionStepLog]) -> String {
    if logs.is_empty() {
        return EMPTY_ACTION_LOGS.to_string();
    }
    let mut out = String::new();
    for log in logs {
        out.push_str(&format!(
            "- [{}] {} (attempts={})",
            log.status, log.title, log.attempts
        ));
        if !log.output.trim().is_empty() {
            out.push_str(&format!("\n  output: {}", log.output.trim()));
        }
        if !log.error_text.trim().is_empty() {
            out.push_str(&format!("\n  error: {}", log.error_text.trim()));
        }
        out.push('\n');
    }
    out.trim().to_string()
}

/// Phases of a single run, in the only order they may be visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Read,
    Plan,
    PlanRepair,
    TodoInit,
    Act,
    Final,
    Audit,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Read => "read",
            Phase::Plan => "plan",
            Phase::PlanRepair => "plan_repair",
            Phase::TodoInit => "todo_init",
            Phase::Act => "act",
            Phase::Final => "final",
            Phase::Audit => "audit",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forward-only cursor over [`Phase`].
///
/// Staying in the current phase is allowed (the act phase spans many steps);
/// moving back to an earlier phase is not.
#[derive(Debug, Clone, Default)]
pub struct PhaseCursor {
    current: Option<Phase>,
}

impl PhaseCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Phase> {
        self.current
    }

    pub fn enter(&mut self, next: Phase) -> Result<Phase, String> {
        if let Some(current) = self.current
            && next < current
        {
            return Err(format!("phase {next} cannot follow {current}"));
        }
        self.current = Some(next);
        Ok(next)
    }
}

/// Observational progress notification fired at phase and step boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub message: String,
    pub total_steps: usize,
    /// Steps that reached a terminal status.
    pub completed: usize,
    pub todo_text: String,
}
