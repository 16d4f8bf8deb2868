//! Run audit records under the audit directory (`run-<YYYYMMDD-HHMMSS>.json`).

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::todo::TodoItem;
use crate::core::types::{ActionStepLog, TodoStatus};
use crate::plan::Plan;

const RUN_AUDIT_SCHEMA: &str = include_str!("../../schemas/run_audit.schema.json");

/// Same-second runs get `_02`..`_99` suffixes before writing gives up.
const MAX_NAME_SUFFIX: u32 = 99;

/// Longest final answer shown in a summary, in characters.
const SUMMARY_FINAL_LIMIT: usize = 240;

/// Immutable record of one completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAudit {
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
    pub user_input: String,
    pub read_summary: String,
    pub plan: Plan,
    pub action_logs: Vec<ActionStepLog>,
    #[serde(rename = "final")]
    pub final_answer: String,
    pub todos: Vec<TodoItem>,
}

/// File name for a run started at `started_at`.
pub fn audit_file_name(started_at: &DateTime<Local>) -> String {
    format!("run-{}.json", started_at.format("%Y%m%d-%H%M%S"))
}

fn suffixed_file_name(started_at: &DateTime<Local>, suffix: u32) -> String {
    format!("run-{}_{suffix:02}.json", started_at.format("%Y%m%d-%H%M%S"))
}

/// Persist `audit` under `dir`, creating the directory first.
///
/// The file is created exclusively; an existing record is never overwritten.
/// When another run already took the name, a numeric suffix is appended.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn write_audit(dir: &Path, started_at: &DateTime<Local>, audit: &RunAudit) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create audit dir {}", dir.display()))?;
    let mut payload = serde_json::to_string_pretty(audit).context("serialize run audit")?;
    payload.push('\n');

    for suffix in 1..=MAX_NAME_SUFFIX {
        let name = if suffix == 1 {
            audit_file_name(started_at)
        } else {
            suffixed_file_name(started_at, suffix)
        };
        let path = dir.join(name);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "audit name taken, trying next suffix");
                continue;
            }
            Err(err) => return Err(err).with_context(|| format!("create {}", path.display())),
        };
        file.write_all(payload.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        debug!(path = %path.display(), "run audit written");
        return Ok(path);
    }
    bail!(
        "no free audit file name for {} in {}",
        audit_file_name(started_at),
        dir.display()
    )
}

/// A stored audit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditFile {
    pub name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// List audit files, most recent first (modification time, then file name, descending).
///
/// A missing directory yields an empty list.
pub fn list_audit_files(dir: &Path) -> Result<Vec<AuditFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("run-") || !name.ends_with(".json") {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        files.push(AuditFile {
            name,
            path: entry.path(),
            modified,
        });
    }
    files.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| b.name.cmp(&a.name))
    });
    Ok(files)
}

/// Read an audit file and check it against the run audit schema.
pub fn load_audit(path: &Path) -> Result<RunAudit> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    validate_audit_value(&value).with_context(|| format!("validate {}", path.display()))?;
    let audit = serde_json::from_value(value)
        .with_context(|| format!("decode run audit {}", path.display()))?;
    Ok(audit)
}

/// Validate a JSON value against the run audit schema (Draft 2020-12).
pub fn validate_audit_value(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(RUN_AUDIT_SCHEMA).context("parse audit schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile audit schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Condensed view of a run audit for `stepwise audit show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSummary {
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
    pub goal: String,
    pub steps: usize,
    pub action_logs: usize,
    pub done: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub user_input: String,
    pub final_answer: String,
}

impl AuditSummary {
    pub fn from_audit(audit: &RunAudit) -> Self {
        let count = |status: TodoStatus| {
            audit
                .action_logs
                .iter()
                .filter(|log| log.status == status)
                .count()
        };
        Self {
            started_at: audit.started_at.trim().to_string(),
            finished_at: audit.finished_at.trim().to_string(),
            duration_ms: audit.duration_ms,
            goal: audit.plan.goal.trim().to_string(),
            steps: audit.plan.steps.len(),
            action_logs: audit.action_logs.len(),
            done: count(TodoStatus::Done),
            blocked: count(TodoStatus::Blocked),
            skipped: count(TodoStatus::Skipped),
            user_input: audit.user_input.trim().to_string(),
            final_answer: truncate_final(&audit.final_answer),
        }
    }

    pub fn render(&self) -> String {
        [
            format!("started_at: {}", self.started_at),
            format!("finished_at: {}", self.finished_at),
            format!("duration_ms: {}", self.duration_ms),
            format!("goal: {}", self.goal),
            format!("steps: {}", self.steps),
            format!(
                "action_logs: {} (done={} blocked={} skipped={})",
                self.action_logs, self.done, self.blocked, self.skipped
            ),
            format!("user_input: {}", self.user_input),
            format!("final: {}", self.final_answer),
        ]
        .join("\n")
    }
}

fn truncate_final(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return "(empty)".to_string();
    }
    if text.chars().count() <= SUMMARY_FINAL_LIMIT {
        return text.to_string();
    }
    let head: String = text.chars().take(SUMMARY_FINAL_LIMIT).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanStep;
    use chrono::TimeZone;
    use std::time::Duration;

    fn sample_audit() -> RunAudit {
        let mut done = ActionStepLog::new("s1", "read", TodoStatus::Done);
        done.attempts = 1;
        RunAudit {
            started_at: "2026-01-02T03:04:05+00:00".to_string(),
            finished_at: "2026-01-02T03:04:09+00:00".to_string(),
            duration_ms: 4000,
            user_input: "do it".to_string(),
            read_summary: "summary".to_string(),
            plan: Plan {
                goal: "goal".to_string(),
                steps: vec![
                    PlanStep {
                        id: "s1".to_string(),
                        title: "read".to_string(),
                        reason: "r".to_string(),
                        risk: "low".to_string(),
                        requires_approval: false,
                    },
                    PlanStep {
                        id: "s2".to_string(),
                        title: "write".to_string(),
                        reason: "r".to_string(),
                        risk: "high".to_string(),
                        requires_approval: true,
                    },
                ],
            },
            action_logs: vec![done, ActionStepLog::new("s2", "write", TodoStatus::Skipped)],
            final_answer: "all good".to_string(),
            todos: vec![TodoItem {
                id: 1,
                title: "read".to_string(),
                status: TodoStatus::Done,
            }],
        }
    }

    fn started() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 1, 2, 3, 4, 5)
            .single()
            .expect("valid local time")
    }

    #[test]
    fn file_name_uses_start_timestamp() {
        assert_eq!(audit_file_name(&started()), "run-20260102-030405.json");
    }

    #[test]
    fn written_audit_has_expected_shape() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("runs");
        let path = write_audit(&dir, &started(), &sample_audit()).expect("write");
        assert!(path.ends_with("run-20260102-030405.json"));

        let value: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["final"], "all good");
        assert_eq!(value["plan"]["steps"][1]["requires_approval"], true);
        assert_eq!(value["action_logs"][1]["status"], "skipped");
        assert_eq!(value["todos"][0]["status"], "done");
        validate_audit_value(&value).expect("schema valid");

        let loaded = load_audit(&path).expect("load");
        assert_eq!(loaded, sample_audit());
    }

    #[test]
    fn same_second_runs_get_suffixed_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = write_audit(temp.path(), &started(), &sample_audit()).expect("first");
        let mut other = sample_audit();
        other.final_answer = "second".to_string();
        let second = write_audit(temp.path(), &started(), &other).expect("second");
        let third = write_audit(temp.path(), &started(), &other).expect("third");

        assert!(first.ends_with("run-20260102-030405.json"));
        assert!(second.ends_with("run-20260102-030405_02.json"));
        assert!(third.ends_with("run-20260102-030405_03.json"));
        assert_eq!(load_audit(&first).expect("load").final_answer, "all good");
        assert_eq!(load_audit(&second).expect("load").final_answer, "second");
        assert_eq!(list_audit_files(temp.path()).expect("list").len(), 3);
    }

    #[test]
    fn schema_rejects_unknown_status() {
        let mut value = serde_json::to_value(sample_audit()).expect("value");
        value["action_logs"][0]["status"] = Value::String("exploded".to_string());
        assert!(validate_audit_value(&value).is_err());
    }

    #[test]
    fn lists_most_recent_first_with_name_tiebreak() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        for (name, offset) in [
            ("run-20260101-000000.json", 10),
            ("run-20260101-000001.json", 10),
            ("run-20250101-000000.json", 20),
            ("notes.json", 30),
        ] {
            let path = dir.join(name);
            fs::write(&path, "{}").expect("write");
            let file = fs::File::options().write(true).open(&path).expect("open");
            file.set_modified(base + Duration::from_secs(offset))
                .expect("set mtime");
        }

        let names: Vec<String> = list_audit_files(dir)
            .expect("list")
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "run-20250101-000000.json",
                "run-20260101-000001.json",
                "run-20260101-000000.json"
            ]
        );
    }

    #[test]
    fn missing_dir_lists_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(
            list_audit_files(&temp.path().join("absent"))
                .expect("list")
                .is_empty()
        );
    }

    #[test]
    fn summary_counts_statuses_and_truncates_final() {
        let mut audit = sample_audit();
        audit.final_answer = "长".repeat(300);
        let summary = AuditSummary::from_audit(&audit);
        assert_eq!(summary.done, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.blocked, 0);
        assert_eq!(summary.final_answer.chars().count(), SUMMARY_FINAL_LIMIT + 3);
        assert!(
            summary
                .render()
                .contains("action_logs: 2 (done=1 blocked=0 skipped=1)")
        );
    }
}
