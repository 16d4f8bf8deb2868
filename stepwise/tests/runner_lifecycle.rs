//! Lifecycle tests driving `Runner::run` end to end with a scripted capability.
//!
//! Each test checks the audit record left on disk as well as the returned
//! outcome, since the audit is the durable product of a run.

use std::fs;

use stepwise::core::types::{Phase, ProgressEvent, TodoStatus};
use stepwise::io::audit::{AuditSummary, list_audit_files, load_audit};
use stepwise::io::capability::CapabilityError;
use stepwise::plan::PlanStep;
use stepwise::runner::{Runner, RunnerOptions};
use stepwise::test_support::{Reply, ScriptedCapability, plan_json, step};

fn options(root: &std::path::Path) -> RunnerOptions {
    RunnerOptions {
        audit_dir: root.join(".stepwise").join("runs"),
        working_dir: root.to_path_buf(),
        ..RunnerOptions::default()
    }
}

/// A write task whose first attempt claims success without writing.
///
/// Sequence:
/// 1. Read and plan (fenced JSON, three steps).
/// 2. s1 confirms intent locally (no call).
/// 3. s2 writes `report.md`: attempt 1 reports a tool call but no write, attempt 2 writes.
/// 4. s3 is high risk and approved.
/// 5. Final answer from the capability.
#[test]
fn write_task_recovers_after_unverified_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    let plan = format!(
        "```json\n{}\n```",
        plan_json(
            "生成报告",
            &[
                step("s1", "确认用户需求", "low"),
                step("s2", "把统计结果写入 report.md", "medium"),
                step("s3", "推送到远端", "high"),
            ],
        )
    );
    let cap = ScriptedCapability::with_stats(vec![
        Reply::text("用户需要一份 report.md 报告"),
        Reply::text(plan),
        Reply::stats("已生成", 1, 0),
        Reply::stats("已生成", 2, 1).writing(root.join("report.md"), "# report\n"),
        Reply::stats("已推送", 1, 0),
        Reply::text("报告已生成并推送"),
    ]);
    let runner = Runner::new(cap, options(root))
        .with_approver(|step: &PlanStep| -> anyhow::Result<bool> { Ok(step.id == "s3") });
    let outcome = runner.run("生成 report.md 并推送").expect("run");

    let summary: Vec<(&str, TodoStatus, u32)> = outcome
        .action_logs
        .iter()
        .map(|log| (log.step_id.as_str(), log.status, log.attempts))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("s1", TodoStatus::Done, 0),
            ("s2", TodoStatus::Done, 2),
            ("s3", TodoStatus::Done, 1),
        ]
    );
    assert_eq!(outcome.final_answer, "报告已生成并推送");
    runner.capability().assert_drained();

    let files = list_audit_files(&root.join(".stepwise").join("runs")).expect("list");
    assert_eq!(files.len(), 1);
    let audit = load_audit(&files[0].path).expect("load");
    assert_eq!(Some(files[0].path.clone()), outcome.audit_path);
    assert_eq!(audit.plan, outcome.plan);
    assert_eq!(audit.action_logs, outcome.action_logs);
    assert_eq!(audit.action_logs[1].write_tool_calls, 1);
    assert!(audit.todos.iter().all(|item| item.status == TodoStatus::Done));

    let rendered = AuditSummary::from_audit(&audit).render();
    assert!(rendered.contains("goal: 生成报告"));
    assert!(rendered.contains("action_logs: 3 (done=3 blocked=0 skipped=0)"));
}

/// Once a step is blocked the remaining steps are skipped and the final answer
/// is synthesized locally.
#[test]
fn blocked_write_is_recorded_in_audit() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    let cap = ScriptedCapability::with_stats(vec![
        Reply::text("写脚本"),
        Reply::text(plan_json(
            "写排序脚本",
            &[
                step("s1", "将代码写入 sort.py 文件", "low"),
                step("s2", "运行测试", "low"),
                step("s3", "汇报结果", "low"),
            ],
        )),
        Reply::stats("已写入", 2, 0),
        Reply::error(CapabilityError::Timeout(std::time::Duration::from_secs(1))),
    ]);
    let runner = Runner::new(cap, options(root));
    let outcome = runner.run("写一个 sort.py").expect("run");

    let blocked = outcome.blocked_step().expect("blocked step");
    assert_eq!(blocked.step_id, "s1");
    assert!(blocked.error_text.contains("timed out"));
    assert!(outcome.final_answer.contains("任务未完成"));
    assert_eq!(
        outcome.todo_text,
        "- [blocked] 1. 将代码写入 sort.py 文件\n- [skipped] 2. 运行测试\n- [skipped] 3. 汇报结果"
    );
    runner.capability().assert_drained();

    let audit = load_audit(&outcome.audit_path.expect("audit path")).expect("load");
    assert_eq!(audit.final_answer, outcome.final_answer);
    let summary = AuditSummary::from_audit(&audit);
    assert_eq!((summary.done, summary.blocked, summary.skipped), (0, 1, 2));
    assert!(!root.join("sort.py").exists());
}

#[test]
fn bullet_plan_fallback_drives_act_phase() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cap = ScriptedCapability::new(vec![
        Reply::text("summary"),
        Reply::text("- step a\n- step b\n3. step c"),
        Reply::text("a"),
        Reply::text("b"),
        Reply::text("c"),
        Reply::text("final"),
    ]);
    let events = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = std::rc::Rc::clone(&events);
    let runner = Runner::new(cap, options(temp.path()))
        .with_progress(move |event: &ProgressEvent| sink.borrow_mut().push(event.clone()));
    let outcome = runner.run("three things").expect("run");

    let titles: Vec<&str> = outcome.plan.steps.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(titles, vec!["step a", "step b", "step c"]);
    assert!(outcome.plan.steps.iter().all(|s| s.risk == "medium"));
    assert_eq!(outcome.plan.goal, "完成用户请求");

    let events = events.borrow();
    let last_act = events
        .iter()
        .rev()
        .find(|e| e.phase == Phase::Act)
        .expect("act event");
    assert_eq!((last_act.completed, last_act.total_steps), (3, 3));
    assert!(last_act.todo_text.contains("- [done] 3. step c"));
}

#[test]
fn failed_read_leaves_no_audit_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cap = ScriptedCapability::new(vec![Reply::error(CapabilityError::Busy(
        "agent is already streaming".to_string(),
    ))]);
    let runner = Runner::new(cap, options(temp.path()));
    assert!(runner.run("anything").is_err());
    assert!(!temp.path().join(".stepwise").exists());
    assert!(fs::read_dir(temp.path()).expect("read dir").next().is_none());
}
