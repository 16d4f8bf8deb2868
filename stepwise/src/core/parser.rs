//! Turn raw capability output into a [`Plan`].
//!
//! The capability is asked for strict JSON, but replies routinely arrive
//! wrapped in a code fence or as a plain bullet list. Parsing never fails:
//! anything that is not a usable JSON plan degrades to the bullet fallback.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::plan::{DEFAULT_GOAL, FALLBACK_REASON, Plan, PlanStep};

static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*\d.]+\s*(.+)$").expect("bullet regex is valid"));

/// Parse a plan from raw capability output.
pub fn parse_plan(raw: &str) -> Plan {
    let text = strip_code_fence(raw);
    if let Ok(plan) = serde_json::from_str::<Plan>(&text)
        && !plan.steps.is_empty()
    {
        debug!(steps = plan.steps.len(), "parsed structured plan");
        return plan;
    }

    let bullets = parse_bullets(raw);
    debug!(steps = bullets.len(), "falling back to bullet plan");
    let steps = bullets
        .into_iter()
        .enumerate()
        .map(|(idx, title)| PlanStep {
            id: format!("s{}", idx + 1),
            title,
            reason: FALLBACK_REASON.to_string(),
            risk: "medium".to_string(),
            requires_approval: false,
        })
        .collect();
    Plan {
        goal: DEFAULT_GOAL.to_string(),
        steps,
    }
}

/// Remove one enclosing ``` fence.
///
/// The fence is only stripped when the text has at least three lines and a
/// closing fence after the opening line; otherwise the trimmed text is returned.
pub fn strip_code_fence(raw: &str) -> String {
    let text = raw.trim();
    if !text.starts_with("```") {
        return text.to_string();
    }
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() < 3 {
        return text.to_string();
    }
    let Some(end) = lines
        .iter()
        .rposition(|line| line.trim_start().starts_with("```"))
    else {
        return text.to_string();
    };
    if end <= 1 {
        return text.to_string();
    }
    lines[1..end].join("\n").trim().to_string()
}

/// Extract bullet-like lines; the whole trimmed input when there are none.
fn parse_bullets(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = raw
        .lines()
        .filter_map(|line| BULLET_RE.captures(line.trim()))
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|title| !title.is_empty())
        .collect();
    let trimmed = raw.trim();
    if out.is_empty() && !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    out
}
