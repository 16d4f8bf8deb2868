//! Validate and clean a parsed [`Plan`].

use std::collections::HashSet;

use crate::plan::{DEFAULT_GOAL, DEFAULT_REASON, Plan, PlanStep, RISK_LEVELS};

/// Normalize a plan, returning `None` when no step has a non-blank title.
///
/// Rules, applied per step in original order:
/// - id/title/reason are trimmed, risk is trimmed and lowercased
/// - steps with a blank title are dropped
/// - a blank id becomes `s<index+1>`; an id already kept gets `_<index+1>` appended
///   until it is unique
/// - risk outside `low|medium|high` becomes `medium`
/// - a blank reason becomes [`DEFAULT_REASON`]
pub fn normalize_plan(plan: Plan) -> Option<Plan> {
    let goal = match plan.goal.trim() {
        "" => DEFAULT_GOAL.to_string(),
        goal => goal.to_string(),
    };

    let mut seen: HashSet<String> = HashSet::with_capacity(plan.steps.len());
    let mut steps = Vec::with_capacity(plan.steps.len());
    for (idx, step) in plan.steps.into_iter().enumerate() {
        let title = step.title.trim().to_string();
        if title.is_empty() {
            continue;
        }

        let mut id = match step.id.trim() {
            "" => format!("s{}", idx + 1),
            id => id.to_string(),
        };
        while seen.contains(&id) {
            id = format!("{id}_{}", idx + 1);
        }
        seen.insert(id.clone());

        let risk = step.risk.trim().to_lowercase();
        let risk = if RISK_LEVELS.contains(&risk.as_str()) {
            risk
        } else {
            "medium".to_string()
        };

        let reason = match step.reason.trim() {
            "" => DEFAULT_REASON.to_string(),
            reason => reason.to_string(),
        };

        steps.push(PlanStep {
            id,
            title,
            reason,
            risk,
            requires_approval: step.requires_approval,
        });
    }

    if steps.is_empty() {
        return None;
    }
    Some(Plan { goal, steps })
}
