//! Phase prompts rendered from embedded minijinja templates.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::plan::PlanStep;

const READ_TEMPLATE: &str = include_str!("prompts/read.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");
const ACT_TEMPLATE: &str = include_str!("prompts/act.md");
const FINAL_TEMPLATE: &str = include_str!("prompts/final.md");

/// Inputs for one act attempt.
#[derive(Debug, Clone)]
pub struct ActPrompt<'a> {
    pub step: &'a PlanStep,
    /// Current todo rendering.
    pub todos: &'a str,
    pub strict_write: bool,
    pub expected_files: &'a [String],
    /// Reason the previous attempt failed, if any.
    pub prior_failure: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct StepContext<'a> {
    title: &'a str,
    reason: &'a str,
    risk: &'a str,
}

/// Template engine wrapper around minijinja.
pub struct Prompts {
    env: Environment<'static>,
}

impl Default for Prompts {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompts {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("read", READ_TEMPLATE)
            .expect("read template should be valid");
        env.add_template("plan", PLAN_TEMPLATE)
            .expect("plan template should be valid");
        env.add_template("repair", REPAIR_TEMPLATE)
            .expect("repair template should be valid");
        env.add_template("act", ACT_TEMPLATE)
            .expect("act template should be valid");
        env.add_template("final", FINAL_TEMPLATE)
            .expect("final template should be valid");
        Self { env }
    }

    pub fn read(&self, user_input: &str) -> Result<String> {
        let template = self.env.get_template("read")?;
        Ok(template.render(context! { user_input => user_input.trim() })?)
    }

    pub fn plan(&self, read_summary: &str) -> Result<String> {
        let template = self.env.get_template("plan")?;
        Ok(template.render(context! { read_summary => read_summary.trim() })?)
    }

    /// Repair prompt embedding the unusable plan reply verbatim.
    pub fn repair(&self, raw: &str) -> Result<String> {
        let template = self.env.get_template("repair")?;
        Ok(template.render(context! { raw => raw })?)
    }

    pub fn act(&self, input: &ActPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("act")?;
        let step = StepContext {
            title: &input.step.title,
            reason: &input.step.reason,
            risk: &input.step.risk,
        };
        let rendered = template.render(context! {
            step => step,
            todos => input.todos,
            strict_write => input.strict_write,
            expected_files => input.expected_files,
            prior_failure => input.prior_failure.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    pub fn final_answer(&self, goal: &str, action_logs: &str) -> Result<String> {
        let template = self.env.get_template("final")?;
        Ok(template.render(context! { goal => goal, action_logs => action_logs })?)
    }
}
