//! Test-only helpers: a scripted capability and plan builders.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;

use crate::io::capability::{AskReply, AskRequest, Capability, CapabilityError, StatsCapability};
use crate::plan::{Plan, PlanStep};

/// One scripted answer, consumed in order.
#[derive(Debug, Clone)]
pub struct Reply {
    result: Result<AskReply, CapabilityError>,
    /// File written before the reply is returned, simulating a tool side effect.
    writes: Option<(PathBuf, String)>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            result: Ok(AskReply::text_only(text)),
            writes: None,
        }
    }

    pub fn stats(text: impl Into<String>, tool_calls: u32, write_tool_calls: u32) -> Self {
        Self {
            result: Ok(AskReply {
                text: text.into(),
                tool_calls: Some(tool_calls),
                write_tool_calls: Some(write_tool_calls),
            }),
            writes: None,
        }
    }

    pub fn fail(message: &str) -> Self {
        Self::error(CapabilityError::Failed(message.to_string()))
    }

    pub fn error(err: CapabilityError) -> Self {
        Self {
            result: Err(err),
            writes: None,
        }
    }

    pub fn writing(mut self, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.writes = Some((path.into(), contents.to_string()));
        self
    }
}

/// Capability that answers from a queue and records every prompt it saw.
///
/// Built with [`ScriptedCapability::with_stats`] it also exposes the stats
/// interface and reports the scripted counters.
#[derive(Debug, Default)]
pub struct ScriptedCapability {
    replies: RefCell<VecDeque<Reply>>,
    prompts: RefCell<Vec<String>>,
    stats: bool,
}

impl ScriptedCapability {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            prompts: RefCell::new(Vec::new()),
            stats: false,
        }
    }

    pub fn with_stats(replies: Vec<Reply>) -> Self {
        Self {
            stats: true,
            ..Self::new(replies)
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    /// Panic if scripted replies were left unused.
    pub fn assert_drained(&self) {
        let left = self.replies.borrow().len();
        assert_eq!(left, 0, "{left} scripted replies were never requested");
    }

    fn next(&self, request: &AskRequest) -> Result<AskReply, CapabilityError> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        let Some(reply) = self.replies.borrow_mut().pop_front() else {
            panic!("unexpected capability call:\n{}", request.prompt);
        };
        if let Some((path, contents)) = &reply.writes {
            fs::write(path, contents).expect("write scripted side effect");
        }
        reply.result
    }
}

impl Capability for ScriptedCapability {
    fn ask(&self, request: &AskRequest) -> Result<String, CapabilityError> {
        self.next(request).map(|reply| reply.text)
    }

    fn with_stats(&self) -> Option<&dyn StatsCapability> {
        self.stats.then_some(self as &dyn StatsCapability)
    }
}

impl StatsCapability for ScriptedCapability {
    fn ask_with_stats(&self, request: &AskRequest) -> Result<AskReply, CapabilityError> {
        self.next(request)
    }
}

/// A plan step with a fixed reason and no approval flag.
pub fn step(id: &str, title: &str, risk: &str) -> PlanStep {
    PlanStep {
        id: id.to_string(),
        title: title.to_string(),
        reason: "planned".to_string(),
        risk: risk.to_string(),
        requires_approval: false,
    }
}

/// Serialize a plan the way a well-behaved capability would reply.
pub fn plan_json(goal: &str, steps: &[PlanStep]) -> String {
    let plan = Plan {
        goal: goal.to_string(),
        steps: steps.to_vec(),
    };
    serde_json::to_string_pretty(&plan).expect("serialize plan")
}
