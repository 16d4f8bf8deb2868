use serde::{Deserialize, Deserializer, Serialize};

/// Goal used when the capability produced no usable goal.
pub const DEFAULT_GOAL: &str = "完成用户请求";

/// Reason assigned to steps whose reason was blank.
pub const DEFAULT_REASON: &str = "根据规划执行";

/// Reason assigned to steps recovered from a bullet list.
pub const FALLBACK_REASON: &str = "fallback from bullets";

/// Risk levels a normalized step may carry.
pub const RISK_LEVELS: [&str; 3] = ["low", "medium", "high"];

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanStep {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub reason: String,
    /// Free text until normalization; afterwards one of [`RISK_LEVELS`].
    #[serde(default, deserialize_with = "null_as_default")]
    pub risk: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub requires_approval: bool,
}

impl PlanStep {
    pub fn is_high_risk(&self) -> bool {
        self.risk.eq_ignore_ascii_case("high")
    }

    /// Whether the approval callback must be consulted before acting.
    pub fn needs_approval(&self) -> bool {
        self.is_high_risk() || self.requires_approval
    }

    /// Text the classifier heuristics look at.
    pub fn classifier_text(&self) -> String {
        format!("{} {}", self.title, self.reason)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    #[serde(default, deserialize_with = "null_as_default")]
    pub goal: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub steps: Vec<PlanStep>,
}

/// Decode `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
