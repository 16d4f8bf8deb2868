//! Keyword heuristics that decide how a plan step is handled.
//!
//! The keyword tables live in [`ClassifierRules`] so they can be extended from
//! configuration without touching the runner. Matching is case-insensitive
//! substring search over `title + " " + reason`.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::plan::PlanStep;

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_\-./\\]*[A-Za-z0-9_\-]\.[A-Za-z0-9]{1,16}$")
        .expect("path regex is valid")
});

/// Bilingual keyword tables for step classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierRules {
    /// Phrases meaning "confirm the user's intent or requirement".
    pub intent_confirmation: Vec<String>,
    /// Phrases meaning "check the working directory or whether files exist".
    pub local_probe: Vec<String>,
    /// Phrases meaning "persist something to disk".
    pub persist: Vec<String>,
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            intent_confirmation: strings(&[
                "确认用户意图",
                "确认用户需求",
                "确认需求",
                "确认意图",
                "明确需求",
                "澄清需求",
                "理解用户需求",
                "confirm user intent",
                "confirm the user's intent",
                "confirm intent",
                "confirm requirement",
                "clarify requirement",
                "clarify the request",
            ]),
            local_probe: strings(&[
                "检查当前目录",
                "检查工作目录",
                "查看当前目录",
                "查看工作目录",
                "检查文件是否存在",
                "确认文件是否存在",
                "文件是否存在",
                "check working directory",
                "check the working directory",
                "check current directory",
                "inspect working directory",
                "check file exists",
                "check whether the file exists",
                "check if the file exists",
                "verify file existence",
            ]),
            persist: strings(&[
                "写入",
                "保存",
                "落盘",
                "写到",
                "创建文件",
                "生成文件",
                "输出到文件",
                "write to",
                "write file",
                "write the file",
                "save to",
                "save the file",
                "create file",
                "create the file",
                "persist",
            ]),
        }
    }
}

impl ClassifierRules {
    /// Append `other`'s keywords, skipping ones already present.
    pub fn extend(&mut self, other: &ClassifierRules) {
        merge(&mut self.intent_confirmation, &other.intent_confirmation);
        merge(&mut self.local_probe, &other.local_probe);
        merge(&mut self.persist, &other.persist);
    }

    pub fn is_intent_confirmation(&self, step: &PlanStep) -> bool {
        contains_any(&step.classifier_text(), &self.intent_confirmation)
    }

    pub fn is_local_probe(&self, step: &PlanStep) -> bool {
        contains_any(&step.classifier_text(), &self.local_probe)
    }

    /// A step must produce verifiable files when it names a file itself, or
    /// when the run requested files and the step talks about persisting.
    pub fn is_strict_write(&self, step: &PlanStep, run_files: &[String]) -> bool {
        let text = step.classifier_text();
        if !detect_file_paths(&text).is_empty() {
            return true;
        }
        !run_files.is_empty() && contains_any(&text, &self.persist)
    }
}

/// Detect path-like tokens (`name.ext`, `dir/name.ext`) in free text.
///
/// Tokens containing a URL scheme separator are ignored, as are version
/// numbers (`3.12`) and dotted abbreviations (`e.g.`). Results are
/// deduplicated in first-seen order.
pub fn detect_file_paths(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for token in text.split(|c: char| !is_path_char(c)) {
        if token.contains("://") {
            continue;
        }
        let token = token.trim_start_matches(':').trim_end_matches(['.', ':']);
        if !PATH_RE.is_match(token) || !has_file_name_shape(token) || !seen.insert(token) {
            continue;
        }
        out.push(token.to_string());
    }
    out
}

/// The extension needs a letter, and a one-letter stem needs a longer extension.
fn has_file_name_shape(token: &str) -> bool {
    let name = token.rsplit(['/', '\\']).next().unwrap_or(token);
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    if !ext.chars().any(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    let stem = stem.trim_start_matches('.');
    stem.chars().count() > 1 || ext.chars().count() > 1
}

/// Characters that may appear inside a path token. `:` is kept so that
/// scheme separators stay attached to their URL.
fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '\\' | ':')
}

fn contains_any(text: &str, keywords: &[String]) -> bool {
    let haystack = text.to_lowercase();
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .any(|k| !k.is_empty() && haystack.contains(&k))
}

fn merge(into: &mut Vec<String>, extra: &[String]) {
    for keyword in extra {
        if !into.iter().any(|k| k.eq_ignore_ascii_case(keyword)) {
            into.push(keyword.clone());
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
