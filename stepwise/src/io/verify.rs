//! On-disk verification of files a step was expected to produce.
//!
//! The capability's claim of success is not trusted for strict write steps:
//! the runner checks the files exist and, when they don't, explains why using
//! the tool-call counters the capability reported.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Resolve `path` against `working_dir` unless it is already absolute.
pub fn resolve(path: &str, working_dir: &Path) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        working_dir.join(candidate)
    }
}

/// Return every expected path whose existence check fails, in input order.
pub fn missing_files(expected: &[String], working_dir: &Path) -> Vec<String> {
    let missing: Vec<String> = expected
        .iter()
        .filter(|path| fs::metadata(resolve(path, working_dir)).is_err())
        .cloned()
        .collect();
    debug!(expected = expected.len(), missing = missing.len(), "verified expected files");
    missing
}

/// Explain a failed write verification.
///
/// `tool_calls` / `write_tool_calls` are `None` when the capability does not
/// report counters.
pub fn failure_reason(
    missing: &[String],
    tool_calls: Option<u32>,
    write_tool_calls: Option<u32>,
) -> String {
    let files = missing.join(", ");
    let (Some(tool_calls), Some(write_tool_calls)) = (tool_calls, write_tool_calls) else {
        return format!(
            "expected files missing: {files}; tool call counters unavailable, cannot tell whether a write was attempted"
        );
    };
    if tool_calls == 0 && write_tool_calls == 0 {
        return format!("expected files missing: {files}; no tool invocation observed");
    }
    if write_tool_calls == 0 {
        return format!(
            "expected files missing: {files}; tool invoked but no write call observed (tool_calls={tool_calls}, write_tool_calls=0)"
        );
    }
    format!(
        "expected files missing: {files}; write tool invoked (write_tool_calls={write_tool_calls}) but target still absent, possible path mismatch or silent write failure"
    )
}

/// Human-readable existence report used by local probe steps.
pub fn existence_summary(paths: &[String], working_dir: &Path) -> String {
    if paths.is_empty() {
        let state = if working_dir.is_dir() {
            "exists"
        } else {
            "missing"
        };
        return format!("working directory {} {state}", working_dir.display());
    }
    let lines: Vec<String> = paths
        .iter()
        .map(|path| {
            let resolved = resolve(path, working_dir);
            let state = match fs::metadata(&resolved) {
                Ok(meta) if meta.is_dir() => "exists (directory)",
                Ok(_) => "exists",
                Err(_) => "missing",
            };
            format!("{path}: {state} ({})", resolved.display())
        })
        .collect();
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_resolves_relative_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("present.txt"), "x").expect("write");
        let absolute = temp.path().join("abs.txt");
        fs::write(&absolute, "x").expect("write");

        let expected = vec![
            "present.txt".to_string(),
            "absent.txt".to_string(),
            absolute.display().to_string(),
        ];
        assert_eq!(missing_files(&expected, temp.path()), vec!["absent.txt"]);
    }

    #[test]
    fn reason_without_counters() {
        let reason = failure_reason(&["a.py".to_string()], None, None);
        assert!(reason.contains("a.py"));
        assert!(reason.contains("counters unavailable"));
    }

    #[test]
    fn reason_without_any_tool_call() {
        let reason = failure_reason(&["a.py".to_string()], Some(0), Some(0));
        assert!(reason.contains("no tool invocation observed"));
    }

    #[test]
    fn reason_with_tools_but_no_write() {
        let reason = failure_reason(&["sort.py".to_string()], Some(2), Some(0));
        assert!(reason.contains("tool invoked but no write call observed"));
        assert!(reason.contains("sort.py"));
    }

    #[test]
    fn reason_with_write_but_missing_target() {
        let reason = failure_reason(&["a.py".to_string(), "b.py".to_string()], Some(3), Some(1));
        assert!(reason.contains("a.py, b.py"));
        assert!(reason.contains("possible path mismatch"));
    }

    #[test]
    fn existence_summary_reports_each_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("here.md"), "x").expect("write");
        let summary = existence_summary(
            &["here.md".to_string(), "gone.md".to_string()],
            temp.path(),
        );
        let lines: Vec<&str> = summary.lines().collect();
        assert!(lines[0].starts_with("here.md: exists"));
        assert!(lines[1].starts_with("gone.md: missing"));
    }

    #[test]
    fn existence_summary_without_paths_checks_working_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let summary = existence_summary(&[], temp.path());
        assert!(summary.ends_with("exists"));
    }
}
