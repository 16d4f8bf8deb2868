//! Agent configuration stored under `.stepwise/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::classifier::ClassifierRules;

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".stepwise/config.toml";

/// Agent configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values in [`AgentConfig::default`]; command-line flags override them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Attempts per act step before it is marked blocked.
    pub max_act_retries: u32,

    /// Deadline for a single capability call, in seconds.
    pub call_timeout_secs: u64,

    /// Directory for run audit records.
    pub audit_dir: PathBuf,

    /// Truncate backend stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    pub backend: BackendConfig,

    /// Extra classifier keywords, merged into the built-in tables.
    pub classifier: ClassifierRules,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Command that answers a prompt read from stdin (e.g. `["gopi","--print"]`).
    pub command: Vec<String>,
    /// Whether stdout is a JSON object carrying tool-call counters.
    pub reports_stats: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: vec!["gopi".to_string(), "--print".to_string()],
            reports_stats: false,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_act_retries: 2,
            call_timeout_secs: 300,
            audit_dir: PathBuf::from(".stepwise").join("runs"),
            output_limit_bytes: 1_000_000,
            backend: BackendConfig::default(),
            classifier: ClassifierRules {
                intent_confirmation: Vec::new(),
                local_probe: Vec::new(),
                persist: Vec::new(),
            },
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_act_retries == 0 {
            return Err(anyhow!("max_act_retries must be > 0"));
        }
        if self.call_timeout_secs == 0 {
            return Err(anyhow!("call_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.audit_dir.as_os_str().is_empty() {
            return Err(anyhow!("audit_dir must not be empty"));
        }
        if self.backend.command.is_empty() || self.backend.command[0].trim().is_empty() {
            return Err(anyhow!("backend.command must be a non-empty array"));
        }
        Ok(())
    }

    /// Built-in classifier keywords extended with the configured ones.
    pub fn classifier_rules(&self) -> ClassifierRules {
        let mut rules = ClassifierRules::default();
        rules.extend(&self.classifier);
        rules
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
