//! Capability backed by a spawned command (e.g. `gopi --print`).
//!
//! The prompt is written to the command's stdin and the reply is read from
//! stdout. With `reports_stats` enabled, stdout must be a JSON object
//! `{"text": ..., "tool_calls": n, "write_tool_calls": n}` and the backend
//! exposes [`StatsCapability`].

use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::io::capability::{AskReply, AskRequest, Capability, CapabilityError, StatsCapability};
use crate::io::config::BackendConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout};

#[derive(Debug, Deserialize)]
struct StatsPayload {
    text: String,
    #[serde(default)]
    tool_calls: Option<u32>,
    #[serde(default)]
    write_tool_calls: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: String,
    args: Vec<String>,
    workdir: PathBuf,
    output_limit_bytes: usize,
    reports_stats: bool,
}

impl ProcessBackend {
    pub fn new(config: &BackendConfig, workdir: PathBuf, output_limit_bytes: usize) -> Self {
        let (program, args) = config
            .command
            .split_first()
            .map(|(program, args)| (program.clone(), args.to_vec()))
            .unwrap_or_default();
        Self {
            program,
            args,
            workdir,
            output_limit_bytes,
            reports_stats: config.reports_stats,
        }
    }

    fn run(&self, request: &AskRequest) -> Result<String, CapabilityError> {
        if self.program.trim().is_empty() {
            return Err(CapabilityError::Failed(
                "backend command is not configured".to_string(),
            ));
        }
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
            &request.cancel,
        )
        .map_err(|err| CapabilityError::Failed(format!("invoke {}: {err:#}", self.program)))?;

        check_output(&self.program, &output, request)?;
        Ok(output.stdout_text())
    }
}

fn check_output(
    program: &str,
    output: &CommandOutput,
    request: &AskRequest,
) -> Result<(), CapabilityError> {
    if output.canceled {
        return Err(CapabilityError::Canceled);
    }
    if output.timed_out {
        warn!(timeout_secs = request.timeout.as_secs(), "{program} timed out");
        return Err(CapabilityError::Timeout(request.timeout));
    }
    if !output.status.success() {
        let stderr = output.stderr_text();
        let message = if stderr.is_empty() {
            format!("{program} exited with status {:?}", output.status.code())
        } else {
            stderr
        };
        warn!(exit_code = ?output.status.code(), "{program} failed");
        return Err(CapabilityError::from_message(&message));
    }
    Ok(())
}

impl Capability for ProcessBackend {
    #[instrument(skip_all, fields(program = %self.program))]
    fn ask(&self, request: &AskRequest) -> Result<String, CapabilityError> {
        info!(workdir = %self.workdir.display(), "invoking backend");
        let stdout = self.run(request)?;
        if self.reports_stats {
            return decode_stats(&stdout).map(|reply| reply.text);
        }
        Ok(stdout)
    }

    fn with_stats(&self) -> Option<&dyn StatsCapability> {
        self.reports_stats.then_some(self as &dyn StatsCapability)
    }
}

impl StatsCapability for ProcessBackend {
    #[instrument(skip_all, fields(program = %self.program))]
    fn ask_with_stats(&self, request: &AskRequest) -> Result<AskReply, CapabilityError> {
        info!(workdir = %self.workdir.display(), "invoking backend with stats");
        decode_stats(&self.run(request)?)
    }
}

fn decode_stats(stdout: &str) -> Result<AskReply, CapabilityError> {
    let payload: StatsPayload = serde_json::from_str(stdout)
        .map_err(|err| CapabilityError::Failed(format!("decode backend stats output: {err}")))?;
    Ok(AskReply {
        text: payload.text.trim().to_string(),
        tool_calls: payload.tool_calls,
        write_tool_calls: payload.write_tool_calls,
    })
}
