//! Phase-driven task agent CLI.
//!
//! Each task goes through read, plan, act and final phases against a
//! configured backend command. Every completed run leaves an audit record
//! under the audit directory (`.stepwise/runs` by default).

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use stepwise::core::todo::EMPTY_TODOS;
use stepwise::core::types::{ProgressEvent, render_action_logs};
use stepwise::exit_codes;
use stepwise::io::audit::{AuditSummary, list_audit_files, load_audit};
use stepwise::io::backend::ProcessBackend;
use stepwise::io::capability::{Capability, Resilient};
use stepwise::io::config::{AgentConfig, DEFAULT_CONFIG_PATH, load_config, write_config};
use stepwise::logging;
use stepwise::plan::PlanStep;
use stepwise::runner::{
    DEFAULT_MAX_ACT_RETRIES, InvalidPlanError, RunOutcome, Runner, RunnerOptions,
};

#[derive(Parser)]
#[command(
    name = "stepwise",
    version,
    about = "Read, plan, act: a phase-driven task agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `.stepwise/config.toml` if missing.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
        /// Config file to write.
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Run tasks: one per stdin line, or a single `--task`.
    Run(RunArgs),
    /// Inspect stored run audits.
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Working directory for the backend and file checks (default: current directory).
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Per-call timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,
    /// Approve high-risk steps without asking.
    #[arg(long)]
    auto_approve: bool,
    /// Attempts per act step (0 selects the default).
    #[arg(long)]
    max_retries: Option<u32>,
    /// Directory for run audit records.
    #[arg(long)]
    audit_dir: Option<PathBuf>,
    /// Config file (default: `<cwd>/.stepwise/config.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run this task once and exit with a status code instead of reading stdin.
    #[arg(long)]
    task: Option<String>,
}

#[derive(Args)]
struct AuditLocation {
    /// Directory holding run audit records (default: from config).
    #[arg(long)]
    audit_dir: Option<PathBuf>,
    /// Config file consulted for the audit directory.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum AuditCommand {
    /// List audit files, most recent first.
    List(AuditLocation),
    /// Summarize one audit file.
    Show {
        #[command(flatten)]
        location: AuditLocation,
        /// Which audit to show; 1 is the most recent.
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        index: u32,
        /// Print the raw JSON instead of a summary.
        #[arg(long)]
        full: bool,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force, config } => cmd_init(&config, force),
        Command::Run(args) => cmd_run(args),
        Command::Audit { command } => match command {
            AuditCommand::List(location) => cmd_audit_list(&location),
            AuditCommand::Show {
                location,
                index,
                full,
            } => cmd_audit_show(&location, index, full),
        },
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(path, &AgentConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let working_dir = match &args.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| working_dir.join(DEFAULT_CONFIG_PATH));
    let config = load_config(&config_path)?;
    let options = runner_options(&args, &config, &working_dir);

    let backend = ProcessBackend::new(
        &config.backend,
        working_dir.clone(),
        config.output_limit_bytes,
    );
    let mut runner = Runner::new(Resilient::new(backend), options).with_progress(print_progress);
    if args.auto_approve {
        runner = runner.with_approver(|_: &PlanStep| -> Result<bool> { Ok(true) });
    } else {
        runner = runner.with_approver(ask_approval);
    }

    if let Some(task) = &args.task {
        return Ok(run_once(&runner, task));
    }
    repl(&runner)?;
    Ok(exit_codes::OK)
}

/// Merge CLI flags over config values. Relative config paths resolve against the working directory.
fn runner_options(args: &RunArgs, config: &AgentConfig, working_dir: &Path) -> RunnerOptions {
    let max_act_retries = match args.max_retries {
        Some(0) => DEFAULT_MAX_ACT_RETRIES,
        Some(n) => n,
        None => config.max_act_retries,
    };
    let call_timeout = Duration::from_secs(args.timeout.unwrap_or(config.call_timeout_secs));
    let audit_dir = args
        .audit_dir
        .clone()
        .unwrap_or_else(|| working_dir.join(&config.audit_dir));
    RunnerOptions {
        max_act_retries,
        audit_dir,
        working_dir: working_dir.to_path_buf(),
        call_timeout,
        rules: config.classifier_rules(),
    }
}

fn run_once<C: Capability>(runner: &Runner<C>, task: &str) -> i32 {
    match runner.run(task) {
        Ok(outcome) => {
            print_outcome(&outcome);
            if outcome.blocked_step().is_some() {
                exit_codes::INCOMPLETE
            } else {
                exit_codes::OK
            }
        }
        Err(err) => {
            eprintln!("error: {:#}", err);
            if err.downcast_ref::<InvalidPlanError>().is_some() {
                exit_codes::INVALID_PLAN
            } else {
                exit_codes::FAILED
            }
        }
    }
}

fn repl<C: Capability>(runner: &Runner<C>) -> Result<()> {
    println!("stepwise (read-plan-act) ready. 输入你的任务，Ctrl+D 退出。");
    let stdin = io::stdin();
    loop {
        print!("\n> ");
        io::stdout().flush().context("flush stdout")?;
        let mut line = String::new();
        // The lock is released between reads so the approver can read stdin too.
        if stdin.read_line(&mut line).context("read task")? == 0 {
            println!("\nbye");
            return Ok(());
        }
        let task = line.trim();
        if task.is_empty() {
            continue;
        }
        match runner.run(task) {
            Ok(outcome) => print_outcome(&outcome),
            Err(err) => eprintln!("error: {:#}", err),
        }
    }
}

fn ask_approval(step: &PlanStep) -> Result<bool> {
    print!(
        "\n[APPROVAL] step={} risk={}\n{}\n批准执行? (y/N): ",
        step.id, step.risk, step.title
    );
    io::stdout().flush().context("flush stdout")?;
    let mut line = String::new();
    if io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read approval")?
        == 0
    {
        bail!("stdin closed while waiting for approval of step {}", step.id);
    }
    Ok(is_approval(&line))
}

fn is_approval(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn print_progress(event: &ProgressEvent) {
    println!("\n{}", progress_line(event));
    let todos = event.todo_text.trim();
    if !todos.is_empty() && todos != EMPTY_TODOS {
        println!("{todos}");
    }
}

fn progress_line(event: &ProgressEvent) -> String {
    let phase = event.phase.as_str().to_uppercase();
    let message = event.message.trim();
    if event.total_steps > 0 {
        format!(
            "[{phase}] {message} ({}/{})",
            event.completed, event.total_steps
        )
    } else {
        format!("[{phase}] {message}")
    }
}

fn print_outcome(outcome: &RunOutcome) {
    println!("\n[READ]");
    println!("{}", outcome.read_summary);
    println!("\n[PLAN]");
    println!("Goal: {}", outcome.plan.goal);
    for (idx, step) in outcome.plan.steps.iter().enumerate() {
        println!(
            "{}. ({}) {} [risk={} approval={}]",
            idx + 1,
            step.id,
            step.title,
            step.risk,
            step.requires_approval
        );
    }
    println!("\n[TODOS]");
    println!("{}", outcome.todo_text);
    println!("\n[ACTION]");
    println!("{}", render_action_logs(&outcome.action_logs));
    println!("\n[FINAL]");
    println!("{}", outcome.final_answer);
    if let Some(path) = &outcome.audit_path {
        println!("\n[AUDIT]\n{}", path.display());
    }
}

fn resolve_audit_dir(location: &AuditLocation) -> Result<PathBuf> {
    if let Some(dir) = &location.audit_dir {
        return Ok(dir.clone());
    }
    Ok(load_config(&location.config)?.audit_dir)
}

fn cmd_audit_list(location: &AuditLocation) -> Result<i32> {
    let dir = resolve_audit_dir(location)?;
    if !dir.exists() {
        println!("(no audit directory) {}", dir.display());
        return Ok(exit_codes::OK);
    }
    let files = list_audit_files(&dir)?;
    if files.is_empty() {
        println!("(no audit files) {}", dir.display());
        return Ok(exit_codes::OK);
    }
    for (idx, file) in files.iter().enumerate() {
        println!("{}. {}", idx + 1, file.name);
    }
    Ok(exit_codes::OK)
}

fn cmd_audit_show(location: &AuditLocation, index: u32, full: bool) -> Result<i32> {
    let dir = resolve_audit_dir(location)?;
    if !dir.exists() {
        println!("[AUDIT]\n(no audit directory) {}", dir.display());
        return Ok(exit_codes::OK);
    }
    let files = list_audit_files(&dir)?;
    if files.is_empty() {
        println!("[AUDIT]\n(no audit files) {}", dir.display());
        return Ok(exit_codes::OK);
    }
    let Some(target) = files.get(index as usize - 1) else {
        bail!(
            "audit index {index} out of range, available={}",
            files.len()
        );
    };

    if full {
        let raw = fs::read_to_string(&target.path)
            .with_context(|| format!("read {}", target.path.display()))?;
        println!("[AUDIT FULL]\n{}\n{}", target.path.display(), raw.trim_end());
        return Ok(exit_codes::OK);
    }

    let audit = load_audit(&target.path)?;
    println!("[AUDIT]\n{}", target.path.display());
    println!("{}", AuditSummary::from_audit(&audit).render());
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise::core::types::Phase;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["stepwise", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false, .. }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["stepwise", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true, .. }));
    }

    #[test]
    fn parse_run_flags() {
        let cli = Cli::parse_from([
            "stepwise",
            "run",
            "--cwd",
            "/tmp/work",
            "--timeout",
            "30",
            "--auto-approve",
            "--max-retries",
            "4",
            "--task",
            "整理笔记",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.cwd, Some(PathBuf::from("/tmp/work")));
        assert_eq!(args.timeout, Some(30));
        assert!(args.auto_approve);
        assert_eq!(args.max_retries, Some(4));
        assert_eq!(args.task.as_deref(), Some("整理笔记"));
    }

    #[test]
    fn audit_show_rejects_index_zero() {
        assert!(Cli::try_parse_from(["stepwise", "audit", "show", "--index", "0"]).is_err());
        let cli = Cli::parse_from(["stepwise", "audit", "show", "--full"]);
        assert!(matches!(
            cli.command,
            Command::Audit {
                command: AuditCommand::Show {
                    index: 1,
                    full: true,
                    ..
                }
            }
        ));
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from(["stepwise", "run", "--max-retries", "0", "--timeout", "9"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = AgentConfig {
            max_act_retries: 5,
            ..AgentConfig::default()
        };
        let options = runner_options(&args, &config, Path::new("/work"));
        assert_eq!(options.max_act_retries, DEFAULT_MAX_ACT_RETRIES);
        assert_eq!(options.call_timeout, Duration::from_secs(9));
        assert_eq!(options.audit_dir, Path::new("/work").join(".stepwise/runs"));
        assert_eq!(options.working_dir, PathBuf::from("/work"));
    }

    #[test]
    fn config_values_apply_without_flags() {
        let cli = Cli::parse_from(["stepwise", "run", "--audit-dir", "audits"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = AgentConfig {
            max_act_retries: 5,
            call_timeout_secs: 42,
            ..AgentConfig::default()
        };
        let options = runner_options(&args, &config, Path::new("/work"));
        assert_eq!(options.max_act_retries, 5);
        assert_eq!(options.call_timeout, Duration::from_secs(42));
        assert_eq!(options.audit_dir, PathBuf::from("audits"));
    }

    #[test]
    fn approval_accepts_only_yes() {
        assert!(is_approval("y\n"));
        assert!(is_approval(" YES "));
        assert!(!is_approval("n"));
        assert!(!is_approval(""));
        assert!(!is_approval("yep"));
    }

    #[test]
    fn progress_line_includes_counts_when_steps_known() {
        let mut event = ProgressEvent {
            phase: Phase::Act,
            message: "s1 读取文件 ".to_string(),
            total_steps: 3,
            completed: 1,
            todo_text: EMPTY_TODOS.to_string(),
        };
        assert_eq!(progress_line(&event), "[ACT] s1 读取文件 (1/3)");
        event.phase = Phase::Read;
        event.total_steps = 0;
        assert_eq!(progress_line(&event), "[READ] s1 读取文件");
    }
}
