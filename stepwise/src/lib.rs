//! Phase-driven task agent.
//!
//! A [`runner::Runner`] turns one free-text request into a bounded sequence of
//! phases (read, plan, act, final) executed against an abstract
//! [`io::capability::Capability`], with per-step retries, approval gating for
//! risky steps, write verification and a persisted audit record per run.
//!
//! - **[`core`]**: Pure, deterministic logic (plan parsing and normalization,
//!   todo tracking, step classification). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (capability backends, filesystem
//!   verification, audit records, config, prompts).
//!
//! [`runner`] coordinates core logic with I/O; the `stepwise` binary wraps it
//! in a CLI.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod plan;
pub mod runner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
