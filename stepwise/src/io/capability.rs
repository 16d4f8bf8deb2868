//! Abstraction over the reasoning/execution backend.
//!
//! The [`Capability`] trait decouples the runner from the concrete backend
//! (currently a spawned process, see [`crate::io::backend`]). Tests use
//! scripted capabilities that return queued replies without spawning anything.
//!
//! Backends that can report tool-call counters expose them through the
//! optional [`StatsCapability`] interface, discovered via
//! [`Capability::with_stats`]. When it is absent the counters are reported as
//! unavailable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Per-call timeout used when a request carries a zero timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);
/// The enlarged timeout of a retried call never drops below this.
pub const MIN_RETRY_TIMEOUT: Duration = Duration::from_secs(60);
/// Attempts made while the backend reports it is busy.
pub const BUSY_MAX_ATTEMPTS: u32 = 8;
pub const BUSY_BACKOFF: Duration = Duration::from_millis(300);

/// Shared cancellation flag. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A single prompt sent to the capability.
#[derive(Debug, Clone)]
pub struct AskRequest {
    pub prompt: String,
    /// Deadline for this call.
    pub timeout: Duration,
    pub cancel: CancelToken,
}

impl AskRequest {
    pub fn new(prompt: impl Into<String>, timeout: Duration, cancel: CancelToken) -> Self {
        Self {
            prompt: prompt.into(),
            timeout,
            cancel,
        }
    }

    fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }
}

/// Reply text plus tool-call counters (`None` when not reported).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AskReply {
    pub text: String,
    pub tool_calls: Option<u32>,
    pub write_tool_calls: Option<u32>,
}

impl AskReply {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: None,
            write_tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("capability call timed out after {0:?}")]
    Timeout(Duration),
    /// The backend is still processing a previous prompt.
    #[error("capability busy: {0}")]
    Busy(String),
    #[error("capability call canceled")]
    Canceled,
    #[error("capability call failed: {0}")]
    Failed(String),
}

impl CapabilityError {
    /// Classify a backend failure message.
    pub fn from_message(message: &str) -> Self {
        let lower = message.trim().to_lowercase();
        if lower.contains("already streaming") || lower.contains("already processing") {
            return CapabilityError::Busy(message.trim().to_string());
        }
        if lower.contains("deadline exceeded") || lower.contains("timeout") {
            return CapabilityError::Timeout(Duration::ZERO);
        }
        CapabilityError::Failed(message.trim().to_string())
    }
}

pub trait Capability {
    fn ask(&self, request: &AskRequest) -> Result<String, CapabilityError>;

    /// Optional-capability discriminator for backends that report counters.
    fn with_stats(&self) -> Option<&dyn StatsCapability> {
        None
    }
}

pub trait StatsCapability {
    fn ask_with_stats(&self, request: &AskRequest) -> Result<AskReply, CapabilityError>;
}

/// Ask through the stats interface when available, else fall back to plain text.
pub fn ask_reporting<C: Capability + ?Sized>(
    capability: &C,
    request: &AskRequest,
) -> Result<AskReply, CapabilityError> {
    if request.cancel.is_canceled() {
        return Err(CapabilityError::Canceled);
    }
    match capability.with_stats() {
        Some(stats) => stats.ask_with_stats(request),
        None => capability.ask(request).map(AskReply::text_only),
    }
}

/// Wraps a capability with deadline and busy-retry handling.
///
/// - a timed-out call is retried once with `max(2 × timeout, 60s)`
/// - a busy backend is retried with a fixed backoff, up to [`BUSY_MAX_ATTEMPTS`],
///   all within the one call deadline
/// - every other failure is returned immediately
#[derive(Debug, Clone)]
pub struct Resilient<C> {
    inner: C,
    busy_backoff: Duration,
}

impl<C: Capability> Resilient<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            busy_backoff: BUSY_BACKOFF,
        }
    }

    pub fn with_busy_backoff(mut self, backoff: Duration) -> Self {
        self.busy_backoff = backoff;
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn with_deadline<T>(
        &self,
        request: &AskRequest,
        call: impl Fn(&AskRequest) -> Result<T, CapabilityError>,
    ) -> Result<T, CapabilityError> {
        let timeout = if request.timeout.is_zero() {
            DEFAULT_CALL_TIMEOUT
        } else {
            request.timeout
        };
        match self.with_busy_retry(&request.with_timeout(timeout), &call) {
            Err(CapabilityError::Timeout(_)) => {
                let retry_timeout = (timeout * 2).max(MIN_RETRY_TIMEOUT);
                warn!(
                    timeout_secs = timeout.as_secs(),
                    retry_timeout_secs = retry_timeout.as_secs(),
                    "capability call timed out, retrying with a longer deadline"
                );
                self.with_busy_retry(&request.with_timeout(retry_timeout), &call)
            }
            other => other,
        }
    }

    fn with_busy_retry<T>(
        &self,
        request: &AskRequest,
        call: &impl Fn(&AskRequest) -> Result<T, CapabilityError>,
    ) -> Result<T, CapabilityError> {
        let deadline = Instant::now() + request.timeout;
        let mut current = request.clone();
        let mut last = CapabilityError::Busy("no attempt made".to_string());
        for attempt in 1..=BUSY_MAX_ATTEMPTS {
            if request.cancel.is_canceled() {
                return Err(CapabilityError::Canceled);
            }
            match call(&current) {
                Err(err @ CapabilityError::Busy(_)) => {
                    debug!(attempt, "capability busy, backing off");
                    last = err;
                    thread::sleep(self.busy_backoff);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        debug!(attempt, "call deadline spent while backend was busy");
                        return Err(CapabilityError::Timeout(request.timeout));
                    }
                    current = request.with_timeout(remaining);
                }
                other => return other,
            }
        }
        Err(last)
    }
}

impl<C: Capability> Capability for Resilient<C> {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn ask(&self, request: &AskRequest) -> Result<String, CapabilityError> {
        self.with_deadline(request, |req| self.inner.ask(req))
    }

    fn with_stats(&self) -> Option<&dyn StatsCapability> {
        self.inner
            .with_stats()
            .map(|_| self as &dyn StatsCapability)
    }
}

impl<C: Capability> StatsCapability for Resilient<C> {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn ask_with_stats(&self, request: &AskRequest) -> Result<AskReply, CapabilityError> {
        let Some(stats) = self.inner.with_stats() else {
            return self.ask(request).map(AskReply::text_only);
        };
        self.with_deadline(request, |req| stats.ask_with_stats(req))
    }
}
