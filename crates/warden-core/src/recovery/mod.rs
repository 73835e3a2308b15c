//! Failure classification and bounded recovery.
//!
//! Every failure raised anywhere in the core maps onto exactly one
//! [`ErrorType`] — the taxonomy is flat and exhaustive, so callers and
//! monitoring never meet an unclassified error. Each type carries a
//! registered [`RetryPolicy`]; [`execute_with_recovery`] drives the bounded
//! retry loop (an explicit loop with accumulated attempt state, never
//! recursion) and surfaces an [`ErrorRecord`] when the budget is exhausted.
//!
//! Two rules are absolute:
//!
//! - Validation and security-violation failures are never retried. They mean
//!   a caller bug or an attack, not a transient fault.
//! - The terminal error always reports how many attempts were made, so a
//!   caller can tell "never worked" from "degraded after N tries".
//!
//! The [`CircuitBreaker`] lives in [`circuit`] and guards operations bound
//! to one external dependency.

mod circuit;

pub use circuit::{CircuitBreaker, CircuitError, CircuitState};

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::lock::LockError;
use crate::sandbox::{KilledBy, SandboxError, SandboxResult};
use crate::store::StoreError;
use crate::validate::ValidationError;

/// Ceiling applied to any computed backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// The flat failure taxonomy. Every raised failure maps to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// The rate governor denied admission.
    RateLimited,
    /// A resource limit (memory, fuel, quota) was exhausted.
    ResourceExhausted,
    /// Lost a race for a lock or hit reader/writer contention.
    ConcurrencyConflict,
    /// A payload ran past its wall-clock timeout.
    CommandTimeout,
    /// An input matched an attack pattern or escaped containment.
    SecurityViolation,
    /// An input failed shape, length, or range validation.
    ValidationError,
    /// Anything that fits no other kind.
    Unknown,
}

impl ErrorType {
    /// Whether the recovery layer may retry this kind at all.
    #[must_use]
    pub const fn retryable(self) -> bool {
        !matches!(self, Self::SecurityViolation | Self::ValidationError)
    }

    /// Default severity for records of this kind.
    #[must_use]
    pub const fn default_severity(self) -> Severity {
        match self {
            Self::RateLimited => Severity::Info,
            Self::ConcurrencyConflict | Self::CommandTimeout => Severity::Warning,
            Self::ResourceExhausted | Self::Unknown => Severity::Error,
            Self::SecurityViolation | Self::ValidationError => Severity::Critical,
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RateLimited => "rate_limited",
            Self::ResourceExhausted => "resource_exhausted",
            Self::ConcurrencyConflict => "concurrency_conflict",
            Self::CommandTimeout => "command_timeout",
            Self::SecurityViolation => "security_violation",
            Self::ValidationError => "validation_error",
            Self::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Severity attached to an [`ErrorRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Expected operational noise.
    Info,
    /// Degraded but self-healing.
    Warning,
    /// Needs attention.
    Error,
    /// Caller bug or attack.
    Critical,
}

/// Maps any core failure onto the taxonomy.
pub trait Classify {
    /// The single kind this failure belongs to.
    fn error_type(&self) -> ErrorType;

    /// Severity for records of this failure. Defaults to the kind's default.
    fn severity(&self) -> Severity {
        self.error_type().default_severity()
    }
}

impl Classify for ValidationError {
    fn error_type(&self) -> ErrorType {
        match self {
            // Attack patterns are violations; honest shape mistakes are not.
            Self::ShellMetacharacter { .. }
            | Self::PathTraversal { .. }
            | Self::InjectionPattern { .. }
            | Self::ControlByte { .. } => ErrorType::SecurityViolation,
            _ => ErrorType::ValidationError,
        }
    }
}

impl Classify for StoreError {
    fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidKey(inner) => inner.error_type(),
            Self::NotACounter { .. } => ErrorType::ValidationError,
            _ => ErrorType::Unknown,
        }
    }
}

impl Classify for LockError {
    fn error_type(&self) -> ErrorType {
        match self {
            Self::Timeout { .. }
            | Self::WriteBlockedByReaders { .. }
            | Self::ReadBlockedByWriter { .. }
            | Self::NotHeld { .. }
            | Self::Expired { .. } => ErrorType::ConcurrencyConflict,
            Self::InvalidResource(inner) => inner.error_type(),
            Self::Store(inner) => inner.error_type(),
        }
    }
}

impl Classify for SandboxError {
    fn error_type(&self) -> ErrorType {
        match self {
            Self::RateLimited { .. } => ErrorType::RateLimited,
            Self::Invalid(inner) => inner.error_type(),
            Self::PayloadMismatch { .. } => ErrorType::ValidationError,
            _ => ErrorType::Unknown,
        }
    }
}

/// Classifies a finished [`SandboxResult`], which is a value, not an error:
/// a kill becomes a taxonomy kind, a plain non-zero exit does not.
#[must_use]
pub const fn classify_result(result: &SandboxResult) -> Option<ErrorType> {
    match result.killed_by {
        KilledBy::Timeout => Some(ErrorType::CommandTimeout),
        KilledBy::Limit => Some(ErrorType::ResourceExhausted),
        KilledBy::None => None,
    }
}

/// Retry behavior registered for one error kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Multiplier applied per further attempt.
    pub backoff_multiplier: f64,
    /// Whether to randomize each delay by ±50%.
    pub jitter: bool,
    /// Whether the cleanup hook runs before each retry.
    pub cleanup_required: bool,
}

impl RetryPolicy {
    /// No retries at all.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter: false,
            cleanup_required: false,
        }
    }

    /// Computes the backoff delay after the given failed attempt (1-based),
    /// capped at [`MAX_BACKOFF`].
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_possible_wrap)] // attempt counts stay tiny
        let exponent = attempt.saturating_sub(1) as i32;
        let delay_ms = (self.base_delay_ms as f64) * self.backoff_multiplier.powi(exponent);
        let delay = Duration::from_millis(delay_ms as u64).min(MAX_BACKOFF);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            delay.mul_f64(factor).min(MAX_BACKOFF)
        } else {
            delay
        }
    }
}

/// Per-kind policy table.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<ErrorType, RetryPolicy>,
    default_policy: RetryPolicy,
}

impl PolicyRegistry {
    /// Builds the documented default table from the recovery configuration.
    #[must_use]
    pub fn with_defaults(config: &RecoveryConfig) -> Self {
        let base = RetryPolicy {
            max_attempts: config.retry_attempts,
            base_delay_ms: config.retry_delay_ms,
            backoff_multiplier: 2.0,
            jitter: false,
            cleanup_required: false,
        };

        let mut policies = HashMap::new();
        policies.insert(
            ErrorType::RateLimited,
            RetryPolicy {
                jitter: true,
                ..base.clone()
            },
        );
        policies.insert(
            ErrorType::ConcurrencyConflict,
            RetryPolicy {
                jitter: true,
                ..base.clone()
            },
        );
        policies.insert(ErrorType::CommandTimeout, base.clone());
        policies.insert(
            ErrorType::ResourceExhausted,
            RetryPolicy {
                cleanup_required: true,
                ..base.clone()
            },
        );
        policies.insert(ErrorType::SecurityViolation, RetryPolicy::none());
        policies.insert(ErrorType::ValidationError, RetryPolicy::none());
        policies.insert(
            ErrorType::Unknown,
            RetryPolicy {
                max_attempts: base.max_attempts.min(2),
                ..base
            },
        );

        Self {
            policies,
            default_policy: RetryPolicy::none(),
        }
    }

    /// Replaces the policy for one kind.
    pub fn set(&mut self, error_type: ErrorType, policy: RetryPolicy) {
        self.policies.insert(error_type, policy);
    }

    /// The policy registered for a kind.
    #[must_use]
    pub fn policy(&self, error_type: ErrorType) -> &RetryPolicy {
        self.policies.get(&error_type).unwrap_or(&self.default_policy)
    }
}

/// Accumulated history of one recovery-eligible operation's failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unique record id.
    pub id: Uuid,
    /// Classification of the most recent failure.
    pub error_type: ErrorType,
    /// Severity of the most recent failure.
    pub severity: Severity,
    /// Message of the most recent failure.
    pub message: String,
    /// Operation name supplied by the caller.
    pub context: String,
    /// When the first failure occurred.
    pub timestamp: DateTime<Utc>,
    /// Attempts made so far.
    pub attempts: u32,
}

impl ErrorRecord {
    fn new(context: &str, error_type: ErrorType, severity: Severity, message: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            error_type,
            severity,
            message,
            context: context.to_string(),
            timestamp: Utc::now(),
            attempts: 0,
        }
    }

    /// Renders the record as a JSON object for callers that forward terminal
    /// failures to their own reporting.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "error_type": self.error_type.to_string(),
                "attempts": self.attempts,
            })
        })
    }
}

/// Terminal failure after the retry budget is exhausted (or for kinds that
/// are never retried).
#[derive(Debug, Error)]
#[error("{} failed terminally after {} attempt(s): {} ({})",
    .record.context, .record.attempts, .record.message, .record.error_type)]
pub struct TerminalError {
    /// Full attempt history.
    pub record: ErrorRecord,
}

/// Runs `operation` under the registered retry policy for whatever kind each
/// failure classifies to.
///
/// # Errors
///
/// Returns a [`TerminalError`] carrying the accumulated [`ErrorRecord`] once
/// the applicable policy's budget is exhausted, or immediately for
/// non-retryable kinds.
pub async fn execute_with_recovery<T, E, F, Fut>(
    operation_name: &str,
    registry: &PolicyRegistry,
    operation: F,
) -> Result<T, TerminalError>
where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    execute_with_recovery_full(operation_name, registry, operation, None).await
}

/// [`execute_with_recovery`] with a cleanup hook, run before each retry when
/// the failure kind's policy demands it (dropping caches, forcing resource
/// reclamation).
///
/// # Errors
///
/// Same contract as [`execute_with_recovery`].
pub async fn execute_with_recovery_full<T, E, F, Fut>(
    operation_name: &str,
    registry: &PolicyRegistry,
    mut operation: F,
    cleanup: Option<&(dyn Fn() + Send + Sync)>,
) -> Result<T, TerminalError>
where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut record: Option<ErrorRecord> = None;

    loop {
        match operation().await {
            Ok(value) => {
                if let Some(record) = record {
                    debug!(
                        operation = operation_name,
                        attempts = record.attempts,
                        "operation recovered"
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                let error_type = err.error_type();
                let severity = err.severity();
                let message = err.to_string();

                let record = record.get_or_insert_with(|| {
                    ErrorRecord::new(operation_name, error_type, severity, message.clone())
                });
                record.attempts += 1;
                record.error_type = error_type;
                record.severity = severity;
                record.message = message;

                let policy = registry.policy(error_type);
                let exhausted = record.attempts >= policy.max_attempts;
                if !error_type.retryable() || exhausted {
                    warn!(
                        operation = operation_name,
                        error_type = %error_type,
                        attempts = record.attempts,
                        "operation failed terminally"
                    );
                    return Err(TerminalError {
                        record: record.clone(),
                    });
                }

                if policy.cleanup_required {
                    if let Some(cleanup) = cleanup {
                        debug!(operation = operation_name, "running cleanup hook before retry");
                        cleanup();
                    }
                }

                let delay = policy.delay_for_attempt(record.attempts);
                debug!(
                    operation = operation_name,
                    error_type = %error_type,
                    attempt = record.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn registry() -> PolicyRegistry {
        PolicyRegistry::with_defaults(&RecoveryConfig {
            retry_attempts: 3,
            retry_delay_ms: 1,
            ..RecoveryConfig::default()
        })
    }

    #[derive(Debug)]
    struct FakeError(ErrorType);

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake {} failure", self.0)
        }
    }

    impl Classify for FakeError {
        fn error_type(&self) -> ErrorType {
            self.0
        }
    }

    #[tokio::test]
    async fn always_failing_operation_is_attempted_exactly_max_times() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let err = execute_with_recovery("always-fails", &registry(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FakeError(ErrorType::ConcurrencyConflict))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(err.record.attempts, 3);
        assert_eq!(err.record.error_type, ErrorType::ConcurrencyConflict);
    }

    #[tokio::test]
    async fn recovers_when_a_later_attempt_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let value = execute_with_recovery("flaky", &registry(), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FakeError(ErrorType::RateLimited))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn validation_failures_are_never_retried() {
        for error_type in [ErrorType::ValidationError, ErrorType::SecurityViolation] {
            let attempts = Arc::new(AtomicU32::new(0));
            let counter = Arc::clone(&attempts);

            let err = execute_with_recovery("rejected", &registry(), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FakeError(error_type))
                }
            })
            .await
            .unwrap_err();

            assert_eq!(attempts.load(Ordering::SeqCst), 1, "{error_type} retried");
            assert_eq!(err.record.attempts, 1);
        }
    }

    #[tokio::test]
    async fn cleanup_hook_runs_for_resource_exhaustion() {
        let cleanups = Arc::new(AtomicU32::new(0));
        let cleanup_counter = Arc::clone(&cleanups);
        let cleanup = move || {
            cleanup_counter.fetch_add(1, Ordering::SeqCst);
        };

        let _ = execute_with_recovery_full(
            "exhausted",
            &registry(),
            || async { Err::<(), _>(FakeError(ErrorType::ResourceExhausted)) },
            Some(&cleanup),
        )
        .await;

        // Three attempts, cleanup before retry two and three.
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            jitter: false,
            cleanup_required: false,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(30), MAX_BACKOFF);
    }

    #[test]
    fn jittered_backoff_stays_near_the_nominal_delay() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            backoff_multiplier: 1.0,
            jitter: true,
            cleanup_required: false,
        };

        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[test]
    fn classification_covers_module_errors() {
        assert_eq!(
            ValidationError::PathTraversal {
                index: 0,
                snippet: "../".to_string()
            }
            .error_type(),
            ErrorType::SecurityViolation
        );
        assert_eq!(
            ValidationError::OutOfRange {
                name: "timeout_ms".to_string(),
                value: 0,
                min: 1,
                max: 10,
            }
            .error_type(),
            ErrorType::ValidationError
        );
        assert_eq!(
            LockError::Timeout {
                resource: "r".to_string(),
                waited_ms: 10
            }
            .error_type(),
            ErrorType::ConcurrencyConflict
        );
        assert_eq!(
            SandboxError::RateLimited {
                identity: "x".to_string(),
                wait_ms: 5
            }
            .error_type(),
            ErrorType::RateLimited
        );
        assert_eq!(
            StoreError::Backend("down".to_string()).error_type(),
            ErrorType::Unknown
        );
    }

    #[tokio::test]
    async fn terminal_record_serializes_for_reporting() {
        let registry = registry();
        let err = execute_with_recovery("doomed", &registry, || async {
            Err::<(), _>(FakeError(ErrorType::Unknown))
        })
        .await
        .unwrap_err();

        let json = err.record.to_json();
        assert_eq!(json["error_type"], "unknown");
        assert_eq!(json["context"], "doomed");
        assert_eq!(json["attempts"], 2);
    }

    #[test]
    fn kill_classification_distinguishes_timeout_from_limit() {
        let base = SandboxResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(10),
            killed_by: KilledBy::Timeout,
            truncated: false,
        };
        assert_eq!(classify_result(&base), Some(ErrorType::CommandTimeout));

        let limit = SandboxResult {
            killed_by: KilledBy::Limit,
            ..base.clone()
        };
        assert_eq!(classify_result(&limit), Some(ErrorType::ResourceExhausted));

        let clean = SandboxResult {
            killed_by: KilledBy::None,
            exit_code: 0,
            ..base
        };
        assert_eq!(classify_result(&clean), None);
    }
}
