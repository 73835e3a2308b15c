//! Sandboxed execution.
//!
//! Runs a payload in one of three isolation tiers of increasing strength:
//!
//! - [`IsolationTier::InProcess`] — a wasm module executed in-process by
//!   wasmtime with fuel metering, an epoch-deadline wall timeout, and a
//!   memory ceiling. No WASI capabilities are linked, so filesystem, process,
//!   and network primitives are simply absent from the guest's world.
//! - [`IsolationTier::Process`] — a child OS process with fully validated
//!   argv, a scrubbed environment, bounded output capture, and
//!   terminate-then-kill timeout escalation.
//! - [`IsolationTier::Container`] — an ephemeral single-use container with
//!   memory/CPU ceilings, no network unless allowed, a read-only root
//!   filesystem with at most one writable scratch mount, a non-root user,
//!   and unconditional teardown.
//!
//! Tier selection is explicit in the [`SandboxSpec`]; nothing is
//! auto-detected. Every tier produces the same [`SandboxResult`] shape, and
//! [`SandboxResult::killed_by`] distinguishes timeout kills from
//! resource-limit kills so the recovery layer can classify the failure.
//!
//! The executor holds no cross-invocation state: each `execute` call is
//! independent and safe to run in parallel.

mod container;
mod process;
mod wasm;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::config::SandboxConfig;
use crate::rate::RateGovernor;
use crate::validate::{self, ValidationError};

/// Upper bound accepted for a sandbox timeout (one hour).
const MAX_TIMEOUT_MS: i64 = 3_600_000;

/// Upper bound accepted for a sandbox memory ceiling (8 GiB).
const MAX_MEMORY_LIMIT_BYTES: i64 = 8 * 1024 * 1024 * 1024;

/// Isolation strength for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationTier {
    /// wasm module inside the calling process.
    InProcess,
    /// Child OS process.
    Process,
    /// Ephemeral container.
    Container,
}

impl std::fmt::Display for IsolationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess => write!(f, "in-process"),
            Self::Process => write!(f, "process"),
            Self::Container => write!(f, "container"),
        }
    }
}

/// What a sandboxed execution runs.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A code body: a wasm module (binary or WAT) for the in-process tier, a
    /// shell snippet for the container tier.
    Code(Vec<u8>),
    /// An argument vector, program first. Required by the process tier.
    Argv(Vec<String>),
}

/// Why an execution was killed, if it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KilledBy {
    /// Ran to completion (successfully or not) without intervention.
    #[default]
    None,
    /// The wall-clock timeout elapsed and the kill escalation fired.
    Timeout,
    /// A resource limit (fuel, memory) stopped it.
    Limit,
}

/// Outcome of one sandboxed execution. Produced exactly once per spec and
/// owned by the caller thereafter.
#[derive(Debug, Clone)]
pub struct SandboxResult {
    /// Exit code; `-1` when the payload died without one.
    pub exit_code: i32,
    /// Captured stdout, bounded by the configured output cap.
    pub stdout: String,
    /// Captured stderr, bounded by the configured output cap.
    pub stderr: String,
    /// Wall-clock execution time.
    pub duration: Duration,
    /// Kill classification.
    pub killed_by: KilledBy,
    /// Whether either stream was truncated at the output cap.
    pub truncated: bool,
}

impl SandboxResult {
    /// Whether the payload completed with exit code zero and was not killed.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0 && matches!(self.killed_by, KilledBy::None)
    }
}

/// Errors from sandbox execution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// The payload or spec failed validation.
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// The rate governor denied the execution.
    #[error("execution rate limit reached for {identity}; retry in {wait_ms}ms")]
    RateLimited {
        /// The throttled command identity.
        identity: String,
        /// Time until a slot frees up.
        wait_ms: u64,
    },

    /// The payload kind does not match the tier.
    #[error("{tier} tier requires {expected}")]
    PayloadMismatch {
        /// The requested tier.
        tier: IsolationTier,
        /// What the tier needs.
        expected: &'static str,
    },

    /// The isolation environment could not be prepared.
    #[error("sandbox setup failed: {0}")]
    Setup(String),

    /// The container runtime failed mid-flight.
    #[error("container runtime failure: {0}")]
    Container(String),

    /// Host I/O failed while driving the execution.
    #[error("i/o failure during sandboxed execution: {0}")]
    Io(#[from] std::io::Error),
}

/// Immutable description of one sandboxed execution.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    tier: IsolationTier,
    payload: Payload,
    identity: String,
    timeout_ms: u64,
    memory_limit_bytes: u64,
    cpu_limit: f64,
    allow_network: bool,
    read_only_fs: bool,
    allowed_paths: Vec<PathBuf>,
    env: Vec<(String, String)>,
}

impl SandboxSpec {
    /// Starts building a spec for the given tier, seeded with the limits of
    /// `config`.
    #[must_use]
    pub fn builder(tier: IsolationTier, config: &SandboxConfig) -> SandboxSpecBuilder {
        SandboxSpecBuilder {
            tier,
            payload: None,
            identity: None,
            timeout_ms: config.timeout_ms,
            memory_limit_bytes: config.memory_limit_bytes,
            cpu_limit: config.cpu_limit,
            allow_network: config.allow_network,
            read_only_fs: true,
            allowed_paths: Vec::new(),
            env: Vec::new(),
        }
    }

    /// The tier this spec executes in.
    #[must_use]
    pub const fn tier(&self) -> IsolationTier {
        self.tier
    }

    /// The rate-governor identity charged for this execution.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Wall-clock timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Builder for [`SandboxSpec`].
#[derive(Debug)]
pub struct SandboxSpecBuilder {
    tier: IsolationTier,
    payload: Option<Payload>,
    identity: Option<String>,
    timeout_ms: u64,
    memory_limit_bytes: u64,
    cpu_limit: f64,
    allow_network: bool,
    read_only_fs: bool,
    allowed_paths: Vec<PathBuf>,
    env: Vec<(String, String)>,
}

impl SandboxSpecBuilder {
    /// Sets a code payload (wasm module or shell snippet).
    #[must_use]
    pub fn code(mut self, code: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(Payload::Code(code.into()));
        self
    }

    /// Sets an argv payload, program first.
    #[must_use]
    pub fn argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.payload = Some(Payload::Argv(argv.into_iter().map(Into::into).collect()));
        self
    }

    /// Overrides the rate-governor identity. Defaults to the program name
    /// for argv payloads and `"in-process"`/`"container"` for code payloads.
    #[must_use]
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Overrides the wall-clock timeout.
    #[must_use]
    pub const fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Overrides the memory ceiling.
    #[must_use]
    pub const fn memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Overrides the CPU limit (share of one core, or fuel scale for the
    /// in-process tier).
    #[must_use]
    pub const fn cpu_limit(mut self, cpu_limit: f64) -> Self {
        self.cpu_limit = cpu_limit;
        self
    }

    /// Allows network access. Off by default.
    #[must_use]
    pub const fn allow_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    /// Controls root-filesystem writability in the container tier. Read-only
    /// by default.
    #[must_use]
    pub const fn read_only_fs(mut self, read_only: bool) -> Self {
        self.read_only_fs = read_only;
        self
    }

    /// Adds a host path the container tier may bind read-only.
    #[must_use]
    pub fn allowed_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.allowed_paths.push(path.into());
        self
    }

    /// Adds an environment variable to the explicit allowlist. Nothing is
    /// inherited from the host.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Validates and finalizes the spec.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when the payload is missing or fails
    /// validation, or when a numeric limit is out of range.
    pub fn build(self) -> Result<SandboxSpec, ValidationError> {
        let payload = self.payload.ok_or_else(|| ValidationError::InvalidKey {
            key: String::new(),
            reason: "sandbox spec requires a payload".to_string(),
        })?;

        match &payload {
            Payload::Argv(argv) => {
                if argv.is_empty() {
                    return Err(ValidationError::InvalidKey {
                        key: String::new(),
                        reason: "argv payload must not be empty".to_string(),
                    });
                }
                validate::validate_args(argv)?;
            }
            Payload::Code(code) => validate::validate_code(code)?,
        }

        validate::validate_range("timeout_ms", self.timeout_ms as i64, 1, MAX_TIMEOUT_MS)?;
        validate::validate_range(
            "memory_limit_bytes",
            self.memory_limit_bytes as i64,
            1,
            MAX_MEMORY_LIMIT_BYTES,
        )?;
        if self.cpu_limit <= 0.0 || !self.cpu_limit.is_finite() {
            return Err(ValidationError::OutOfRange {
                name: "cpu_limit".to_string(),
                value: 0,
                min: 1,
                max: i64::MAX,
            });
        }

        let identity = self.identity.unwrap_or_else(|| match (&payload, self.tier) {
            (Payload::Argv(argv), _) => argv[0].clone(),
            (Payload::Code(_), tier) => tier.to_string(),
        });

        Ok(SandboxSpec {
            tier: self.tier,
            payload,
            identity,
            timeout_ms: self.timeout_ms,
            memory_limit_bytes: self.memory_limit_bytes,
            cpu_limit: self.cpu_limit,
            allow_network: self.allow_network,
            read_only_fs: self.read_only_fs,
            allowed_paths: self.allowed_paths,
            env: self.env,
        })
    }
}

/// Executes sandbox specs. Stateless across invocations; clone-cheap via
/// shared internals.
pub struct SandboxExecutor {
    config: SandboxConfig,
    governor: Arc<RateGovernor>,
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SandboxExecutor {
    /// Creates an executor over the given configuration and rate governor.
    #[must_use]
    pub fn new(config: SandboxConfig, governor: Arc<RateGovernor>) -> Self {
        Self { config, governor }
    }

    /// Runs one spec to completion, timeout, or kill.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::RateLimited` when the governor denies the
    /// execution, `PayloadMismatch` when the payload kind does not fit the
    /// tier, or a tier-specific failure. A payload that runs and fails is
    /// *not* an error: it is a [`SandboxResult`] with a non-zero exit code or
    /// a kill classification.
    pub async fn execute(&self, spec: &SandboxSpec) -> Result<SandboxResult, SandboxError> {
        let decision = self.governor.check(spec.identity());
        if !decision.allowed {
            return Err(SandboxError::RateLimited {
                identity: spec.identity().to_string(),
                wait_ms: decision.wait.as_millis() as u64,
            });
        }

        debug!(
            tier = %spec.tier(),
            identity = %spec.identity(),
            timeout_ms = spec.timeout_ms,
            "starting sandboxed execution"
        );

        match spec.tier() {
            IsolationTier::InProcess => wasm::execute(spec).await,
            IsolationTier::Process => process::execute(spec, &self.config).await,
            IsolationTier::Container => container::execute(spec, &self.config).await,
        }
    }
}
