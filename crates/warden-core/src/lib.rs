//! warden-core: distributed lock coordination and sandboxed execution.
//!
//! The crate coordinates mutually-exclusive and shared access to named
//! resources across independent processes through a shared coordination
//! store, and executes arbitrary or semi-trusted payloads inside
//! resource-bounded, escape-resistant sandboxes.
//!
//! # Architecture
//!
//! Leaves first:
//!
//! - [`validate`]: pure input validation — every string headed for a
//!   subprocess, a sandbox, or the store passes through here first
//! - [`config`]: the fully-typed configuration tree, validated once at
//!   startup
//! - [`store`]: the atomic key-value vocabulary (set-if-absent-with-TTL,
//!   compare-and-delete, compare-and-extend, counters) and its backends
//! - [`lock`]: exclusive and read/write locks built on the store
//! - [`rate`]: sliding-window admission control per command identity
//! - [`sandbox`]: three isolation tiers behind one executor
//! - [`recovery`]: failure taxonomy, bounded retry, circuit breaking
//!
//! # Control flow
//!
//! A caller's operation runs admit → lock → execute → classify:
//!
//! ```text
//! RateGovernor::check ──> LockManager::acquire ──> SandboxExecutor::execute
//!        │                        │                        │
//!        └── denied: fail fast    └── released on every    └── result or
//!            or wait                  exit path (TTL           classified
//!                                     covers crashes)          failure
//! ```
//!
//! The recovery layer wraps the whole pipeline where callers want bounded
//! retry; validation and security failures always propagate immediately.
//!
//! # Design principles
//!
//! 1. **The store is the truth** — no component caches lock ownership
//! 2. **No singletons** — one explicitly-owned instance of each component
//!    per process, store injected as `Arc<dyn CoordinationStore>`
//! 3. **Results over callbacks** — outcomes are returned values, not events
//! 4. **Fail closed** — bad config, bad input, and unknown failures stop
//!    the operation rather than degrade it silently

pub mod config;
pub mod lock;
pub mod rate;
pub mod recovery;
pub mod sandbox;
pub mod store;
pub mod validate;

pub use config::{ConfigError, CoreConfig};
pub use lock::{LockError, LockManager, LockToken, ReadToken, TokenState};
pub use rate::{RateDecision, RateGovernor};
pub use recovery::{
    execute_with_recovery, CircuitBreaker, CircuitError, CircuitState, Classify, ErrorRecord,
    ErrorType, PolicyRegistry, RetryPolicy, Severity, TerminalError,
};
pub use sandbox::{
    IsolationTier, KilledBy, SandboxError, SandboxExecutor, SandboxResult, SandboxSpec,
};
pub use store::{CoordinationStore, MemoryStore, SqliteStore, StoreError};
pub use validate::ValidationError;
