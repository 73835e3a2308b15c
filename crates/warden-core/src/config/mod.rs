//! Configuration parsing and startup validation.
//!
//! The whole core is driven by one explicit, fully-enumerated configuration
//! tree. There are no dynamic lookup maps and no module-level singletons: the
//! caller constructs a [`CoreConfig`] (from TOML or programmatically),
//! validates it exactly once, and passes it by reference to the components
//! that need each section.
//!
//! All durations are plain millisecond fields. Validation is fail-closed: a
//! zero window, a zero timeout, or a grace period longer than the timeout it
//! guards is a construction-time error, never a runtime surprise.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML content could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field value failed startup validation.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Top-level configuration for the execution core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Distributed lock settings.
    #[serde(default)]
    pub lock: LockConfig,

    /// Rate governor settings.
    #[serde(default)]
    pub rate: RateConfig,

    /// Sandbox executor settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Error recovery settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl CoreConfig {
    /// Load configuration from a TOML file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or any field fails
    /// [`CoreConfig::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section. Called once at startup; components assume a
    /// validated config thereafter.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lock.validate()?;
        self.rate.validate()?;
        self.sandbox.validate()?;
        self.recovery.validate()?;
        Ok(())
    }
}

/// Distributed lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Default TTL for acquired locks, in milliseconds.
    #[serde(default = "default_lock_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Total time an acquire call may spend retrying before it fails with a
    /// timeout, in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Delay between acquisition attempts, in milliseconds.
    #[serde(default = "default_lock_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// TTL of the short-lived guard key that serializes reader-count
    /// updates, in milliseconds.
    #[serde(default = "default_guard_ttl_ms")]
    pub guard_ttl_ms: u64,
}

const fn default_lock_ttl_ms() -> u64 {
    30_000
}

const fn default_lock_timeout_ms() -> u64 {
    10_000
}

const fn default_lock_retry_delay_ms() -> u64 {
    100
}

const fn default_guard_ttl_ms() -> u64 {
    2_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_lock_ttl_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            retry_delay_ms: default_lock_retry_delay_ms(),
            guard_ttl_ms: default_guard_ttl_ms(),
        }
    }
}

impl LockConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl_ms == 0 {
            return Err(ConfigError::Validation(
                "lock.default_ttl_ms must be greater than zero".to_string(),
            ));
        }
        if self.retry_delay_ms == 0 {
            return Err(ConfigError::Validation(
                "lock.retry_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.guard_ttl_ms == 0 {
            return Err(ConfigError::Validation(
                "lock.guard_ttl_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rate governor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Maximum executions admitted per identity within the window.
    #[serde(default = "default_max_executions")]
    pub max_executions: u32,

    /// Sliding window size, in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// How often to run cleanup (every N checks).
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,

    /// Hard cap on unique identities tracked. Bounds memory regardless of
    /// how many distinct identities callers present.
    #[serde(default = "default_max_tracked_identities")]
    pub max_tracked_identities: usize,
}

const fn default_max_executions() -> u32 {
    30
}

const fn default_window_ms() -> u64 {
    60_000
}

const fn default_cleanup_interval() -> u64 {
    100
}

const fn default_max_tracked_identities() -> usize {
    10_000
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            max_executions: default_max_executions(),
            window_ms: default_window_ms(),
            cleanup_interval: default_cleanup_interval(),
            max_tracked_identities: default_max_tracked_identities(),
        }
    }
}

impl RateConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_executions == 0 {
            return Err(ConfigError::Validation(
                "rate.max_executions must be greater than zero".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(ConfigError::Validation(
                "rate.window_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_tracked_identities == 0 {
            return Err(ConfigError::Validation(
                "rate.max_tracked_identities must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sandbox executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Default wall-clock timeout for an execution, in milliseconds.
    #[serde(default = "default_sandbox_timeout_ms")]
    pub timeout_ms: u64,

    /// Default memory ceiling in bytes.
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: u64,

    /// Default CPU limit. For the container tier this is a share of one CPU
    /// (1.0 = one core); for the in-process tier it is scaled into a fuel
    /// budget.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,

    /// Whether sandboxed payloads may open network connections.
    #[serde(default)]
    pub allow_network: bool,

    /// Grace period between the terminate signal and the force kill, in
    /// milliseconds.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Per-stream bound on captured stdout/stderr, in bytes. Output beyond
    /// this is discarded and the result is flagged truncated.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Image used by the container tier.
    #[serde(default = "default_container_image")]
    pub container_image: String,

    /// Host directory mounted as the single writable scratch path in the
    /// container tier. `None` means no writable mount at all.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

const fn default_sandbox_timeout_ms() -> u64 {
    30_000
}

const fn default_memory_limit_bytes() -> u64 {
    256 * 1024 * 1024
}

const fn default_cpu_limit() -> f64 {
    1.0
}

const fn default_grace_period_ms() -> u64 {
    5_000
}

const fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_container_image() -> String {
    "alpine:3.20".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_sandbox_timeout_ms(),
            memory_limit_bytes: default_memory_limit_bytes(),
            cpu_limit: default_cpu_limit(),
            allow_network: false,
            grace_period_ms: default_grace_period_ms(),
            max_output_bytes: default_max_output_bytes(),
            container_image: default_container_image(),
            scratch_dir: None,
        }
    }
}

impl SandboxConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "sandbox.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.memory_limit_bytes == 0 {
            return Err(ConfigError::Validation(
                "sandbox.memory_limit_bytes must be greater than zero".to_string(),
            ));
        }
        if self.cpu_limit <= 0.0 || !self.cpu_limit.is_finite() {
            return Err(ConfigError::Validation(
                "sandbox.cpu_limit must be a positive finite number".to_string(),
            ));
        }
        if self.grace_period_ms >= self.timeout_ms {
            return Err(ConfigError::Validation(format!(
                "sandbox.grace_period_ms ({}) must be shorter than sandbox.timeout_ms ({})",
                self.grace_period_ms, self.timeout_ms
            )));
        }
        if self.container_image.is_empty() {
            return Err(ConfigError::Validation(
                "sandbox.container_image must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Error recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Default maximum attempts for retry-eligible failures.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base delay before the first retry, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Consecutive failures before a circuit breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit rejects calls before allowing a trial, in
    /// milliseconds.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

const fn default_retry_attempts() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    500
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl RecoveryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_attempts == 0 {
            return Err(ConfigError::Validation(
                "recovery.retry_attempts must be greater than zero".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "recovery.failure_threshold must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config = CoreConfig::from_toml(
            r#"
            [rate]
            max_executions = 3
            window_ms = 1000

            [sandbox]
            timeout_ms = 2000
            grace_period_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.rate.max_executions, 3);
        assert_eq!(config.rate.window_ms, 1000);
        assert_eq!(config.sandbox.timeout_ms, 2000);
        // Untouched sections keep their defaults.
        assert_eq!(config.lock.lock_timeout_ms, default_lock_timeout_ms());
        assert_eq!(config.recovery.retry_attempts, default_retry_attempts());
    }

    #[test]
    fn rejects_zero_window() {
        let result = CoreConfig::from_toml(
            r#"
            [rate]
            window_ms = 0
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_grace_period_longer_than_timeout() {
        let result = CoreConfig::from_toml(
            r#"
            [sandbox]
            timeout_ms = 1000
            grace_period_ms = 1000
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_invalid_toml() {
        assert!(matches!(
            CoreConfig::from_toml("not = [valid"),
            Err(ConfigError::Parse(_))
        ));
    }
}
