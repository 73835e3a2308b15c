//! Process tier: child OS processes with scrubbed environments and kill
//! escalation.
//!
//! The child inherits nothing: the environment is cleared and only the
//! spec's explicit allowlist (plus a host `PATH`, if the caller did not pin
//! one) is passed through. Stdout and stderr are captured into bounded
//! buffers — a payload that floods its pipes gets truncated output and a
//! flagged result, never unbounded host memory.
//!
//! On timeout the kill escalation runs: SIGTERM, a configurable grace
//! period, then SIGKILL for anything still alive. Readers drain the pipes to
//! EOF either way, so a dying child can never deadlock against a full pipe.

use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{IsolationTier, KilledBy, Payload, SandboxError, SandboxResult, SandboxSpec};
use crate::config::SandboxConfig;

pub(super) async fn execute(
    spec: &SandboxSpec,
    config: &SandboxConfig,
) -> Result<SandboxResult, SandboxError> {
    let Payload::Argv(argv) = &spec.payload else {
        return Err(SandboxError::PayloadMismatch {
            tier: IsolationTier::Process,
            expected: "an argv payload",
        });
    };

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd.env_clear();
    let mut saw_path = false;
    for (key, value) in &spec.env {
        saw_path = saw_path || key == "PATH";
        cmd.env(key, value);
    }
    if !saw_path {
        // Without PATH nothing resolves; pass the host's through unless the
        // caller pinned their own.
        cmd.env("PATH", std::env::var("PATH").unwrap_or_default());
    }

    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let cap = config.max_output_bytes;
    let stdout_task = tokio::spawn(read_bounded(stdout, cap));
    let stderr_task = tokio::spawn(read_bounded(stderr, cap));

    let began = Instant::now();
    let (exit_code, killed_by) = match tokio::time::timeout(spec.timeout(), child.wait()).await {
        Ok(Ok(status)) => (status.code().unwrap_or(-1), KilledBy::None),
        Ok(Err(err)) => return Err(SandboxError::Io(err)),
        Err(_) => {
            warn!(
                identity = %spec.identity(),
                timeout_ms = spec.timeout().as_millis() as u64,
                "process timed out, escalating kill"
            );
            escalate(&mut child, config.grace_period_ms).await;
            (-1, KilledBy::Timeout)
        }
    };
    let duration = began.elapsed();

    let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
    let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();

    debug!(
        identity = %spec.identity(),
        exit_code,
        duration_ms = duration.as_millis() as u64,
        "process execution finished"
    );

    Ok(SandboxResult {
        exit_code,
        stdout,
        stderr,
        duration,
        killed_by,
        truncated: stdout_truncated || stderr_truncated,
    })
}

/// Graceful-terminate, grace period, force-kill.
async fn escalate(child: &mut Child, grace_period_ms: u64) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
            let grace = std::time::Duration::from_millis(grace_period_ms);
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                debug!(pid, "process exited on SIGTERM within grace period");
                return;
            }
            warn!(pid, grace_period_ms, "grace period elapsed, sending SIGKILL");
        }
    }
    #[cfg(not(unix))]
    let _ = grace_period_ms;

    if let Err(err) = child.kill().await {
        warn!(error = %err, "force kill failed");
    }
}

/// Reads a stream to EOF, keeping at most `cap` bytes. The stream is always
/// fully drained so the child never blocks on a full pipe.
async fn read_bounded<R>(reader: Option<R>, cap: usize) -> (String, bool)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return (String::new(), false);
    };

    let mut collected: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if collected.len() < cap {
                    let take = (cap - collected.len()).min(n);
                    collected.extend_from_slice(&buf[..take]);
                    truncated = truncated || take < n;
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (String::from_utf8_lossy(&collected).into_owned(), truncated)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::RateConfig;
    use crate::rate::RateGovernor;
    use crate::sandbox::{SandboxExecutor, SandboxSpec};

    use super::*;

    fn executor_with(config: SandboxConfig) -> SandboxExecutor {
        SandboxExecutor::new(
            config,
            Arc::new(RateGovernor::new(RateConfig::default())),
        )
    }

    fn executor() -> SandboxExecutor {
        executor_with(SandboxConfig::default())
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let spec = SandboxSpec::builder(IsolationTier::Process, &SandboxConfig::default())
            .argv(["echo", "hello"])
            .build()
            .unwrap();

        let result = executor().execute(&spec).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_raised() {
        let spec = SandboxSpec::builder(IsolationTier::Process, &SandboxConfig::default())
            .argv(["false"])
            .build()
            .unwrap();

        let result = executor().execute(&spec).await.unwrap();
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.killed_by, KilledBy::None);
    }

    #[tokio::test]
    async fn timeout_triggers_kill_escalation() {
        let config = SandboxConfig {
            grace_period_ms: 100,
            ..SandboxConfig::default()
        };
        let spec = SandboxSpec::builder(IsolationTier::Process, &config)
            .argv(["sleep", "30"])
            .timeout_ms(200)
            .build()
            .unwrap();

        let began = Instant::now();
        let result = executor_with(config).execute(&spec).await.unwrap();

        assert_eq!(result.killed_by, KilledBy::Timeout);
        assert_eq!(result.exit_code, -1);
        // Bounded by timeout + grace, far below the payload's sleep.
        assert!(began.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn environment_is_not_inherited() {
        let spec = SandboxSpec::builder(IsolationTier::Process, &SandboxConfig::default())
            .argv(["env"])
            .env("WARDEN_MARKER", "1")
            .build()
            .unwrap();

        let result = executor().execute(&spec).await.unwrap();
        assert!(result.success());
        assert!(result.stdout.contains("WARDEN_MARKER=1"));
        // The host HOME must not leak through the scrubbed environment.
        assert!(
            !result.stdout.lines().any(|l| l.starts_with("HOME=")),
            "environment leaked: {}",
            result.stdout
        );
    }

    #[tokio::test]
    async fn output_is_truncated_at_the_cap() {
        let config = SandboxConfig {
            max_output_bytes: 1024,
            ..SandboxConfig::default()
        };
        let spec = SandboxSpec::builder(IsolationTier::Process, &config)
            .argv(["seq", "1", "100000"])
            .build()
            .unwrap();

        let result = executor_with(config).execute(&spec).await.unwrap();
        assert!(result.truncated);
        assert!(result.stdout.len() <= 1024);
        // The child still ran to completion against drained pipes.
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn stderr_is_captured_separately() {
        let spec = SandboxSpec::builder(IsolationTier::Process, &SandboxConfig::default())
            .argv(["ls", "/warden-definitely-missing"])
            .build()
            .unwrap();

        let result = executor().execute(&spec).await.unwrap();
        assert_ne!(result.exit_code, 0);
        assert!(result.stdout.is_empty());
        assert!(!result.stderr.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_an_io_error() {
        let spec = SandboxSpec::builder(IsolationTier::Process, &SandboxConfig::default())
            .argv(["warden-no-such-binary"])
            .build()
            .unwrap();

        let err = executor().execute(&spec).await.unwrap_err();
        assert!(matches!(err, SandboxError::Io(_)));
    }
}
