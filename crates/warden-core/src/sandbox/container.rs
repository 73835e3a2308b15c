//! Container tier: ephemeral, single-use containers over the Docker API.
//!
//! Each execution creates a fresh container with a memory ceiling, a CPU
//! share, `network_mode=none` unless the spec allows network, a read-only
//! root filesystem with at most one writable scratch bind, and a non-root
//! execution identity. Writes outside the scratch mount fail at the
//! filesystem layer, not in user code.
//!
//! Teardown is unconditional: whatever happened — completion, timeout,
//! runtime error — the container is force-removed before the result is
//! returned. Timeout handling leans on the runtime's own stop escalation
//! (terminate signal, grace period, then kill), and an OOM-killed container
//! is reported as a limit kill, not a timeout.

use std::time::Instant;

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::service::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{KilledBy, Payload, SandboxError, SandboxResult, SandboxSpec};
use crate::config::SandboxConfig;

/// Non-root identity every payload container runs as.
const SANDBOX_USER: &str = "65534:65534";

/// Mount point of the single writable scratch directory.
const SCRATCH_MOUNT: &str = "/scratch";

pub(super) async fn execute(
    spec: &SandboxSpec,
    config: &SandboxConfig,
) -> Result<SandboxResult, SandboxError> {
    let docker = Docker::connect_with_local_defaults()
        .map_err(|err| SandboxError::Setup(format!("docker connect: {err}")))?;

    ensure_image(&docker, &config.container_image).await?;

    let name = format!("warden-sbx-{}", Uuid::new_v4());
    let container_config = build_config(spec, config);

    docker
        .create_container(
            Some(CreateContainerOptions {
                name: name.clone(),
                platform: None,
            }),
            container_config,
        )
        .await
        .map_err(|err| SandboxError::Container(format!("create: {err}")))?;

    let outcome = run_to_completion(&docker, &name, spec, config).await;

    // Teardown runs on every path; a failed removal is logged, not raised,
    // so it cannot mask the execution outcome.
    if let Err(err) = docker
        .remove_container(
            &name,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
    {
        warn!(container = %name, error = %err, "container teardown failed");
    }

    outcome
}

/// Pulls the payload image if it is not already present, as a one-time setup
/// step per execution.
async fn ensure_image(docker: &Docker, image: &str) -> Result<(), SandboxError> {
    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }
    debug!(image, "image not present locally, pulling");
    let mut stream = docker.create_image(
        Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        }),
        None,
        None,
    );
    while let Some(progress) = stream.next().await {
        progress.map_err(|err| SandboxError::Setup(format!("pull {image}: {err}")))?;
    }
    Ok(())
}

fn command_for_payload(payload: &Payload) -> Result<Vec<String>, SandboxError> {
    match payload {
        Payload::Argv(argv) => Ok(argv.clone()),
        Payload::Code(code) => {
            let text = std::str::from_utf8(code).map_err(|_| {
                SandboxError::Setup("container code payload must be UTF-8".to_string())
            })?;
            Ok(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                text.to_string(),
            ])
        }
    }
}

fn bind_specs(spec: &SandboxSpec, config: &SandboxConfig) -> Vec<String> {
    let mut binds = Vec::new();
    if let Some(scratch) = &config.scratch_dir {
        binds.push(format!("{}:{SCRATCH_MOUNT}:rw", scratch.display()));
    }
    for path in &spec.allowed_paths {
        binds.push(format!("{}:{}:ro", path.display(), path.display()));
    }
    binds
}

fn build_config(spec: &SandboxSpec, config: &SandboxConfig) -> Config<String> {
    let binds = bind_specs(spec, config);
    let host_config = HostConfig {
        memory: Some(spec.memory_limit_bytes as i64),
        nano_cpus: Some((spec.cpu_limit * 1_000_000_000.0) as i64),
        network_mode: Some(
            if spec.allow_network {
                "bridge"
            } else {
                "none"
            }
            .to_string(),
        ),
        readonly_rootfs: Some(spec.read_only_fs),
        binds: (!binds.is_empty()).then_some(binds),
        ..Default::default()
    };

    Config {
        image: Some(config.container_image.clone()),
        cmd: command_for_payload(&spec.payload).ok(),
        env: Some(
            spec.env
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect(),
        ),
        user: Some(SANDBOX_USER.to_string()),
        working_dir: config
            .scratch_dir
            .as_ref()
            .map(|_| SCRATCH_MOUNT.to_string()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(host_config),
        ..Default::default()
    }
}

async fn run_to_completion(
    docker: &Docker,
    name: &str,
    spec: &SandboxSpec,
    config: &SandboxConfig,
) -> Result<SandboxResult, SandboxError> {
    // Reject payloads the tier cannot express before starting anything.
    command_for_payload(&spec.payload)?;

    docker
        .start_container(name, None::<StartContainerOptions<String>>)
        .await
        .map_err(|err| SandboxError::Container(format!("start: {err}")))?;

    let began = Instant::now();
    let mut wait_stream = docker.wait_container(name, None::<WaitContainerOptions<String>>);

    let (exit_code, mut killed_by) =
        match tokio::time::timeout(spec.timeout(), wait_stream.next()).await {
            Ok(Some(Ok(response))) => (response.status_code as i32, KilledBy::None),
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                (code as i32, KilledBy::None)
            }
            Ok(Some(Err(err))) => {
                return Err(SandboxError::Container(format!("wait: {err}")));
            }
            Ok(None) => {
                return Err(SandboxError::Container(
                    "wait stream ended without a status".to_string(),
                ));
            }
            Err(_) => {
                // The runtime's stop escalation: terminate signal, grace
                // period `t`, then kill.
                let grace_secs = (config.grace_period_ms / 1_000).max(1) as i64;
                warn!(
                    container = %name,
                    timeout_ms = spec.timeout().as_millis() as u64,
                    "container timed out, stopping"
                );
                if let Err(err) = docker
                    .stop_container(name, Some(StopContainerOptions { t: grace_secs }))
                    .await
                {
                    warn!(container = %name, error = %err, "stop after timeout failed");
                }
                (-1, KilledBy::Timeout)
            }
        };
    let duration = began.elapsed();

    // A container the kernel OOM-killed is a resource-limit kill regardless
    // of how the wait ended.
    if let Ok(inspect) = docker.inspect_container(name, None).await {
        if inspect
            .state
            .as_ref()
            .and_then(|state| state.oom_killed)
            .unwrap_or(false)
        {
            killed_by = KilledBy::Limit;
        }
    }

    let (stdout, stderr, truncated) = collect_logs(docker, name, config.max_output_bytes).await;

    Ok(SandboxResult {
        exit_code,
        stdout,
        stderr,
        duration,
        killed_by,
        truncated,
    })
}

async fn collect_logs(docker: &Docker, name: &str, cap: usize) -> (String, String, bool) {
    let mut stdout: Vec<u8> = Vec::new();
    let mut stderr: Vec<u8> = Vec::new();
    let mut truncated = false;

    let mut logs = docker.logs(
        name,
        Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        }),
    );

    while let Some(chunk) = logs.next().await {
        let (buffer, message) = match chunk {
            Ok(LogOutput::StdOut { message }) => (&mut stdout, message),
            Ok(LogOutput::StdErr { message }) => (&mut stderr, message),
            Ok(_) => continue,
            Err(err) => {
                warn!(container = %name, error = %err, "log collection aborted");
                break;
            }
        };
        if buffer.len() < cap {
            let take = (cap - buffer.len()).min(message.len());
            buffer.extend_from_slice(&message[..take]);
            truncated = truncated || take < message.len();
        } else {
            truncated = true;
        }
    }

    (
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
        truncated,
    )
}
