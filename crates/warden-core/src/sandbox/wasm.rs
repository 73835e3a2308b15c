//! In-process tier: wasm execution under wasmtime.
//!
//! The guest runs against an intentionally empty linker: no WASI, no host
//! functions, no shared memory. A module that imports anything — a file
//! open, a clock, a socket — fails at instantiation, before a single guest
//! instruction runs. Within that world three limits apply:
//!
//! - CPU: fuel metering; `cpu_limit` scales a fuel budget and exhaustion
//!   traps the guest (`killed_by: Limit`).
//! - Wall clock: an epoch-deadline watchdog interrupts the guest when the
//!   spec timeout elapses (`killed_by: Timeout`).
//! - Memory: a store limiter caps linear memory at `memory_limit_bytes`.
//!
//! Compilation and execution run on the blocking pool; the async caller is
//! suspended, not blocked.

use std::time::{Duration, Instant};

use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap};

use super::{IsolationTier, KilledBy, Payload, SandboxError, SandboxResult, SandboxSpec};

/// Fuel granted per unit of `cpu_limit`. One unit is roughly a few seconds
/// of tight-loop execution on current hardware.
const FUEL_PER_CPU_UNIT: f64 = 1_000_000_000.0;

/// Exported function every payload module must provide.
const ENTRYPOINT: &str = "_start";

pub(super) async fn execute(spec: &SandboxSpec) -> Result<SandboxResult, SandboxError> {
    let Payload::Code(code) = &spec.payload else {
        return Err(SandboxError::PayloadMismatch {
            tier: IsolationTier::InProcess,
            expected: "a wasm code payload",
        });
    };

    let code = code.clone();
    let timeout = spec.timeout();
    let fuel = (spec.cpu_limit * FUEL_PER_CPU_UNIT).max(1.0) as u64;
    let memory_limit = usize::try_from(spec.memory_limit_bytes).unwrap_or(usize::MAX);

    tokio::task::spawn_blocking(move || run_module(&code, timeout, fuel, memory_limit))
        .await
        .map_err(|err| SandboxError::Setup(format!("wasm task failed: {err}")))?
}

fn run_module(
    code: &[u8],
    timeout: Duration,
    fuel: u64,
    memory_limit: usize,
) -> Result<SandboxResult, SandboxError> {
    let mut config = Config::new();
    config.consume_fuel(true);
    config.epoch_interruption(true);
    let engine =
        Engine::new(&config).map_err(|err| SandboxError::Setup(format!("engine: {err}")))?;

    let module = Module::new(&engine, code)
        .map_err(|err| SandboxError::Setup(format!("module rejected: {err}")))?;

    let limits = StoreLimitsBuilder::new()
        .memory_size(memory_limit)
        .memories(1)
        .instances(1)
        .tables(1)
        .build();
    let mut store: Store<StoreLimits> = Store::new(&engine, limits);
    store.limiter(|limits| limits);
    store
        .set_fuel(fuel)
        .map_err(|err| SandboxError::Setup(format!("fuel: {err}")))?;
    store.set_epoch_deadline(1);

    // The linker is left empty on purpose: instantiation is where any
    // request for a host capability dies.
    let linker: Linker<StoreLimits> = Linker::new(&engine);
    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|err| SandboxError::Setup(format!("instantiation refused: {err}")))?;

    let entry = instance
        .get_typed_func::<(), ()>(&mut store, ENTRYPOINT)
        .map_err(|err| SandboxError::Setup(format!("missing {ENTRYPOINT} export: {err}")))?;

    // Watchdog: bump the epoch once the timeout elapses, unless execution
    // finishes first and drops the sender.
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
    let watchdog_engine = engine.clone();
    let watchdog = std::thread::spawn(move || {
        // Disconnection means execution finished first; only a true timeout
        // interrupts the guest.
        if done_rx.recv_timeout(timeout) == Err(std::sync::mpsc::RecvTimeoutError::Timeout) {
            watchdog_engine.increment_epoch();
        }
    });

    let began = Instant::now();
    let outcome = entry.call(&mut store, ());
    let duration = began.elapsed();

    drop(done_tx);
    let _ = watchdog.join();

    let result = match outcome {
        Ok(()) => SandboxResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration,
            killed_by: KilledBy::None,
            truncated: false,
        },
        Err(err) => {
            let killed_by = match err.downcast_ref::<Trap>() {
                Some(Trap::OutOfFuel) => KilledBy::Limit,
                Some(Trap::Interrupt) => KilledBy::Timeout,
                _ => KilledBy::None,
            };
            SandboxResult {
                exit_code: if matches!(killed_by, KilledBy::None) {
                    1
                } else {
                    -1
                },
                stdout: String::new(),
                stderr: format!("{err:#}"),
                duration,
                killed_by,
                truncated: false,
            }
        }
    };
    Ok(result)
}
