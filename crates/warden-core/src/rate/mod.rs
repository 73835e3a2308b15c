//! Execution rate governance.
//!
//! Sliding-window admission control per command identity, consulted before
//! any sandboxed execution or lock-guarded operation. State is purely
//! in-process: an ordered list of execution timestamps per identity, pruned
//! lazily on each check.
//!
//! # Thread safety
//!
//! The identity map is behind an `RwLock`, but mutation of a single
//! identity's window happens under that identity's own mutex. Two callers
//! hammering different identities never serialize against each other; two
//! callers sharing one identity do, which is exactly the single-writer
//! guarantee the window arithmetic needs.
//!
//! # Memory management
//!
//! Unbounded identity churn is a denial-of-service vector, so two defenses
//! bound the map:
//!
//! 1. Probabilistic cleanup: every Nth check sweeps identities whose windows
//!    hold no recent entries.
//! 2. A hard cap on tracked identities: at the cap, a check for a *new*
//!    identity forces a cleanup, and if the map is still full the check is
//!    denied outright.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::RateConfig;

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the execution was admitted (and recorded).
    pub allowed: bool,
    /// When denied, how long until the oldest in-window entry leaves the
    /// window. Zero when allowed.
    pub wait: Duration,
}

impl RateDecision {
    const fn admitted() -> Self {
        Self {
            allowed: true,
            wait: Duration::ZERO,
        }
    }

    const fn denied(wait: Duration) -> Self {
        Self {
            allowed: false,
            wait,
        }
    }
}

/// Sliding-window execution rate governor.
pub struct RateGovernor {
    config: RateConfig,
    identities: RwLock<HashMap<String, Arc<Mutex<Vec<Instant>>>>>,
    check_count: AtomicU64,
}

impl std::fmt::Debug for RateGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGovernor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateGovernor {
    /// Creates a governor with the given configuration.
    #[must_use]
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            identities: RwLock::new(HashMap::new()),
            check_count: AtomicU64::new(0),
        }
    }

    /// Checks whether an execution for `identity` is admitted right now.
    ///
    /// Admission records the execution timestamp in the same step, so a
    /// caller that is told `allowed` has already consumed a slot. Denial
    /// records nothing and reports how long to wait for the next free slot.
    #[must_use]
    pub fn check(&self, identity: &str) -> RateDecision {
        let now = Instant::now();
        let window = Duration::from_millis(self.config.window_ms);
        let cutoff = now.checked_sub(window).unwrap_or(now);

        let count = self.check_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval == 0 {
            debug!(check_count = count, "running periodic rate governor cleanup");
            self.cleanup();
        }

        let Some(slot) = self.slot_for(identity) else {
            // At the identity cap even after forced cleanup.
            warn!(
                identity,
                max_tracked = self.config.max_tracked_identities,
                "denying new identity: tracked-identity cap reached"
            );
            return RateDecision::denied(window);
        };

        let mut timestamps = slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        timestamps.retain(|&t| t > cutoff);

        if timestamps.len() >= self.config.max_executions as usize {
            // Oldest in-window entry leaving the window frees the next slot.
            let wait = timestamps
                .first()
                .map(|&oldest| window.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(window);
            debug!(
                identity,
                in_window = timestamps.len(),
                max = self.config.max_executions,
                wait_ms = wait.as_millis() as u64,
                "rate limit reached"
            );
            return RateDecision::denied(wait);
        }

        timestamps.push(now);
        RateDecision::admitted()
    }

    /// Admits `identity`, suspending the calling task for the computed wait
    /// when the window is full. Returns once a slot has been consumed.
    ///
    /// Callers that must not wait use [`RateGovernor::check`] and treat a
    /// denial as a fail-fast rate-limit error.
    pub async fn admit(&self, identity: &str) {
        loop {
            let decision = self.check(identity);
            if decision.allowed {
                return;
            }
            // Nudge past the window edge so the re-check lands after the
            // oldest entry has actually expired.
            tokio::time::sleep(decision.wait + Duration::from_millis(1)).await;
        }
    }

    /// Looks up or creates the per-identity window, enforcing the tracked
    /// identity cap. Returns `None` when the cap is hit and cleanup could not
    /// reclaim space.
    fn slot_for(&self, identity: &str) -> Option<Arc<Mutex<Vec<Instant>>>> {
        {
            let identities = self
                .identities
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(slot) = identities.get(identity) {
                return Some(Arc::clone(slot));
            }
            if identities.len() >= self.config.max_tracked_identities {
                drop(identities);
                self.cleanup();
            }
        }

        let mut identities = self
            .identities
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(slot) = identities.get(identity) {
            return Some(Arc::clone(slot));
        }
        if identities.len() >= self.config.max_tracked_identities {
            return None;
        }
        let slot = Arc::new(Mutex::new(Vec::new()));
        identities.insert(identity.to_string(), Arc::clone(&slot));
        Some(slot)
    }

    /// Removes identities with no in-window activity. Called probabilistically
    /// from [`RateGovernor::check`]; safe to call at any time.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = Duration::from_millis(self.config.window_ms);
        let cutoff = now.checked_sub(window).unwrap_or(now);

        let mut identities = self
            .identities
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        identities.retain(|_, slot| {
            let mut timestamps = slot
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            timestamps.retain(|&t| t > cutoff);
            !timestamps.is_empty()
        });
    }

    /// Number of identities currently tracked.
    #[must_use]
    pub fn tracked_identities(&self) -> usize {
        self.identities
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(max_executions: u32, window_ms: u64) -> RateGovernor {
        RateGovernor::new(RateConfig {
            max_executions,
            window_ms,
            ..RateConfig::default()
        })
    }

    #[test]
    fn admits_up_to_limit_then_rejects_exactly_once_over() {
        let governor = governor(3, 1_000);

        for i in 0..3 {
            let decision = governor.check("build-cmd");
            assert!(decision.allowed, "call {i} should be admitted");
        }

        let fourth = governor.check("build-cmd");
        assert!(!fourth.allowed);
        // Wait is roughly the distance to the window edge.
        assert!(fourth.wait <= Duration::from_millis(1_000));
        assert!(fourth.wait > Duration::from_millis(800));
    }

    #[test]
    fn admitted_again_after_window_passes() {
        let governor = governor(2, 60);

        assert!(governor.check("cmd").allowed);
        assert!(governor.check("cmd").allowed);
        assert!(!governor.check("cmd").allowed);

        std::thread::sleep(Duration::from_millis(80));
        assert!(governor.check("cmd").allowed);
    }

    #[test]
    fn denial_does_not_consume_a_slot() {
        let governor = governor(1, 50);

        assert!(governor.check("cmd").allowed);
        assert!(!governor.check("cmd").allowed);
        assert!(!governor.check("cmd").allowed);

        // Only the single admitted entry ages out; the denials left nothing.
        std::thread::sleep(Duration::from_millis(70));
        assert!(governor.check("cmd").allowed);
    }

    #[test]
    fn identities_do_not_interfere() {
        let governor = governor(1, 60_000);

        assert!(governor.check("cmd-a").allowed);
        assert!(!governor.check("cmd-a").allowed);

        assert!(governor.check("cmd-b").allowed);
    }

    #[test]
    fn cleanup_drops_idle_identities() {
        let governor = governor(5, 40);

        for i in 0..4 {
            governor.check(&format!("cmd-{i}"));
        }
        assert_eq!(governor.tracked_identities(), 4);

        std::thread::sleep(Duration::from_millis(60));
        governor.cleanup();
        assert_eq!(governor.tracked_identities(), 0);
    }

    #[test]
    fn identity_cap_denies_new_identities() {
        let governor = RateGovernor::new(RateConfig {
            max_executions: 10,
            window_ms: 60_000,
            cleanup_interval: 1_000,
            max_tracked_identities: 3,
        });

        assert!(governor.check("a").allowed);
        assert!(governor.check("b").allowed);
        assert!(governor.check("c").allowed);

        // New identity at the cap with nothing expired: denied.
        assert!(!governor.check("d").allowed);
        assert_eq!(governor.tracked_identities(), 3);

        // Existing identities keep working.
        assert!(governor.check("a").allowed);
    }

    #[tokio::test]
    async fn admit_waits_out_the_window() {
        let governor = governor(1, 50);

        assert!(governor.check("cmd").allowed);

        let started = Instant::now();
        governor.admit("cmd").await;
        let waited = started.elapsed();

        assert!(
            waited >= Duration::from_millis(40),
            "admit returned after only {waited:?}"
        );
    }

    #[test]
    fn concurrent_checks_on_one_identity_respect_the_limit() {
        let governor = Arc::new(governor(100, 60_000));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let governor = Arc::clone(&governor);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let _ = governor.check("shared");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // All 100 slots consumed; the next check is denied.
        assert!(!governor.check("shared").allowed);
    }
}
