//! Request suspension: hold a request when no group can serve it, instead of
//! failing immediately (spec.md §4.3).
//!
//! The wait is a cooperative subscribe-and-select on the endpoint manager's
//! group-change broadcast (`EndpointManager::subscribe_group_changes`), the
//! suspension timeout, and client cancellation — mirroring the teacher's use
//! of `tokio::select!` to race multiple suspension points in
//! `src/proxy/mod.rs`'s `handle_proxy`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capability::EndpointSelector;
use crate::config::SuspensionConfig;
use crate::model::Endpoint;

pub enum SuspendOutcome {
    /// A group became active again; candidates for it are returned.
    Resumed {
        group: String,
        candidates: Vec<Endpoint>,
        suspended_for: Duration,
    },
    TimedOut { suspended_for: Duration },
    Cancelled { suspended_for: Duration },
}

/// Tracks the live count of suspended requests so `pause_new_suspensions`
/// (spec.md §8 "Bound on suspended count") can be enforced before a caller
/// even starts waiting.
pub struct SuspensionGate {
    count: AtomicUsize,
    max: usize,
}

impl SuspensionGate {
    pub fn new(max: usize) -> Self {
        Self {
            count: AtomicUsize::new(0),
            max,
        }
    }

    /// Reserves a slot; `None` if the bound is already reached.
    pub fn try_acquire(&self) -> Option<SuspensionPermit<'_>> {
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current >= self.max {
                return None;
            }
            if self
                .count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(SuspensionPermit { gate: self });
            }
        }
    }

    pub fn current(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

pub struct SuspensionPermit<'a> {
    gate: &'a SuspensionGate,
}

impl Drop for SuspensionPermit<'_> {
    fn drop(&mut self) {
        self.gate.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Waits on (a) a group-active change yielding a non-empty candidate list,
/// (b) `cfg.timeout_ms`, (c) `cancel` firing. Each waiter re-reads the
/// manager's fresh candidate set after waking rather than trusting the
/// broadcast payload, to avoid thundering-herd false wakes (spec.md §4.3
/// "Concurrency").
pub async fn wait_for_resumption(
    selector: &Arc<dyn EndpointSelector>,
    mut group_changes: broadcast::Receiver<()>,
    cfg: &SuspensionConfig,
    cancel: &CancellationToken,
) -> SuspendOutcome {
    let started = Instant::now();
    let deadline = tokio::time::sleep(Duration::from_millis(cfg.timeout_ms));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("suspended request cancelled by client");
                return SuspendOutcome::Cancelled { suspended_for: started.elapsed() };
            }
            _ = &mut deadline => {
                warn!("suspended request timed out waiting for a group to become available");
                return SuspendOutcome::TimedOut { suspended_for: started.elapsed() };
            }
            changed = group_changes.recv() => {
                match changed {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let candidates = selector.candidates().await;
                        if !candidates.is_empty() {
                            let group = "active".to_string();
                            return SuspendOutcome::Resumed {
                                group,
                                candidates,
                                suspended_for: started.elapsed(),
                            };
                        }
                        // False wake: still nothing healthy. Keep waiting.
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return SuspendOutcome::TimedOut { suspended_for: started.elapsed() };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_enforces_bound() {
        let gate = SuspensionGate::new(2);
        let a = gate.try_acquire().unwrap();
        let b = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        drop(a);
        assert!(gate.try_acquire().is_some());
        drop(b);
    }
}
