//! Endpoint pool, groups, active-group selection, manual controls (spec.md
//! §4.1). Runtime state lives behind `parking_lot::RwLock`-guarded maps —
//! the read-mostly-map-with-write-lock-on-health-update pattern spec.md §5
//! calls for, and the same shape as the teacher's
//! `Arc<Mutex<HashMap<String, LbState>>>` in `ProxyService` (`src/proxy/mod.rs`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::capability::{EndpointSelector, EventPublisher};
use crate::endpoint::strategy::order_candidates;
use crate::events::{Event, EventKind};
use crate::model::{Endpoint, EndpointRuntime, GroupRuntime, SelectionStrategy};

struct GroupData {
    priority: i32,
    members: Vec<Endpoint>,
    endpoint_runtime: HashMap<String, EndpointRuntime>,
    group_runtime: GroupRuntime,
    rr_cursor: usize,
}

struct Inner {
    groups: HashMap<String, GroupData>,
    group_order: Vec<String>,
    active_group: Option<String>,
    pinned_group: Option<String>,
}

/// Pool + groups + active-group selection (spec.md §4.1). Construction-time
/// wiring only: callers inject the `EventPublisher` rather than the manager
/// reaching for a global (spec.md §9 Design Notes #2).
pub struct EndpointManager {
    strategy: SelectionStrategy,
    cooldown: Duration,
    inner: parking_lot::RwLock<Inner>,
    events: Arc<dyn EventPublisher>,
    group_change_tx: broadcast::Sender<()>,
}

impl EndpointManager {
    pub fn new(
        endpoints: Vec<Endpoint>,
        strategy: SelectionStrategy,
        cooldown: Duration,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let mut groups: HashMap<String, GroupData> = HashMap::new();
        for ep in endpoints {
            let entry = groups.entry(ep.group.clone()).or_insert_with(|| GroupData {
                priority: ep.group_priority,
                members: Vec::new(),
                endpoint_runtime: HashMap::new(),
                group_runtime: GroupRuntime::default(),
                rr_cursor: 0,
            });
            entry.endpoint_runtime.insert(ep.name.clone(), EndpointRuntime::new());
            entry.members.push(ep);
        }

        let mut group_order: Vec<String> = groups.keys().cloned().collect();
        group_order.sort_by_key(|name| groups[name].priority);

        let (group_change_tx, _rx) = broadcast::channel(16);

        let manager = Self {
            strategy,
            cooldown,
            inner: parking_lot::RwLock::new(Inner {
                groups,
                group_order,
                active_group: None,
                pinned_group: None,
            }),
            events,
            group_change_tx,
        };
        manager.recompute_active_group();
        manager
    }

    pub fn subscribe_group_changes(&self) -> broadcast::Receiver<()> {
        self.group_change_tx.subscribe()
    }

    pub fn active_group_name(&self) -> Option<String> {
        self.inner.read().active_group.clone()
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Selection rules in order (spec.md §4.1 "Group selection"): pinned
    /// group wins outright; else the lowest-priority group that has a
    /// healthy member, isn't paused, and isn't in cooldown; else the prior
    /// active group stays, flagged `in_cooldown`.
    fn recompute_active_group(&self) {
        let now = Instant::now();
        let mut inner = self.inner.write();

        if let Some(pinned) = inner.pinned_group.clone() {
            if inner.groups.contains_key(&pinned) {
                let changed = inner.active_group.as_deref() != Some(pinned.as_str());
                inner.active_group = Some(pinned);
                drop(inner);
                if changed {
                    let _ = self.group_change_tx.send(());
                }
                return;
            }
        }

        let group_order = inner.group_order.clone();
        let mut next_active = None;
        for name in &group_order {
            let group = &inner.groups[name];
            if group.group_runtime.is_paused(now) || group.group_runtime.in_cooldown(now) {
                continue;
            }
            let has_healthy = group
                .members
                .iter()
                .any(|e| group.endpoint_runtime.get(&e.name).is_some_and(|r| !r.never_checked && r.healthy));
            if has_healthy {
                next_active = Some(name.clone());
                break;
            }
        }

        let changed = inner.active_group != next_active;
        if next_active.is_some() {
            inner.active_group = next_active;
        }
        // Rule 3: if nothing qualifies, keep the previous active group (it
        // stays selectable for suspension purposes even while in cooldown).
        drop(inner);
        if changed {
            let _ = self.group_change_tx.send(());
        }
    }

    /// Applies one health-probe result (spec.md §4.1 "Health check").
    pub async fn apply_health_result(&self, endpoint_name: &str, healthy: bool, response_time_ms: Option<u64>) {
        let mut flip_group = None;
        {
            let mut inner = self.inner.write();
            let group_order = inner.group_order.clone();
            for group_name in &group_order {
                let group = inner.groups.get_mut(group_name).unwrap();
                if let Some(runtime) = group.endpoint_runtime.get_mut(endpoint_name) {
                    let was_never_checked = runtime.never_checked;
                    let was_healthy = runtime.healthy;
                    runtime.never_checked = false;
                    runtime.healthy = healthy;
                    runtime.last_check_time = Some(SystemTime::now());
                    runtime.response_time_ms = response_time_ms;
                    if healthy {
                        runtime.consecutive_failures = 0;
                    } else {
                        runtime.consecutive_failures += 1;
                    }

                    if was_never_checked || was_healthy != healthy {
                        flip_group = Some(group_name.clone());
                    }

                    if !healthy {
                        let any_other_healthy = group.members.iter().any(|e| {
                            e.name != endpoint_name
                                && group
                                    .endpoint_runtime
                                    .get(&e.name)
                                    .is_some_and(|r| !r.never_checked && r.healthy)
                        });
                        if !any_other_healthy {
                            group.group_runtime.cooldown_until = Some(Instant::now() + self.cooldown);
                        }
                    } else {
                        group.group_runtime.cooldown_until = None;
                    }
                    break;
                }
            }
        }

        if let Some(group_name) = flip_group {
            self.events
                .publish(Event::new(
                    "endpoint_manager",
                    EventKind::EndpointHealthFlip {
                        endpoint: endpoint_name.to_string(),
                        group: group_name,
                        healthy,
                    },
                ))
                .await;
        }

        self.recompute_active_group();
    }

    /// All configured endpoints, for the health checker to iterate and for
    /// `/health/detailed` to report on.
    pub fn all_endpoints(&self) -> Vec<(Endpoint, EndpointRuntime)> {
        let inner = self.inner.read();
        inner
            .groups
            .values()
            .flat_map(|g| {
                g.members.iter().map(move |e| {
                    let runtime = g.endpoint_runtime.get(&e.name).cloned().unwrap_or_default();
                    (e.clone(), runtime)
                })
            })
            .collect()
    }

    fn group_candidates(&self, group_name: &str) -> Vec<Endpoint> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let Some(group) = inner.groups.get_mut(group_name) else {
            return Vec::new();
        };
        let force_last_resort = group.group_runtime.manual_pinned;
        let _ = now;
        order_candidates(
            self.strategy,
            &group.members,
            &group.endpoint_runtime,
            &mut group.rr_cursor,
            force_last_resort,
        )
    }
}

#[async_trait]
impl EndpointSelector for EndpointManager {
    async fn candidates(&self) -> Vec<Endpoint> {
        let active = self.active_group_name();
        match active {
            Some(name) => self.group_candidates(&name),
            None => Vec::new(),
        }
    }

    async fn next_group_candidates(&self) -> Option<(String, Vec<Endpoint>)> {
        let inner = self.inner.read();
        let active = inner.active_group.clone()?;
        let pos = inner.group_order.iter().position(|g| *g == active)?;
        let next = inner.group_order.get(pos + 1)?.clone();
        drop(inner);
        let candidates = self.group_candidates(&next);
        if candidates.is_empty() {
            None
        } else {
            Some((next, candidates))
        }
    }

    async fn record_success(&self, endpoint_name: &str, latency_ms: u64) {
        self.apply_health_result(endpoint_name, true, Some(latency_ms)).await;
    }

    async fn record_failure(&self, endpoint_name: &str) {
        self.apply_health_result(endpoint_name, false, None).await;
    }

    async fn pause_group(&self, group: &str, until: Option<Duration>) {
        {
            let mut inner = self.inner.write();
            if let Some(g) = inner.groups.get_mut(group) {
                g.group_runtime.manual_paused = true;
                g.group_runtime.manual_pause_until = until.map(|d| Instant::now() + d);
            }
        }
        self.events
            .publish(Event::new(
                "endpoint_manager",
                EventKind::GroupStatusChange {
                    group: group.to_string(),
                    active: false,
                    reason: "manual_pause".to_string(),
                },
            ))
            .await;
        self.recompute_active_group();
    }

    async fn resume_group(&self, group: &str) {
        {
            let mut inner = self.inner.write();
            if let Some(g) = inner.groups.get_mut(group) {
                g.group_runtime.manual_paused = false;
                g.group_runtime.manual_pause_until = None;
                g.group_runtime.cooldown_until = None;
            }
            if inner.pinned_group.as_deref() == Some(group) {
                inner.pinned_group = None;
            }
        }
        self.events
            .publish(Event::new(
                "endpoint_manager",
                EventKind::GroupStatusChange {
                    group: group.to_string(),
                    active: true,
                    reason: "manual_resume".to_string(),
                },
            ))
            .await;
        self.recompute_active_group();
    }

    async fn activate_group(&self, group: &str, force: bool) -> bool {
        let ok = {
            let mut inner = self.inner.write();
            if !inner.groups.contains_key(group) {
                false
            } else {
                let has_healthy = inner.groups[group].members.iter().any(|e| {
                    inner.groups[group]
                        .endpoint_runtime
                        .get(&e.name)
                        .is_some_and(|r| !r.never_checked && r.healthy)
                });
                if !force && !has_healthy {
                    false
                } else {
                    inner.pinned_group = Some(group.to_string());
                    if let Some(g) = inner.groups.get_mut(group) {
                        g.group_runtime.manual_pinned = true;
                    }
                    true
                }
            }
        };
        if ok {
            self.events
                .publish(Event::new(
                    "endpoint_manager",
                    EventKind::GroupStatusChange {
                        group: group.to_string(),
                        active: true,
                        reason: "manual_activate".to_string(),
                    },
                ))
                .await;
            self.recompute_active_group();
            info!(group, force, "group manually activated");
        } else {
            debug!(group, force, "activate_group: unknown group or no healthy member without force");
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EndpointAuth;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullPublisher(AtomicUsize);
    #[async_trait]
    impl EventPublisher for NullPublisher {
        async fn publish(&self, _event: Event) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn ep(name: &str, group: &str, group_priority: i32, priority: i32) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            url: format!("https://{name}.example"),
            group: group.to_string(),
            group_priority,
            priority,
            auth: EndpointAuth::default(),
            timeout_ms: None,
            proxy_url: None,
        }
    }

    #[tokio::test]
    async fn lowest_priority_healthy_group_becomes_active() {
        let events: Arc<dyn EventPublisher> = Arc::new(NullPublisher(AtomicUsize::new(0)));
        let manager = EndpointManager::new(
            vec![ep("a", "g1", 1, 0), ep("b", "g2", 2, 0)],
            SelectionStrategy::Priority,
            Duration::from_secs(30),
            events,
        );
        assert!(manager.active_group_name().is_none());
        manager.apply_health_result("b", true, Some(10)).await;
        assert_eq!(manager.active_group_name().as_deref(), Some("g2"));
        manager.apply_health_result("a", true, Some(5)).await;
        assert_eq!(manager.active_group_name().as_deref(), Some("g1"));
    }

    #[tokio::test]
    async fn losing_last_healthy_member_enters_cooldown_and_falls_back() {
        let events: Arc<dyn EventPublisher> = Arc::new(NullPublisher(AtomicUsize::new(0)));
        let manager = EndpointManager::new(
            vec![ep("a", "g1", 1, 0), ep("b", "g2", 2, 0)],
            SelectionStrategy::Priority,
            Duration::from_secs(30),
            events,
        );
        manager.apply_health_result("a", true, Some(1)).await;
        manager.apply_health_result("b", true, Some(1)).await;
        assert_eq!(manager.active_group_name().as_deref(), Some("g1"));

        manager.apply_health_result("a", false, None).await;
        assert_eq!(manager.active_group_name().as_deref(), Some("g2"));
    }

    #[tokio::test]
    async fn at_most_one_active_group() {
        let events: Arc<dyn EventPublisher> = Arc::new(NullPublisher(AtomicUsize::new(0)));
        let manager = EndpointManager::new(
            vec![ep("a", "g1", 1, 0), ep("b", "g2", 2, 0), ep("c", "g3", 3, 0)],
            SelectionStrategy::Priority,
            Duration::from_secs(30),
            events,
        );
        manager.apply_health_result("a", true, Some(1)).await;
        manager.apply_health_result("b", true, Some(1)).await;
        manager.apply_health_result("c", true, Some(1)).await;
        let active_count = [manager.active_group_name()].iter().filter(|g| g.is_some()).count();
        assert_eq!(active_count, 1);
    }
}
