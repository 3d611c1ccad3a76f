//! Candidate ordering strategies (spec.md §4.1 "Candidate enumeration").

use std::collections::HashMap;

use crate::model::{Endpoint, EndpointRuntime, SelectionStrategy};

/// Orders `members` (all endpoints of one group, in declaration order) per
/// `strategy`, offering only healthy endpoints unless `force_last_resort` is
/// set (the group was force-activated with no healthy member, spec.md §4.1
/// last line), in which case every member is offered in priority order.
pub fn order_candidates(
    strategy: SelectionStrategy,
    members: &[Endpoint],
    runtime: &HashMap<String, EndpointRuntime>,
    rr_cursor: &mut usize,
    force_last_resort: bool,
) -> Vec<Endpoint> {
    let is_healthy = |ep: &Endpoint| -> bool {
        runtime
            .get(&ep.name)
            .map(|r| !r.never_checked && r.healthy)
            .unwrap_or(false)
    };

    if force_last_resort && !members.iter().any(is_healthy) {
        let mut all: Vec<Endpoint> = members.to_vec();
        all.sort_by_key(|e| e.priority);
        return all;
    }

    let healthy: Vec<Endpoint> = members.iter().filter(|e| is_healthy(e)).cloned().collect();

    match strategy {
        SelectionStrategy::Priority => {
            let mut ordered = healthy;
            ordered.sort_by_key(|e| e.priority);
            ordered
        }
        SelectionStrategy::Fastest => {
            let mut ordered = healthy;
            ordered.sort_by_key(|e| {
                runtime
                    .get(&e.name)
                    .and_then(|r| r.response_time_ms)
                    .unwrap_or(u64::MAX)
            });
            ordered
        }
        SelectionStrategy::RoundRobin => {
            if healthy.is_empty() {
                return Vec::new();
            }
            let start = *rr_cursor % healthy.len();
            *rr_cursor = (start + 1) % healthy.len().max(1);
            let mut ordered = Vec::with_capacity(healthy.len());
            for i in 0..healthy.len() {
                ordered.push(healthy[(start + i) % healthy.len()].clone());
            }
            ordered
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EndpointAuth;
    use pretty_assertions::assert_eq;

    fn ep(name: &str, priority: i32) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            url: format!("https://{name}.example"),
            group: "g".to_string(),
            group_priority: 0,
            priority,
            auth: EndpointAuth::default(),
            timeout_ms: None,
            proxy_url: None,
        }
    }

    fn healthy_runtime() -> EndpointRuntime {
        EndpointRuntime {
            healthy: true,
            never_checked: false,
            ..EndpointRuntime::new()
        }
    }

    #[test]
    fn priority_orders_ascending_and_skips_unhealthy() {
        let members = vec![ep("a", 2), ep("b", 1), ep("c", 0)];
        let mut runtime = HashMap::new();
        runtime.insert("a".to_string(), healthy_runtime());
        runtime.insert("b".to_string(), healthy_runtime());
        // c left never_checked -> excluded.
        let mut cursor = 0;
        let ordered = order_candidates(
            SelectionStrategy::Priority,
            &members,
            &runtime,
            &mut cursor,
            false,
        );
        assert_eq!(
            ordered.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
    }

    #[test]
    fn fastest_orders_by_response_time_unhealthy_excluded() {
        let members = vec![ep("a", 0), ep("b", 0)];
        let mut runtime = HashMap::new();
        runtime.insert(
            "a".to_string(),
            EndpointRuntime {
                response_time_ms: Some(200),
                ..healthy_runtime()
            },
        );
        runtime.insert(
            "b".to_string(),
            EndpointRuntime {
                response_time_ms: Some(50),
                ..healthy_runtime()
            },
        );
        let mut cursor = 0;
        let ordered = order_candidates(
            SelectionStrategy::Fastest,
            &members,
            &runtime,
            &mut cursor,
            false,
        );
        assert_eq!(
            ordered.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
    }

    #[test]
    fn round_robin_rotates_cursor() {
        let members = vec![ep("a", 0), ep("b", 0), ep("c", 0)];
        let mut runtime = HashMap::new();
        for e in &members {
            runtime.insert(e.name.clone(), healthy_runtime());
        }
        let mut cursor = 0;
        let first = order_candidates(
            SelectionStrategy::RoundRobin,
            &members,
            &runtime,
            &mut cursor,
            false,
        );
        assert_eq!(first[0].name, "a");
        let second = order_candidates(
            SelectionStrategy::RoundRobin,
            &members,
            &runtime,
            &mut cursor,
            false,
        );
        assert_eq!(second[0].name, "b");
    }

    #[test]
    fn force_last_resort_offers_all_in_priority_order_when_none_healthy() {
        let members = vec![ep("a", 2), ep("b", 1)];
        let runtime = HashMap::new();
        let mut cursor = 0;
        let ordered = order_candidates(
            SelectionStrategy::Priority,
            &members,
            &runtime,
            &mut cursor,
            true,
        );
        assert_eq!(
            ordered.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
    }
}
