#[cfg(test)]
mod consistent_hash_policy_tests {
    use std::collections::{HashMap, HashSet};

    use llm_dispatcher_rs::core::{Endpoint, EndpointGroup, EndpointSpec, LoadBalancing};
    use llm_dispatcher_rs::policies::{
        hash_key, load_ok, EndpointView, HashRing, LoadBalancingPolicy, PolicyFactory,
        RoutingHints,
    };
    use llm_dispatcher_rs::protocols::request::Request;
    use tokio_util::sync::CancellationToken;

    fn endpoints(names: &[&str]) -> HashMap<String, Endpoint> {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    Endpoint::new(format!("{n}:8000"), HashSet::new()),
                )
            })
            .collect()
    }

    fn ring(names: &[&str], replication: u32) -> HashRing {
        let mut ring = HashRing::new(replication);
        for name in names {
            ring.add(name);
        }
        ring
    }

    fn routing_key_lb() -> LoadBalancing {
        LoadBalancing::RoutingKey {
            mean_load_percentage: 125,
            replication: 256,
            fallback_to_least_load: true,
        }
    }

    fn two_endpoint_group() -> EndpointGroup {
        let group = EndpointGroup::new("m", 256);
        group.reconcile(HashMap::from([
            ("a".to_string(), EndpointSpec::new("10.0.0.1:8000", Vec::<String>::new())),
            ("b".to_string(), EndpointSpec::new("10.0.0.2:8000", Vec::<String>::new())),
        ]));
        group
    }

    #[test]
    fn test_ring_has_replication_points_per_endpoint() {
        let r = ring(&["a", "b", "c"], 256);
        assert_eq!(r.len(), 3 * 256);
        assert_eq!(r.replication(), 256);
    }

    #[test]
    fn test_remove_then_add_restores_identical_ring() {
        let mut r = ring(&["a", "b", "c"], 64);
        let before = r.hashes();

        r.remove("b");
        assert_eq!(r.len(), 2 * 64);
        r.add("b");

        assert_eq!(r.hashes(), before);
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let eps = endpoints(&["a", "b", "c"]);
        let r = ring(&["a", "b", "c"], 256);

        let first = r.lookup("some prompt", "", 1.25, &eps, 0).unwrap().to_string();
        for _ in 0..10 {
            assert_eq!(r.lookup("some prompt", "", 1.25, &eps, 0), Some(first.as_str()));
        }
    }

    #[test]
    fn test_lookup_skips_endpoints_without_adapter() {
        let mut eps = endpoints(&["a", "b"]);
        eps.insert(
            "c".to_string(),
            Endpoint::new("c:8000".to_string(), HashSet::from(["lora".to_string()])),
        );
        let r = ring(&["a", "b", "c"], 64);

        for key in ["x", "y", "z", "hello", "world"] {
            assert_eq!(r.lookup(key, "lora", 1.25, &eps, 0), Some("c"));
        }
        assert_eq!(r.lookup("x", "missing", 1.25, &eps, 0), None);
    }

    #[test]
    fn test_empty_ring_lookup_is_none() {
        let r = HashRing::new(16);
        assert!(r.is_empty());
        assert_eq!(r.lookup("k", "", 1.25, &HashMap::new(), 0), None);
    }

    #[test]
    fn test_load_bound() {
        assert!(load_ok(0, 0, 2, 1.25));
        assert!(load_ok(5, 0, 2, 1.25));
        // avg (3+1)/2 = 2, bound 2.5
        assert!(load_ok(1, 3, 2, 1.25));
        assert!(!load_ok(2, 3, 2, 1.25));
    }

    #[test]
    fn test_hash_key_is_stable() {
        assert_eq!(hash_key("abc"), hash_key("abc"));
        assert_ne!(hash_key("abc"), hash_key("abd"));
    }

    #[test]
    fn test_policy_requires_key_without_fallback() {
        let policy = PolicyFactory::create_from_config(&LoadBalancing::RoutingKey {
            mean_load_percentage: 125,
            replication: 16,
            fallback_to_least_load: false,
        });
        let eps = endpoints(&["a"]);
        let r = ring(&["a"], 16);
        let view = EndpointView {
            endpoints: &eps,
            ring: &r,
            total_in_flight: 0,
        };
        assert!(policy
            .select_endpoint(&view, &RoutingHints::default())
            .is_err());
        assert_eq!(
            policy
                .select_endpoint(
                    &view,
                    &RoutingHints {
                        routing_key: "k",
                        ..Default::default()
                    }
                )
                .unwrap(),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn test_routing_key_requests_stick_to_one_address() {
        let group = two_endpoint_group();
        let cancel = CancellationToken::new();

        for key in ["key-A", "key-B"] {
            let request = Request::new("m", routing_key_lb()).with_routing_key(key);
            let mut seen = HashSet::new();
            for _ in 0..10 {
                let (address, guard) = group.get_best_address(&cancel, &request, false).await.unwrap();
                seen.insert(address);
                guard.release();
            }
            assert_eq!(seen.len(), 1, "{key} spread over {seen:?}");
        }
        assert_eq!(group.total_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_missing_routing_key_falls_back_to_least_load() {
        let group = two_endpoint_group();
        let cancel = CancellationToken::new();

        let keyed = Request::new("m", routing_key_lb()).with_routing_key("key-A");
        let (busy, _guard) = group.get_best_address(&cancel, &keyed, false).await.unwrap();

        let unkeyed = Request::new("m", routing_key_lb());
        let (address, guard) = group.get_best_address(&cancel, &unkeyed, false).await.unwrap();
        assert_ne!(address, busy);
        guard.release();
    }

    #[tokio::test]
    async fn test_bounded_load_moves_off_a_hot_endpoint() {
        let group = two_endpoint_group();
        let cancel = CancellationToken::new();
        let request = Request::new("m", routing_key_lb()).with_routing_key("hot");

        let (first, _g1) = group.get_best_address(&cancel, &request, false).await.unwrap();
        // total=1, avg=(1+1)/2=1, bound 1.25: the holder of one request is full
        let (second, _g2) = group.get_best_address(&cancel, &request, false).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(group.total_in_flight(), 2);
    }
}
