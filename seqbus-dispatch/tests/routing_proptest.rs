//! Property tests for aggregate key routing.

use proptest::prelude::*;
use seqbus_dispatch::{fnv1a_32, LaneRouter};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn route_is_always_in_range(key in ".{0,64}", lanes in 1usize..4096) {
        let router = LaneRouter::new(lanes).unwrap();
        prop_assert!(router.route(&key) < lanes);
    }

    #[test]
    fn route_is_stable_across_routers(key in "[A-Za-z0-9:_./-]{1,256}", lanes in 1usize..4096) {
        let first = LaneRouter::new(lanes).unwrap();
        let second = LaneRouter::new(lanes).unwrap();
        prop_assert_eq!(first.route(&key), second.route(&key));
        prop_assert_eq!(first.route(&key), first.route(&key.clone()));
    }

    #[test]
    fn route_matches_hash_modulo(key in any::<String>(), lanes in 1usize..1_048_576) {
        let router = LaneRouter::new(lanes).unwrap();
        prop_assert_eq!(router.route(&key), fnv1a_32(key.as_bytes()) as usize % lanes);
    }

    #[test]
    fn single_lane_takes_everything(key in any::<String>()) {
        prop_assert_eq!(LaneRouter::new(1).unwrap().route(&key), 0);
    }
}

#[test]
fn keys_spread_over_lanes() {
    let router = LaneRouter::new(16).unwrap();
    let mut counts = [0usize; 16];
    for i in 0..16_000 {
        counts[router.route(&format!("order-{i}"))] += 1;
    }
    // Uniform would be 1000 per lane.
    assert!(counts.iter().all(|&c| (500..1500).contains(&c)), "skewed distribution: {counts:?}");
}
