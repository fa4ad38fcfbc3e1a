use proptest::prelude::*;
use traffic_controller::weight::calculate_weight;

proptest! {
    #[test]
    fn matches_integer_ceiling(desired in 0i64..=100, override_pct in 0u32..=100) {
        let expected = (desired as u32 * override_pct).div_ceil(100);
        prop_assert_eq!(calculate_weight(desired, override_pct as f64).unwrap(), expected);
    }

    #[test]
    fn never_exceeds_one_hundred(desired in 0i64..=1_000, override_pct in 0.0f64..=1_000.0) {
        prop_assert!(calculate_weight(desired, override_pct).unwrap() <= 100);
    }

    #[test]
    fn monotonic_in_desired(desired in 0i64..100, override_pct in 0.0f64..=100.0) {
        prop_assert!(calculate_weight(desired, override_pct).unwrap() <= calculate_weight(desired + 1, override_pct).unwrap());
    }

    #[test]
    fn inputs_above_one_hundred_clamp(desired in 100i64..10_000, override_pct in 100.0f64..10_000.0) {
        prop_assert_eq!(calculate_weight(desired, override_pct).unwrap(), 100);
    }

    #[test]
    fn negatives_are_rejected(desired in i64::MIN..0, override_pct in -1_000.0f64..-0.001) {
        prop_assert!(calculate_weight(desired, 10.0).is_err());
        prop_assert!(calculate_weight(10, override_pct).is_err());
    }
}
