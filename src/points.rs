use rand::{rngs::StdRng, Rng, SeedableRng};

/// Points evaluated when the caller does not say otherwise.
pub const DEFAULT_POINT_COUNT: usize = 100;

/// Draws `count` points in `0.01..=100.00` with two decimals. A seed makes
/// the draw reproducible.
pub fn generate(count: usize, seed: Option<u64>) -> Vec<f64> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    (0..count)
        .map(|_| rng.gen_range(1..=10_000u32) as f64 / 100.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_stay_in_range_with_two_decimals() {
        for x in generate(500, Some(7)) {
            assert!((0.01..=100.0).contains(&x));
            let hundredths = x * 100.0;
            assert!((hundredths - hundredths.round()).abs() < 1e-6);
        }
    }

    #[test]
    fn seed_makes_runs_repeatable() {
        assert_eq!(generate(20, Some(42)), generate(20, Some(42)));
        assert_ne!(generate(20, Some(42)), generate(20, Some(43)));
    }

    #[test]
    fn zero_points() {
        assert!(generate(0, None).is_empty());
    }
}
