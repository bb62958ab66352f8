//! Time-base helpers shared by the planner, the live engine and the visual loop.

use rand::Rng;

/// Clamp `v` into `[lo, hi]`. NaN collapses to `lo`.
pub fn clamp(v: f64, lo: f64, hi: f64) -> f64 {
    if v.is_nan() {
        return lo;
    }
    v.max(lo).min(hi)
}

/// Clamp into the unit interval.
pub fn clamp01(v: f64) -> f64 {
    clamp(v, 0.0, 1.0)
}

/// Linear interpolation; `t` is not clamped.
pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Uniform integer in `[min, max]` inclusive. Returns `min` when the range is empty.
pub fn rand_int<R: Rng + ?Sized>(rng: &mut R, min: i64, max: i64) -> i64 {
    if max <= min {
        return min;
    }
    rng.gen_range(min..=max)
}

/// Uniform float in `[min, max)`, used for multiplicative jitter factors.
pub fn rand_factor<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64) -> f64 {
    if max <= min {
        return min;
    }
    rng.gen_range(min..max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_clamp_bounds() {
        assert_eq!(clamp(5.0, 0.0, 3.0), 3.0);
        assert_eq!(clamp(-1.0, 0.0, 3.0), 0.0);
        assert_eq!(clamp01(0.4), 0.4);
        assert_eq!(clamp01(f64::NAN), 0.0);
    }

    #[test]
    fn test_lerp_endpoints() {
        assert_eq!(lerp(0.35, 0.75, 0.0), 0.35);
        assert!((lerp(0.35, 0.75, 1.0) - 0.75).abs() < 1e-12);
        assert!((lerp(1.22, 0.82, 0.5) - 1.02).abs() < 1e-12);
    }

    #[test]
    fn test_rand_int_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let v = rand_int(&mut rng, -8, 8);
            assert!((-8..=8).contains(&v));
        }
        assert_eq!(rand_int(&mut rng, 3, 3), 3);
        assert_eq!(rand_int(&mut rng, 5, 1), 5);
    }

    #[test]
    fn test_rand_factor_range() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let f = rand_factor(&mut rng, 0.88, 1.12);
            assert!((0.88..1.12).contains(&f));
        }
    }
}
