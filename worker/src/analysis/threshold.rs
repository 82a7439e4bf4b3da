use rayon::prelude::*;

/// Noise-rejection margin, in standard deviations above the mean.
pub const SIGMA_MULTIPLIER: f64 = 5.0;

/// Intensity statistics of one frame and the spot threshold derived from them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdStatistic {
    pub mean: f64,
    pub stddev: f64,
    pub threshold: i32,
    /// Brightest pixel, floored at 0.
    pub max: i32,
}

impl ThresholdStatistic {
    /// Derive the statistic from the first two raw moments of `n` values.
    ///
    /// Variance is clamped at zero: `sum_sq/n - mean^2` can come out slightly
    /// negative through cancellation when all values are (nearly) equal.
    pub fn from_moments(sum: f64, sum_sq: f64, max: i32, n: usize) -> Self {
        if n == 0 {
            return Self {
                mean: 0.0,
                stddev: 0.0,
                threshold: 0,
                max: 0,
            };
        }
        let n = n as f64;
        let mean = sum / n;
        let variance = (sum_sq / n - mean * mean).max(0.0);
        let stddev = variance.sqrt();
        // `as` saturates at the i32 bounds.
        let threshold = (mean + SIGMA_MULTIPLIER * stddev).round() as i32;
        Self {
            mean,
            stddev,
            threshold,
            max,
        }
    }
}

/// Mean, standard deviation, `mean + 5 sigma` threshold and maximum of
/// `pixels`, accumulated with one parallel fold/reduce on the current rayon
/// pool. Moments are summed in f64.
pub fn estimate(pixels: &[i32]) -> ThresholdStatistic {
    let (sum, sum_sq, max) = pixels
        .par_iter()
        .fold(
            || (0.0f64, 0.0f64, 0i32),
            |(sum, sum_sq, max), &px| {
                let v = px as f64;
                (sum + v, sum_sq + v * v, max.max(px))
            },
        )
        .reduce(
            || (0.0, 0.0, 0),
            |a, b| (a.0 + b.0, a.1 + b.1, a.2.max(b.2)),
        );
    ThresholdStatistic::from_moments(sum, sum_sq, max, pixels.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn constant_frame_has_zero_spread() {
        let pixels = vec![42; 10_000];
        let stat = estimate(&pixels);
        assert_relative_eq!(stat.mean, 42.0);
        assert_relative_eq!(stat.stddev, 0.0);
        assert_eq!(stat.threshold, 42);
    }

    #[test]
    fn two_level_frame_matches_closed_form() {
        // Half 0, half 10: mean 5, population stddev 5, threshold 5 + 25.
        let pixels: Vec<i32> = (0..1000).map(|i| if i % 2 == 0 { 0 } else { 10 }).collect();
        let stat = estimate(&pixels);
        assert_relative_eq!(stat.mean, 5.0);
        assert_relative_eq!(stat.stddev, 5.0, epsilon = 1e-9);
        assert_eq!(stat.threshold, 30);
    }

    #[test]
    fn single_peak_frame() {
        let mut pixels = vec![0; 100];
        pixels[55] = 1000;
        let stat = estimate(&pixels);
        assert_relative_eq!(stat.mean, 10.0);
        assert_relative_eq!(stat.stddev, 9900f64.sqrt(), epsilon = 1e-9);
        assert_eq!(stat.threshold, 507);
        assert_eq!(stat.max, 1000);
    }

    #[test]
    fn max_tracks_brightest_pixel() {
        let mut pixels: Vec<i32> = (0..10_000).map(|i| (i % 97) as i32).collect();
        pixels[7_321] = 65_535;
        assert_eq!(estimate(&pixels).max, 65_535);
    }

    #[test]
    fn max_is_floored_at_zero() {
        let pixels = vec![-5; 64];
        assert_eq!(estimate(&pixels).max, 0);
    }

    #[test]
    fn large_values_do_not_overflow() {
        let pixels = vec![i32::MAX; 4096];
        let stat = estimate(&pixels);
        assert_relative_eq!(stat.mean, i32::MAX as f64);
        assert_eq!(stat.threshold, i32::MAX);
        assert_eq!(stat.max, i32::MAX);
    }

    #[test]
    fn empty_frame_yields_zero() {
        let stat = estimate(&[]);
        assert_eq!(stat.threshold, 0);
        assert_eq!(stat.mean, 0.0);
        assert_eq!(stat.max, 0);
    }

    #[test]
    fn result_independent_of_pool_size() {
        let pixels: Vec<i32> = (0..200_003).map(|i| ((i * 7919) % 1013) as i32 - 300).collect();
        let results: Vec<ThresholdStatistic> = [1, 2, 3, 8]
            .iter()
            .map(|&threads| {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .unwrap()
                    .install(|| estimate(&pixels))
            })
            .collect();
        for stat in &results[1..] {
            assert_relative_eq!(stat.mean, results[0].mean, max_relative = 1e-12);
            assert_relative_eq!(stat.stddev, results[0].stddev, max_relative = 1e-12);
            assert_eq!(stat.threshold, results[0].threshold);
            assert_eq!(stat.max, results[0].max);
        }
    }
}
