//! Statistics used to turn raw samples into published results.

/// Throughput computed over a measurement window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bandwidth {
    /// Bytes per second after overhead compensation
    pub byte_rate: f64,
    /// Bits per second after overhead compensation
    pub bit_rate: f64,
}

/// Compute the bandwidth for `bytes` transferred over `elapsed_secs`.
///
/// The payload rate is multiplied by `overhead` to approximate the rate on
/// the wire. Returns `None` when the window is empty or the rate would not
/// be finite, so callers never publish `inf` or `NaN`.
pub fn compute_bandwidth(
    bytes: u64,
    elapsed_secs: f64,
    overhead: f64,
) -> Option<Bandwidth> {
    if elapsed_secs.is_nan() || elapsed_secs <= 0.0 {
        return None;
    }

    let byte_rate = bytes as f64 / elapsed_secs * overhead;
    if !byte_rate.is_finite() {
        return None;
    }

    Some(Bandwidth { byte_rate, bit_rate: 8.0 * byte_rate })
}

/// Compute jitter with the RFC 1889 estimator: `J += (|D(i-1,i)| - J) / 16`.
///
/// Fewer than two samples yield 0.
pub fn compute_jitter(latencies: &[f64]) -> f64 {
    latencies
        .windows(2)
        .fold(0.0, |jitter, pair| {
            jitter + ((pair[0] - pair[1]).abs() - jitter) / 16.0
        })
}

/// Round to two decimals, the precision results are published with.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Running latency summary over every collected sample.
///
/// Each push refines the summary in O(1): `min` only decreases, `max`
/// only increases and the jitter estimator advances one step.
#[derive(Debug, Clone, Default)]
pub struct LatencySummary {
    count: usize,
    sum: f64,
    min: f64,
    max: f64,
    jitter: f64,
    last: Option<f64>,
}

impl LatencySummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, latency_ms: f64) {
        if self.count == 0 {
            self.min = latency_ms;
            self.max = latency_ms;
        } else {
            self.min = self.min.min(latency_ms);
            self.max = self.max.max(latency_ms);
        }

        if let Some(last) = self.last {
            self.jitter += ((last - latency_ms).abs() - self.jitter) / 16.0;
        }

        self.last = Some(latency_ms);
        self.sum += latency_ms;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

impl FromIterator<f64> for LatencySummary {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut summary = LatencySummary::new();
        for latency in iter {
            summary.push(latency);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bandwidth() {
        let bandwidth = compute_bandwidth(1_048_576, 1.0, 1.0).unwrap();
        assert!((bandwidth.byte_rate - 1_048_576.0).abs() < 1e-9);
        assert!((bandwidth.bit_rate - 8_388_608.0).abs() < 1e-9);
    }

    #[test]
    fn test_bandwidth_applies_overhead() {
        let overhead = 1500.0 / 1446.0;
        let bandwidth = compute_bandwidth(1446, 1.0, overhead).unwrap();
        assert!((bandwidth.byte_rate - 1500.0).abs() < 1e-9);
    }

    #[test]
    fn test_bandwidth_requires_positive_window() {
        assert!(compute_bandwidth(1_000_000, 0.0, 1.0).is_none());
        assert!(compute_bandwidth(1_000_000, -1.0, 1.0).is_none());
        assert!(compute_bandwidth(1_000_000, f64::NAN, 1.0).is_none());
    }

    #[test]
    fn test_jitter_constant_latency_is_zero() {
        assert_eq!(compute_jitter(&[10.0, 10.0, 10.0, 10.0]), 0.0);
    }

    #[test]
    fn test_jitter_single_step() {
        assert!((compute_jitter(&[0.0, 32.0]) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_jitter_too_few_samples() {
        assert_eq!(compute_jitter(&[]), 0.0);
        assert_eq!(compute_jitter(&[42.0]), 0.0);
    }

    #[test]
    fn test_summary_empty() {
        let summary = LatencySummary::new();
        assert!(summary.is_empty());
        assert_eq!(summary.min(), None);
        assert_eq!(summary.avg(), None);
        assert_eq!(summary.jitter(), 0.0);
    }

    #[test]
    fn test_summary_values() {
        let summary: LatencySummary = [20.0, 10.0, 30.0].into_iter().collect();
        assert_eq!(summary.min(), Some(10.0));
        assert_eq!(summary.max(), Some(30.0));
        assert_eq!(summary.avg(), Some(20.0));
        assert_eq!(summary.count(), 3);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(1.23456), 1.23);
        assert_eq!(round2(50.0), 50.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: for any non-empty latency sequence, min <= avg <= max
        /// and jitter is never negative.
        #[test]
        fn summary_bounds(
            latencies in prop::collection::vec(0.0f64..5_000.0, 1..200)
        ) {
            let summary: LatencySummary = latencies.iter().copied().collect();
            let min = summary.min().unwrap();
            let avg = summary.avg().unwrap();
            let max = summary.max().unwrap();

            prop_assert!(min <= avg + 1e-9, "min {} > avg {}", min, avg);
            prop_assert!(avg <= max + 1e-9, "avg {} > max {}", avg, max);
            prop_assert!(summary.jitter() >= 0.0);
        }

        /// Property: the incremental estimator agrees with the batch one.
        #[test]
        fn incremental_jitter_matches_batch(
            latencies in prop::collection::vec(0.0f64..1_000.0, 0..100)
        ) {
            let summary: LatencySummary = latencies.iter().copied().collect();
            let batch = compute_jitter(&latencies);
            prop_assert!((summary.jitter() - batch).abs() < 1e-6);
        }

        /// Property: min never increases and max never decreases as
        /// samples arrive.
        #[test]
        fn summary_is_monotonic(
            latencies in prop::collection::vec(0.0f64..1_000.0, 1..100)
        ) {
            let mut summary = LatencySummary::new();
            let mut last_min = f64::INFINITY;
            let mut last_max = f64::NEG_INFINITY;

            for latency in latencies {
                summary.push(latency);
                let min = summary.min().unwrap();
                let max = summary.max().unwrap();
                prop_assert!(min <= last_min);
                prop_assert!(max >= last_max);
                last_min = min;
                last_max = max;
            }
        }
    }
}
